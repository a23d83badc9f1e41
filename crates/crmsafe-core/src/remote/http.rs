//! `RecordClient` over the CRM v3 REST API.
//!
//! One request per call, bearer-token auth, no retries: retry policy belongs
//! to whoever drives the run. HTTP status codes map onto [`RemoteError`]
//! kinds so the executor can tell fatal credential problems from per-action
//! failures.

use super::{PropertyInfo, RecordClient, RemoteError};
use crate::plan::{Action, ActionType};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRecordClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRecordClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Response, RemoteError> {
        let mut req = self
            .http
            .request(method, self.url(path))
            .header(AUTHORIZATION, format!("Bearer {}", self.token));
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        ensure_success(resp).await
    }

    async fn patch_property(
        &self,
        object_type: &str,
        object_id: &str,
        property: &str,
        value: &Value,
    ) -> Result<(), RemoteError> {
        let mut properties = serde_json::Map::new();
        properties.insert(property.to_string(), value.clone());
        self.send(
            Method::PATCH,
            &format!("/crm/v3/objects/{object_type}/{object_id}"),
            &[],
            Some(json!({ "properties": properties })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordClient for HttpRecordClient {
    async fn check_access(&self) -> Result<(), RemoteError> {
        self.send(Method::GET, "/crm/v3/objects/contacts", &[("limit", "1")], None)
            .await?;
        Ok(())
    }

    async fn property_schema(&self, object_type: &str) -> Result<Vec<PropertyInfo>, RemoteError> {
        let resp = self
            .send(
                Method::GET,
                &format!("/crm/v3/properties/{object_type}"),
                &[],
                None,
            )
            .await?;
        let page: PropertiesPage = resp
            .json()
            .await
            .map_err(|e| RemoteError::Transport(format!("invalid schema response: {e}")))?;
        Ok(page
            .results
            .into_iter()
            .map(|p| PropertyInfo {
                name: p.name,
                label: p.label,
                read_only: p.modification_metadata.read_only_value,
            })
            .collect())
    }

    async fn read_property(
        &self,
        object_type: &str,
        object_id: &str,
        property: &str,
    ) -> Result<Value, RemoteError> {
        let resp = self
            .send(
                Method::GET,
                &format!("/crm/v3/objects/{object_type}/{object_id}"),
                &[("properties", property)],
                None,
            )
            .await?;
        let object: ObjectResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Transport(format!("invalid object response: {e}")))?;
        Ok(match object.properties.get(property) {
            Some(v) if !v.is_null() => v.clone(),
            _ => Value::String(String::new()),
        })
    }

    async fn apply(&self, action: &Action) -> Result<(), RemoteError> {
        let target = &action.target;
        let (object_type, object_id) = (target.object_type.as_str(), target.object_id.as_str());
        let change = &action.change;

        match action.action_type {
            ActionType::UpdateProperty | ActionType::SetMarketingStatus => {
                let property = required(action.property(), action, "change.property")?;
                let value = required(change.new_value.as_ref(), action, "change.new_value")?;
                self.patch_property(object_type, object_id, property, value)
                    .await
            }
            ActionType::DeleteRecord => {
                self.send(
                    Method::DELETE,
                    &format!("/crm/v3/objects/{object_type}/{object_id}"),
                    &[],
                    None,
                )
                .await?;
                Ok(())
            }
            ActionType::MergeRecords => {
                let primary = id_string(required(
                    change.new_value.as_ref(),
                    action,
                    "change.new_value (primary record id)",
                )?);
                self.send(
                    Method::POST,
                    &format!("/crm/v3/objects/{object_type}/merge"),
                    &[],
                    Some(json!({ "primaryObjectId": primary, "objectIdToMerge": object_id })),
                )
                .await?;
                Ok(())
            }
            ActionType::RemoveFromList => {
                let list_id = id_string(required(
                    change.current_value.as_ref(),
                    action,
                    "change.current_value (list id)",
                )?);
                self.send(
                    Method::PUT,
                    &format!("/crm/v3/lists/{list_id}/memberships/remove"),
                    &[],
                    Some(json!([object_id])),
                )
                .await?;
                Ok(())
            }
            ActionType::CreateAssociation => {
                let to_type = required(
                    change.property.as_deref(),
                    action,
                    "change.property (associated object type)",
                )?;
                let to_id = id_string(required(
                    change.new_value.as_ref(),
                    action,
                    "change.new_value (associated record id)",
                )?);
                self.send(
                    Method::PUT,
                    &format!(
                        "/crm/v4/objects/{object_type}/{object_id}/associations/default/{to_type}/{to_id}"
                    ),
                    &[],
                    None,
                )
                .await?;
                Ok(())
            }
        }
    }

    async fn write_property(
        &self,
        object_type: &str,
        object_id: &str,
        property: &str,
        value: &Value,
    ) -> Result<(), RemoteError> {
        self.patch_property(object_type, object_id, property, value)
            .await
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PropertiesPage {
    #[serde(default)]
    results: Vec<PropertyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyEntry {
    name: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    modification_metadata: ModificationMetadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModificationMetadata {
    #[serde(default)]
    read_only_value: bool,
}

#[derive(Debug, Deserialize)]
struct ObjectResponse {
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn ensure_success(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after_secs = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let body = resp.text().await.unwrap_or_default();
    let message = error_message(&body);

    Err(match status.as_u16() {
        401 => RemoteError::Auth(message),
        403 => RemoteError::Scope(message),
        429 => RemoteError::RateLimited { retry_after_secs },
        400 | 422 => RemoteError::Validation(message),
        409 => RemoteError::Conflict(message),
        404 => RemoteError::NotFound(message),
        code => RemoteError::Unexpected { status: code, body },
    })
}

/// The API's `message` field when the body is a JSON error, else the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn required<'a, T: ?Sized>(
    field: Option<&'a T>,
    action: &Action,
    name: &str,
) -> Result<&'a T, RemoteError> {
    field.ok_or_else(|| {
        RemoteError::Validation(format!(
            "{} action '{}' is missing {name}",
            action.action_type, action.id
        ))
    })
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
