pub mod execute;
pub mod lock;
pub mod record;
pub mod resume;
pub mod rollback;
pub mod status;

use crate::output::{print_fields, print_json, print_table};
use anyhow::{bail, Context as _};
use crmsafe_core::config::{Config, WarnLevel};
use crmsafe_core::executor::{CancelFlag, Executor};
use crmsafe_core::record::{ExecutionRecord, ExecutionStatus, RecordStore};
use crmsafe_core::remote::{HttpRecordClient, RecordClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Global flags shared by every command.
pub struct Context {
    pub root: PathBuf,
    pub portal: Option<String>,
    pub token: Option<String>,
    pub json: bool,
}

impl Context {
    /// Config from `.crmsafe/config.yaml` (defaults if absent) with the
    /// `--portal` override applied.
    pub fn config(&self) -> anyhow::Result<Config> {
        let mut config = Config::load_or_default(&self.root).context("failed to load config")?;
        if let Some(portal) = &self.portal {
            config.portal_id = portal.clone();
        }
        Ok(config)
    }

    pub fn store(&self, config: &Config) -> RecordStore {
        RecordStore::new(config.reports_path(&self.root))
    }

    /// Config checked for everything a mutating run needs.
    fn run_config(&self) -> anyhow::Result<Config> {
        let config = self.config()?;
        let errors: Vec<String> = config
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            bail!("invalid config: {}", errors.join("; "));
        }
        if config.portal_id.trim().is_empty() {
            bail!("no portal id: pass --portal, set CRMSAFE_PORTAL, or set portal_id in config");
        }
        Ok(config)
    }

    fn token(&self) -> anyhow::Result<&str> {
        match self.token.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(t),
            _ => bail!("no API token: pass --token or set CRMSAFE_TOKEN"),
        }
    }
}

/// Build an executor against the HTTP API. Call from inside the runtime.
fn executor(ctx: &Context, config: &Config) -> anyhow::Result<Executor> {
    let client: Arc<dyn RecordClient> = Arc::new(
        HttpRecordClient::new(&config.api_base_url, ctx.token()?)
            .context("failed to build API client")?,
    );
    let executor = Executor::from_config(config, &ctx.root, client)?;
    tokio::spawn(cancel_on_interrupt(executor.cancel_flag()));
    Ok(executor)
}

async fn cancel_on_interrupt(cancel: CancelFlag) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("interrupt received; stopping after the current action");
        cancel.cancel();
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start tokio runtime")
}

/// Load a record given either a path or a bare execution id.
fn load_record(store: &RecordStore, arg: &Path) -> anyhow::Result<ExecutionRecord> {
    let record = if arg.exists() {
        RecordStore::load_path(arg)
    } else {
        store.load(&arg.to_string_lossy())
    };
    record.with_context(|| format!("failed to load execution record {}", arg.display()))
}

/// Print a finished run and turn a non-completed status into a failure exit.
fn report(record: &ExecutionRecord, store: &RecordStore, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(record)?;
    } else {
        print_record(record, store);
    }
    match record.status {
        ExecutionStatus::Completed => Ok(()),
        status => bail!("execution {} ended {}", record.id, status),
    }
}

fn print_record(record: &ExecutionRecord, store: &RecordStore) {
    let mut fields = vec![
        ("Execution", record.id.clone()),
        ("Plan", record.plan_id.clone()),
        ("Portal", record.portal_id.clone()),
        ("Status", record.status.to_string()),
        ("Policy", record.failure_policy.to_string()),
        (
            "Results",
            format!(
                "{} succeeded, {} failed, {} skipped ({} not reversible)",
                record.results.successful,
                record.results.failed,
                record.results.skipped,
                record.results.non_reversible
            ),
        ),
    ];
    if let Some(from) = &record.resume_from {
        fields.push(("Resume from", from.clone()));
    }
    if let Some(prior) = &record.resumed_from {
        fields.push(("Resumed from", prior.clone()));
    }
    if let Some(original) = &record.rollback_of {
        fields.push(("Rollback of", original.clone()));
    }
    if let Some(error) = &record.error {
        fields.push(("Error", error.clone()));
    }
    fields.push(("Record", store.path_for(&record.id).display().to_string()));
    print_fields(&fields);

    if record.actions.is_empty() {
        return;
    }
    println!();
    let rows = record
        .actions
        .iter()
        .map(|a| {
            vec![
                a.action_id.clone(),
                a.status.to_string(),
                if a.is_reversible { "yes" } else { "no" }.to_string(),
                a.error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["ACTION", "STATUS", "REVERSIBLE", "ERROR"], rows);
}
