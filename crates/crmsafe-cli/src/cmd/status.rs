use super::Context;
use crate::output::{print_fields, print_json};
use crmsafe_core::config::WarnLevel;
use crmsafe_core::lock::ExecutionLock;

pub fn run(ctx: &Context) -> anyhow::Result<()> {
    let config = ctx.config()?;
    let reports = config.reports_path(&ctx.root);
    let lock = ExecutionLock::with_expiry(&reports, &config.portal_id, config.lock.expiry());
    let current = lock.current_lock()?;
    let records = ctx.store(&config).list()?;
    let warnings = config.validate();

    if ctx.json {
        return print_json(&serde_json::json!({
            "root": ctx.root,
            "config": config,
            "reports_dir": reports,
            "lock": current,
            "records": records.len(),
            "resumable": records.iter().filter(|r| r.is_resumable()).count(),
            "warnings": warnings,
        }));
    }

    let rl = &config.rate_limit;
    print_fields(&[
        ("Root", ctx.root.display().to_string()),
        (
            "Portal",
            if config.portal_id.is_empty() {
                "(not set)".to_string()
            } else {
                config.portal_id.clone()
            },
        ),
        ("API", config.api_base_url.clone()),
        ("Reports", reports.display().to_string()),
        (
            "Rate limit",
            format!(
                "{} calls per {}ms, {} concurrent",
                rl.max_tokens, rl.refill_interval_ms, rl.max_concurrent
            ),
        ),
        ("Lock expiry", format!("{} min", config.lock.expiry_minutes)),
        ("Cache TTL", format!("{}s", config.cache.ttl_seconds)),
        ("Failure policy", config.execution.failure_policy.to_string()),
        (
            "Lock",
            match &current {
                Some(l) => format!(
                    "held by '{}' until {}",
                    l.execution_id,
                    l.expires_at.to_rfc3339()
                ),
                None => "free".to_string(),
            },
        ),
        ("Records", records.len().to_string()),
    ]);

    for w in &warnings {
        let prefix = match w.level {
            WarnLevel::Warning => "warning",
            WarnLevel::Error => "error",
        };
        println!("[{prefix}] {}", w.message);
    }
    Ok(())
}
