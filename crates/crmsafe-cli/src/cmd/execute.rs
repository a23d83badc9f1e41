use super::Context;
use anyhow::Context as _;
use crmsafe_core::config::FailurePolicy;
use crmsafe_core::plan::ActionPlan;
use std::path::Path;

pub fn run(
    ctx: &Context,
    plan_path: &Path,
    abort_on_failure: bool,
    skip_unconfirmed: bool,
) -> anyhow::Result<()> {
    let plan = ActionPlan::load(plan_path)
        .with_context(|| format!("failed to load plan {}", plan_path.display()))?;
    let config = ctx.run_config()?;
    let store = ctx.store(&config);

    let policy = if abort_on_failure {
        FailurePolicy::Abort
    } else {
        config.execution.failure_policy
    };
    let skip_unconfirmed = skip_unconfirmed || config.execution.skip_unconfirmed;

    tracing::info!(
        plan_id = %plan.id,
        actions = plan.actions.len(),
        estimated_api_calls = plan.estimated_api_calls(),
        "executing plan"
    );

    let record = super::runtime()?.block_on(async {
        let mut executor = super::executor(ctx, &config)?.with_skip_unconfirmed(skip_unconfirmed);
        let record = executor.execute_plan(&plan, policy).await;
        executor.shutdown();
        anyhow::Ok(record?)
    })?;

    super::report(&record, &store, ctx.json)
}
