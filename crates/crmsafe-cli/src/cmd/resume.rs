use super::Context;
use anyhow::Context as _;
use crmsafe_core::plan::ActionPlan;
use std::path::Path;

pub fn run(ctx: &Context, plan_path: &Path, record: Option<&Path>) -> anyhow::Result<()> {
    let plan = ActionPlan::load(plan_path)
        .with_context(|| format!("failed to load plan {}", plan_path.display()))?;
    let config = ctx.run_config()?;
    let store = ctx.store(&config);

    let prior = match record {
        Some(arg) => super::load_record(&store, arg)?,
        None => store
            .latest_resumable(&plan.id)?
            .with_context(|| format!("nothing to resume: no interrupted run of plan '{}'", plan.id))?,
    };

    tracing::info!(
        prior = %prior.id,
        resume_from = prior.resume_from.as_deref().unwrap_or("<start>"),
        "resuming execution"
    );

    let record = super::runtime()?.block_on(async {
        let mut executor = super::executor(ctx, &config)?;
        let record = executor.resume_execution(&prior, &plan).await;
        executor.shutdown();
        anyhow::Ok(record?)
    })?;

    super::report(&record, &store, ctx.json)
}
