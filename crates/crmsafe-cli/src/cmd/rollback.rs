use super::Context;
use std::path::Path;

pub fn run(ctx: &Context, record: &Path) -> anyhow::Result<()> {
    let config = ctx.run_config()?;
    let store = ctx.store(&config);
    let original = super::load_record(&store, record)?;

    tracing::info!(
        execution_id = %original.id,
        reversible = original.reversible_successes().count(),
        "rolling back execution"
    );

    let rollback = super::runtime()?.block_on(async {
        let mut executor = super::executor(ctx, &config)?;
        let record = executor.rollback_execution(&original).await;
        executor.shutdown();
        anyhow::Ok(record?)
    })?;

    super::report(&rollback, &store, ctx.json)
}
