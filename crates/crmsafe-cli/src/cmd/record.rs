use super::Context;
use crate::output::{print_json, print_table};
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum RecordSubcommand {
    /// List execution records, newest first
    List,

    /// Show one execution record
    Show {
        /// Record file path or execution id
        record: PathBuf,
    },
}

pub fn run(ctx: &Context, subcmd: RecordSubcommand) -> anyhow::Result<()> {
    let config = ctx.config()?;
    let store = ctx.store(&config);
    match subcmd {
        RecordSubcommand::List => {
            let records = store.list()?;
            if ctx.json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!("No execution records.");
                return Ok(());
            }
            let rows = records
                .iter()
                .map(|r| {
                    let kind = if r.rollback_of.is_some() {
                        "rollback"
                    } else if r.resumed_from.is_some() {
                        "resume"
                    } else {
                        "execute"
                    };
                    vec![
                        r.id.clone(),
                        r.plan_id.clone(),
                        kind.to_string(),
                        r.status.to_string(),
                        r.executed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        format!(
                            "{}/{}/{}",
                            r.results.successful, r.results.failed, r.results.skipped
                        ),
                    ]
                })
                .collect();
            print_table(
                &["ID", "PLAN", "KIND", "STATUS", "STARTED", "OK/FAIL/SKIP"],
                rows,
            );
            Ok(())
        }
        RecordSubcommand::Show { record } => {
            let record = super::load_record(&store, &record)?;
            if ctx.json {
                print_json(&record)
            } else {
                super::print_record(&record, &store);
                Ok(())
            }
        }
    }
}
