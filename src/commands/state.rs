//! `converge state` and `converge refresh`

use anyhow::{Context as AnyhowContext, Result, bail};
use chrono::Local;
use colored::Colorize;
use declarative::{EngineContext, StateRecord, StateStore, refresh};

use super::Session;
use crate::Context;
use crate::cli::{RefreshArgs, StateCommand};
use crate::ui;

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<()> {
    let session = Session::open(ctx)?;
    match cmd {
        StateCommand::List => list(&session.store),
        StateCommand::Show { id } => show(&session.store, &id),
        StateCommand::Rm { id, yes } => forget(&session.store, &id, yes),
    }
}

fn list(store: &dyn StateStore) -> Result<()> {
    let records = store.list()?;
    if records.is_empty() {
        ui::info("No resources recorded");
        return Ok(());
    }

    ui::header(&format!("Recorded resources ({})", records.len()));
    for record in &records {
        println!(
            "  {:<28} {:<36} {}",
            record.id.bold(),
            record.resource_type.cyan(),
            format_time(record).dimmed()
        );
    }
    Ok(())
}

fn show(store: &dyn StateStore, id: &str) -> Result<()> {
    let Some(record) = store.get(id)? else {
        bail!("No resource '{id}' in state");
    };

    ui::header(&record.id);
    ui::kv("type", &record.resource_type);
    ui::kv("provider id", &record.provider_id);
    ui::kv("updated", &format_time(&record));
    if !record.dependencies.is_empty() {
        ui::kv("depends on", &record.dependencies.join(", "));
    }

    ui::section("Inputs");
    println!("{}", serde_json::to_string_pretty(&record.inputs)?);
    ui::section("Outputs");
    println!("{}", serde_json::to_string_pretty(&record.outputs)?);
    Ok(())
}

/// Drop a record without touching the real resource
fn forget(store: &dyn StateStore, id: &str, yes: bool) -> Result<()> {
    if store.get(id)?.is_none() {
        bail!("No resource '{id}' in state");
    }

    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!(
                "Forget '{id}'? The resource itself will not be deleted"
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            ui::warn("Cancelled");
            return Ok(());
        }
    }

    store.remove(id)?;
    ui::success(&format!("Removed '{id}' from state"));
    Ok(())
}

pub fn refresh_state(ctx: &Context, args: RefreshArgs) -> Result<()> {
    let session = Session::open(ctx)?;

    let mut options = session.options.clone();
    options.dry_run = args.dry_run;
    if let Some(jobs) = args.jobs {
        options.jobs = jobs.max(1);
    }
    let engine = EngineContext::new(&session.providers, &session.store, &options);

    let summary = refresh(engine).context("Refresh failed")?;

    ui::header("Refresh");
    ui::kv("unchanged", &summary.unchanged.to_string());
    ui::kv("updated", &summary.updated.to_string());
    ui::kv("removed", &summary.removed.to_string());
    if summary.unsupported > 0 {
        ui::kv("not readable", &summary.unsupported.to_string());
    }
    if args.dry_run && summary.updated + summary.removed > 0 {
        ui::dim("Dry run - state not written");
    }

    if !summary.is_success() {
        for (id, error) in &summary.errors {
            ui::error(&format!("{id}: {error}"));
        }
        bail!("{} resource(s) could not be read", summary.errors.len());
    }
    Ok(())
}

fn format_time(record: &StateRecord) -> String {
    record
        .updated_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
