//! `converge apply` and `converge destroy`

use anyhow::{Context as AnyhowContext, Result, bail};
use colored::Colorize;
use declarative::{
    AutoConfirm, ConfirmCallback, EngineContext, ExecutionReport, FailurePolicy, Plan,
    ResourceStatus, execute,
};

use super::Session;
use super::plan::display_plan;
use crate::Context;
use crate::cli::ApplyArgs;
use crate::progress::TerminalProgress;
use crate::ui;

pub fn apply(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let session = Session::open(ctx)?;
    let decls = session.declarations()?;

    let plan = Plan::build(session.engine(), &decls)
        .context("Planning failed")?
        .filter_by_targets(&args.target);

    run(ctx, &session, plan, &args, "Stack applied")
}

pub fn destroy(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let session = Session::open(ctx)?;

    let plan = Plan::destroy(session.engine())
        .context("Planning destroy failed")?
        .filter_by_targets(&args.target);

    run(ctx, &session, plan, &args, "Stack destroyed")
}

fn run(ctx: &Context, session: &Session, plan: Plan, args: &ApplyArgs, done: &str) -> Result<()> {
    display_plan(&plan, ctx.verbose);

    if !plan.has_changes() {
        return Ok(());
    }

    if args.dry_run {
        println!();
        ui::info("Dry run - no changes made");
        return Ok(());
    }

    let mut options = session.options.clone();
    if let Some(jobs) = args.jobs {
        options.jobs = jobs.max(1);
    }
    if args.halt_on_error {
        options.failure_policy = FailurePolicy::Halt;
    }
    let engine = EngineContext::new(&session.providers, &session.store, &options);

    println!();
    let mut progress = TerminalProgress::new(ctx.quiet);
    let report = if args.yes {
        execute(engine, plan, &mut progress, &mut AutoConfirm)?
    } else {
        let mut confirm = PromptConfirm::default();
        let report = execute(engine, plan, &mut progress, &mut confirm)?;
        if confirm.declined {
            ui::warn("Cancelled");
            return Ok(());
        }
        report
    };

    print_summary(&report, done, ctx.verbose);

    if !report.is_success() {
        bail!("{} resource(s) failed", report.summary.failed);
    }
    Ok(())
}

/// Interactive confirmation, remembering a "no"
#[derive(Default)]
struct PromptConfirm {
    declined: bool,
}

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        use dialoguer::Confirm;

        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?;
        self.declined = !confirmed;
        Ok(confirmed)
    }
}

fn print_summary(report: &ExecutionReport, done: &str, verbose: u8) {
    let summary = &report.summary;

    println!();
    if summary.is_success() {
        println!("  {} {done} successfully!", "✓".green().bold());
    } else {
        println!("  {} {done} with errors", "⚠".yellow().bold());
    }

    let counts = [
        (summary.created, "created"),
        (summary.updated, "updated"),
        (summary.replaced, "replaced"),
        (summary.deleted, "deleted"),
        (summary.unchanged, "unchanged"),
        (summary.failed, "failed"),
        (summary.skipped, "skipped"),
    ];
    for (count, label) in counts {
        if count > 0 {
            println!("    • {count} resources {label}");
        }
    }

    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        ui::section("Failures");
        for outcome in failures {
            if let ResourceStatus::Failed { error } = &outcome.status {
                let attempts = if outcome.attempts > 1 {
                    format!(" (after {} attempts)", outcome.attempts)
                } else {
                    String::new()
                };
                println!("  {} {}: {error}{}", "✗".red(), outcome.id.bold(), attempts.dimmed());
            }
        }
    }

    if verbose > 0 {
        let skipped: Vec<_> = report
            .outcomes
            .iter()
            .filter_map(|o| match &o.status {
                ResourceStatus::Skipped { reason } => Some((o, reason)),
                _ => None,
            })
            .collect();
        if !skipped.is_empty() {
            ui::section("Skipped");
            for (outcome, reason) in skipped {
                ui::kv(&outcome.id, reason);
            }
        }
    }
}
