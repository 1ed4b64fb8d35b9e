//! `converge plan` - preview what apply would change

use anyhow::{Context as AnyhowContext, Result};
use colored::{ColoredString, Colorize};
use declarative::{Action, DiffSummary, Plan, ResourceChange, group_by_type};
use serde::Serialize;

use super::Session;
use crate::Context;
use crate::cli::PlanArgs;

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let session = Session::open(ctx)?;
    let decls = session.declarations()?;

    let plan = Plan::build(session.engine(), &decls)
        .context("Planning failed")?
        .filter_by_targets(&args.target);

    if args.json {
        print_json(&plan)?;
    } else {
        display_plan(&plan, ctx.verbose);
    }
    Ok(())
}

#[derive(Serialize)]
struct PlanDocument<'a> {
    changes: Vec<&'a ResourceChange>,
    waves: Vec<Vec<&'a str>>,
    summary: DiffSummary,
}

fn print_json(plan: &Plan) -> Result<()> {
    let document = PlanDocument {
        changes: plan.changes(),
        waves: plan.waves(),
        summary: plan.summary(),
    };
    let json = serde_json::to_string_pretty(&document).context("Failed to serialize plan")?;
    println!("{json}");
    Ok(())
}

fn action_symbol(action: Action) -> ColoredString {
    let symbol = action.symbol();
    match action {
        Action::Create => symbol.green(),
        Action::Update => symbol.yellow(),
        Action::Replace => symbol.magenta(),
        Action::Delete => symbol.red(),
        Action::NoOp => symbol.dimmed(),
    }
}

/// Print the plan grouped by resource type
///
/// With `verbose`, creates list every property and the apply order is shown.
pub fn display_plan(plan: &Plan, verbose: u8) {
    let changes: Vec<&ResourceChange> = plan
        .changes()
        .into_iter()
        .filter(|c| c.action.is_change())
        .collect();

    if changes.is_empty() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────────┐",
        "Execution Plan".bold()
    );
    println!("│");

    for (resource_type, type_changes) in group_by_type(changes.iter().copied()) {
        println!("│ {}", resource_type.bold());
        for change in type_changes {
            println!(
                "│   {} {:<30} {}",
                action_symbol(change.action),
                change.resource_id,
                format!("({})", change.action).dimmed()
            );
            display_properties(change, verbose);
        }
        println!("│");
    }

    if verbose > 0 {
        println!("│ {}", "Apply order".bold());
        for (i, wave) in plan.waves().iter().enumerate() {
            println!("│   {} {}", format!("{}.", i + 1).dimmed(), wave.join(", "));
        }
        println!("│");
    }

    let summary = plan.summary();
    println!("├─────────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} changes ({} to create, {} to update, {} to replace, {} to delete)",
        summary.total().to_string().bold(),
        summary.creates.to_string().green(),
        summary.updates.to_string().yellow(),
        summary.replaces.to_string().magenta(),
        summary.deletes.to_string().red()
    );
    println!("└─────────────────────────────────────────────────────────┘");
}

fn display_properties(change: &ResourceChange, verbose: u8) {
    let old = change.old_inputs.as_ref();
    let new = change.new_inputs.as_ref();

    match change.action {
        Action::Create if verbose == 0 => {
            for name in &change.unknown {
                print_unknown(name);
            }
        }
        Action::Delete | Action::NoOp => {}
        _ => {
            for name in change.changed_properties() {
                if change.unknown.contains(&name) {
                    print_unknown(&name);
                    continue;
                }
                let before = old.and_then(|bag| bag.get(&name));
                let after = new.and_then(|bag| bag.get(&name));
                print_property(&name, before, after);
            }
        }
    }
}

fn print_unknown(name: &str) {
    println!(
        "│       {} {}: {}",
        "~".yellow(),
        name,
        "(known after apply)".dimmed()
    );
}

fn print_property(name: &str, before: Option<&serde_json::Value>, after: Option<&serde_json::Value>) {
    match (before, after) {
        (None, Some(value)) => println!("│       {} {name}: {}", "+".green(), compact(value)),
        (Some(value), None) => println!("│       {} {name}: {}", "-".red(), compact(value)),
        (Some(old), Some(new)) => {
            let (old_text, new_text) = (pretty(old), pretty(new));
            if !old_text.contains('\n') && !new_text.contains('\n') {
                println!(
                    "│       {} {name}: {} → {}",
                    "~".yellow(),
                    old_text.dimmed(),
                    new_text
                );
                return;
            }
            println!("│       {} {name}:", "~".yellow());
            print_text_diff(&old_text, &new_text);
        }
        (None, None) => {}
    }
}

/// Line diff of two pretty-printed values
fn print_text_diff(old: &str, new: &str) {
    let diff = similar::TextDiff::from_lines(old, new);
    for change in diff.iter_all_changes() {
        let line = change.to_string_lossy();
        let line = line.trim_end_matches('\n');
        match change.tag() {
            similar::ChangeTag::Delete => println!("│         {}", format!("- {line}").red()),
            similar::ChangeTag::Insert => println!("│         {}", format!("+ {line}").green()),
            similar::ChangeTag::Equal => println!("│           {}", line.dimmed()),
        }
    }
}

fn compact(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}
