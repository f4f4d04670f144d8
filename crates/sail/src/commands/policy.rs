use std::sync::Arc;

use repopo::{policies, Mode, PolicyEngine};

use crate::{cli::PolicyCommand, Error};

pub async fn policy(action: PolicyCommand, verbose: bool) -> Result<i32, Error> {
    let (path, mode) = match action {
        PolicyCommand::Check { path } => (path, Mode::Check),
        PolicyCommand::Fix { path } => (path, Mode::Fix),
    };
    let root = super::search_path(path)?;

    let mut engine = PolicyEngine::new(root, mode).with_instances(policies::default_instances());
    if verbose {
        engine = engine.with_telemetry();
    }
    let report = Arc::new(engine).run().await?;

    for failure in &report.failures {
        println!(
            "{}: {}: {}",
            failure.policy_name,
            failure.file,
            failure.messages.join("; ")
        );
        if let Some(hint) = &failure.manual_fix {
            println!("  fix: {hint}");
        }
    }
    for fix in &report.fix_results {
        let outcome = if fix.resolved { "resolved" } else { "fix failed" };
        println!(
            "{}: {}: {} ({outcome})",
            fix.failure.policy_name,
            fix.failure.file,
            fix.failure.messages.join("; ")
        );
    }

    println!(
        "{} files processed, {} excluded, {} total",
        report.files_processed, report.files_excluded, report.files_total
    );
    if mode == Mode::Fix {
        println!("{} fixes applied", report.fixes_applied());
    }
    for (policy, action, elapsed) in &report.timings {
        println!("  {policy} {}: {}ms", action.label(), elapsed.as_millis());
    }

    Ok(if report.passed() { 0 } else { 1 })
}
