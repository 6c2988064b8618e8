use crate::app::App;
use colored::Colorize;
use gitcloud_cloud::{EntryOutcome, TeardownEngine, validate_session_id};

pub async fn handle(app: &App, session_id: &str) -> anyhow::Result<()> {
    validate_session_id(session_id)?;
    let store = app.store();
    if !store.exists(session_id).await {
        println!(
            "Session {} not found; nothing to tear down",
            session_id.cyan()
        );
        return Ok(());
    }

    let session = store.load(session_id).await?;
    println!(
        "{} {} ({} resources)",
        "Tearing down".yellow().bold(),
        session.id.cyan(),
        session.ledger.len()
    );

    let provider = app.provider(&session.region).await?;
    let report = TeardownEngine::new(provider, store)
        .teardown(session_id)
        .await?;

    for entry in &report.entries {
        let line = format!("{:<18} {}", entry.kind.to_string(), entry.resource_id);
        match &entry.outcome {
            EntryOutcome::Deleted => println!("  {} {}", "✓".green(), line),
            EntryOutcome::AlreadyAbsent => {
                println!("  {} {} {}", "✓".green(), line, "(already gone)".dimmed())
            }
            EntryOutcome::Failed(message) => {
                println!("  {} {} {}", "✗".red(), line, message.red())
            }
        }
    }

    println!();
    if report.is_complete() {
        println!(
            "{} in {:.1}s",
            "✓ Teardown complete".green().bold(),
            report.elapsed.as_secs_f32()
        );
        Ok(())
    } else {
        eprintln!(
            "{} run {} again to retry the remaining resources",
            "✗ Teardown incomplete:".red().bold(),
            format!("gitcloud teardown {}", session_id).cyan()
        );
        report.into_result()?;
        Ok(())
    }
}
