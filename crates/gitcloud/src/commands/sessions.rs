use crate::app::App;
use crate::commands::{print_session, status_label};
use anyhow::Context;
use colored::Colorize;

pub async fn list(app: &App, json: bool) -> anyhow::Result<()> {
    let sessions = app.store().list_all().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:<28} {:<16} {:<12} {:>9}  {}",
            "SESSION", "STATUS", "REGION", "RESOURCES", "CREATED"
        )
        .bold()
    );
    for summary in &sessions {
        println!(
            "{:<28} {:<16} {:<12} {:>9}  {}",
            summary.id,
            status_label(summary.status),
            summary.region,
            summary.resource_count,
            summary.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &summary.last_error {
            println!("  {}", error.red());
        }
    }
    Ok(())
}

pub async fn status(app: &App, session_id: &str, json: bool) -> anyhow::Result<()> {
    let session = app
        .store()
        .load(session_id)
        .await
        .with_context(|| format!("Cannot show session {}", session_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else {
        print_session(&session);
    }
    Ok(())
}
