pub mod config;
pub mod provision;
pub mod sessions;
pub mod teardown;

use colored::Colorize;
use gitcloud_cloud::{Session, SessionStatus};

pub(crate) fn status_label(status: SessionStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        SessionStatus::Ready => label.green(),
        SessionStatus::Provisioning => label.yellow(),
        SessionStatus::PartialFailure => label.red(),
        SessionStatus::TornDown => label.dimmed(),
    }
}

/// Ledger and connection details of a session
pub(crate) fn print_session(session: &Session) {
    println!(
        "{} {} [{}]",
        "Session".bold(),
        session.id.cyan(),
        status_label(session.status)
    );
    println!("  region:   {}", session.region);
    println!("  provider: {}", session.provider);
    println!(
        "  created:  {}",
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    println!();
    if session.ledger.is_empty() {
        println!("  {}", "No resources created".dimmed());
    } else {
        println!("{}", format!("Resources ({}):", session.ledger.len()).bold());
        for (i, entry) in session.ledger.iter().enumerate() {
            println!(
                "  {}. {:<18} {}",
                i + 1,
                entry.kind.to_string(),
                entry.resource_id.cyan()
            );
        }
    }

    if let Some(compute) = &session.outputs.compute {
        println!();
        println!("{}", "Compute:".bold());
        if let Some(ip) = &compute.public_ip {
            println!("  public ip:  {}", ip);
        }
        if let Some(ip) = &compute.private_ip {
            println!("  private ip: {}", ip);
        }
        if let Some(ssh) = compute.ssh_command() {
            println!("  ssh:        {}", ssh.green());
        }
    }

    if let Some(database) = &session.outputs.database {
        println!();
        println!("{}", "Database:".bold());
        println!(
            "  endpoint:    {}:{}",
            database.host.as_deref().unwrap_or("(pending)"),
            database.port
        );
        println!("  user:        {}", database.username);
        println!("  credentials: {}", database.credentials_file.display());
    }

    if let Some(error) = &session.last_error {
        println!();
        println!("{} {}", "Last error:".red().bold(), error);
    }
}
