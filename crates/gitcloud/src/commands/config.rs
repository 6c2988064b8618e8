use crate::app::App;
use anyhow::Context;
use colored::Colorize;
use gitcloud_config::GitcloudConfig;

/// Print the effective configuration, or store a new default region
pub fn handle(app: &App, region: Option<String>) -> anyhow::Result<()> {
    if let Some(region) = region {
        let mut config = app.config.clone();
        config.region = region;
        let path = config
            .save(&app.home)
            .with_context(|| format!("Failed to write config in {}", app.home.display()))?;
        println!(
            "{} default region set to {} ({})",
            "✓".green(),
            config.region.cyan(),
            path.display()
        );
        return Ok(());
    }

    let config = &app.config;
    println!("{}", "Configuration".bold());
    println!("  file:         {}", GitcloudConfig::path(&app.home).display());
    println!("  region:       {}", config.region.cyan());
    println!(
        "  credentials:  {}",
        if config.credentials.is_some() {
            "static (config file)"
        } else {
            "AWS default chain"
        }
    );
    println!("  sessions:     {}", config.session_root(&app.home).display());
    println!(
        "  poll timeout: network {}s, compute {}s, database {}s",
        config.poll.network_secs, config.poll.compute_secs, config.poll.database_secs
    );
    Ok(())
}
