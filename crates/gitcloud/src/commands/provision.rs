use crate::app::App;
use crate::commands::print_session;
use anyhow::Context;
use colored::Colorize;
use gitcloud_cloud::{
    CloudError, CloudProvider, Orchestrator, ProvisioningPlan, ResourceRequirement, Session,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancel `token` on the first Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!(
                    "{}",
                    "Interrupted, stopping after the current step...".yellow()
                );
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
}

fn orchestrator(app: &App, provider: Arc<dyn CloudProvider>) -> Orchestrator {
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    Orchestrator::new(provider, app.store())
        .with_poll_settings(app.poll_settings())
        .with_cancellation(cancel)
}

fn print_plan(plan: &ProvisioningPlan) {
    let compute = &plan.compute;
    println!("  region:   {}", plan.region.cyan());
    println!(
        "  compute:  {} vCPU / {} MB / {} GB, {} {} ({}), ports {:?}",
        compute.sizing.cpu_cores,
        compute.sizing.memory_mb,
        compute.sizing.disk_gb,
        compute.image.family,
        compute.image.version,
        compute.image.architecture,
        compute.app_ports
    );
    if let Some(gpu) = &compute.gpu {
        println!("  gpu:      {}", gpu);
    }
    match &plan.database {
        Some(db) => println!(
            "  database: {} {} ({} vCPU / {} MB), port {}",
            db.engine, db.engine_version, db.sizing.cpu_cores, db.sizing.memory_mb, db.port
        ),
        None => println!("  database: {}", "none".dimmed()),
    }
}

fn report(result: Result<Session, CloudError>) -> anyhow::Result<()> {
    match result {
        Ok(session) => {
            println!();
            print_session(&session);
            println!();
            println!("{}", "✓ Provisioning complete".green().bold());
            Ok(())
        }
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "✗".red().bold(), e);
            if let Some(id) = e.session_id() {
                eprintln!();
                eprintln!("  continue: {}", format!("gitcloud resume {}", id).cyan());
                eprintln!("  clean up: {}", format!("gitcloud teardown {}", id).cyan());
            }
            Err(e.into())
        }
    }
}

pub async fn handle(app: &App, spec: Option<&Path>, region: Option<String>) -> anyhow::Result<()> {
    let mut requirement = match spec {
        Some(path) => ResourceRequirement::from_file(path)
            .with_context(|| format!("Failed to read requirement {}", path.display()))?,
        None => ResourceRequirement::default().with_region(app.config.region.clone()),
    };
    if let Some(region) = region {
        requirement = requirement.with_region(region);
    }

    let plan = ProvisioningPlan::from_requirement(&requirement)?;
    println!("{}", "Provisioning".yellow().bold());
    print_plan(&plan);
    println!();

    let provider = app.provider(&requirement.region).await?;
    report(orchestrator(app, provider).provision(&requirement).await)
}

pub async fn resume(app: &App, session_id: &str) -> anyhow::Result<()> {
    let session = app
        .store()
        .load(session_id)
        .await
        .with_context(|| format!("Cannot resume session {}", session_id))?;

    println!(
        "{} {} ({} resources recorded)",
        "Resuming".yellow().bold(),
        session.id.cyan(),
        session.ledger.len()
    );

    let provider = app.provider(&session.region).await?;
    report(orchestrator(app, provider).resume(session_id).await)
}
