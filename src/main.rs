//! nodeup - bootstraps a tunnel node and publishes its subscription
//!
//! Sequential bootstrap on the main task; the publication server and the
//! delayed cleanup run as spawned tasks for the life of the process.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nodeup::config::{Args, Settings};
use nodeup::{discovery, engine, enrich, housekeeping, links, provision, report, server, supervisor};

/// Setup logging with the specified log level
fn setup_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level);

    info!(
        "🚀 nodeup {} ({} built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let settings = Settings::from_args(args)?;
    settings
        .prepare_workdir()
        .with_context(|| format!("Failed to create working directory {}", settings.work_dir.display()))?;

    // Drop the previous run's registration before its artifact is swept.
    report::deregister_nodes(&settings).await;
    housekeeping::sweep_stale_files(&settings);

    // The server comes up early so the platform health check passes while
    // the rest of the bootstrap is still running.
    server::spawn_publication_server(&settings)
        .await
        .context("Failed to start publication server")?;

    provision::provision(&settings)
        .await
        .context("Failed to provision helper binaries")?;

    engine::write_engine_config(&settings).context("Failed to write proxy engine config")?;

    if let Err(e) = supervisor::launch_monitor(&settings) {
        // Telemetry is optional; the node works without it.
        warn!("Monitoring agent did not start: {}", e);
    }
    supervisor::launch_engine(&settings).context("Failed to start proxy engine")?;
    let tunnel = supervisor::launch_tunnel(&settings).context("Failed to start tunnel client")?;

    match discovery::discover_hostname(&settings, &tunnel).await {
        Ok(hostname) => {
            let label = enrich::operator_label().await;
            let link_set = links::synthesize(
                &settings.identity,
                &settings.endpoints,
                &hostname,
                &label,
            );
            links::publish(&settings, &link_set).context("Failed to publish subscription")?;
            info!("✅ Subscription published for {}", hostname);

            report::upload_subscription(&settings).await;
            report::send_telegram(&settings).await;
        }
        Err(e) => {
            // Keep serving whatever artifact a previous run left behind.
            error!("Hostname discovery failed: {}", e);
        }
    }

    housekeeping::spawn_delayed_cleanup(&settings);

    info!("Bootstrap complete, serving on port {}", settings.http_port);
    std::future::pending::<()>().await;
    Ok(())
}
