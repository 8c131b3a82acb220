//! Subsystem assembly and the serve loop.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hostgrid_control::ControlPlane;
use hostgrid_ledger::Ledger;
use hostgrid_workflow::MemoryExecutor;

use crate::config::DaemonConfig;

/// Open the ledger the configuration points at.
pub fn open_ledger(config: &DaemonConfig) -> anyhow::Result<Ledger> {
    let ledger = if config.storage.in_memory {
        warn!("ledger is in memory; state is lost on restart");
        Ledger::open_in_memory()?
    } else {
        std::fs::create_dir_all(&config.storage.data_dir)?;
        let path = config.storage.data_dir.join("hostgrid.redb");
        let ledger = Ledger::open(&path)?;
        info!(path = ?path, "ledger opened");
        ledger
    };
    Ok(ledger.with_drift_retention(config.agent.drift_retention))
}

/// Assemble the control plane over the in-process workflow backend.
pub fn build_plane(config: &DaemonConfig) -> anyhow::Result<ControlPlane> {
    let ledger = open_ledger(config)?;
    let executor = MemoryExecutor::new();
    info!("in-process workflow executor initialized");
    Ok(ControlPlane::new(ledger, Arc::new(executor), config.plane_config()))
}

/// Periodically settle in-flight workflows until `shutdown` flips.
pub async fn run_reconcile_loop(
    plane: ControlPlane,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match plane.reconcile().await {
                    Ok(0) => {}
                    Ok(settled) => info!(settled, "reconciled in-flight resources"),
                    Err(e) => error!(error = %e, "reconcile sweep failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("reconcile loop stopped");
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("hostgrid daemon starting");

    let plane = build_plane(&config)?;

    // Migrations interrupted by a restart continue from their recorded phase.
    let resumed = plane.migrations().resume_inflight().await?;
    if resumed.resumed > 0 || !resumed.errors.is_empty() {
        info!(
            resumed = resumed.resumed,
            failed = resumed.errors.len(),
            "resumed in-flight migrations"
        );
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let reconcile_handle = tokio::spawn(run_reconcile_loop(
        plane.clone(),
        config.reconcile_interval(),
        shutdown_rx,
    ));
    info!(
        interval = config.lifecycle.reconcile_interval_secs,
        "reconcile loop started"
    );

    // ── API server ─────────────────────────────────────────────

    let router = hostgrid_api::build_router(plane);
    let addr = config.listen_addr();
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = reconcile_handle.await;

    info!("hostgrid daemon stopped");
    Ok(())
}
