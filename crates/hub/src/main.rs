mod clock;
mod config;
mod control;
mod cover;
mod cycles;
mod db;
mod diagnostics;
mod driver;
mod hardware;
mod pump;
mod sample;
mod settings;
mod state;
mod watering;
mod web;

#[cfg(test)]
mod testing;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use control::ControlLoop;
use db::Db;
use hardware::HardwareManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:pool.db?mode=rwc".to_string());

    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    let settings = db.load_settings().await?;
    let state = db.load_state().await?;
    info!(mode = ?settings.working_mode, "settings and state loaded");

    // ── Hardware ────────────────────────────────────────────────────
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let hw = HardwareManager::open(&cfg.hardware, input_tx)?;

    // ── Control loop ────────────────────────────────────────────────
    let (control, handle) = ControlLoop::new(
        Arc::new(SystemClock),
        hw,
        db,
        settings,
        state,
        cfg.loop_delay(),
    );

    // ── Web server ──────────────────────────────────────────────────
    tokio::spawn(async move {
        if let Err(e) = web::serve(handle).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Shutdown ────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        let _ = stop_tx.send(true);
    });

    if let Err(e) = control.run(input_rx, stop_rx).await {
        error!("pool controller terminated: {e:#}");
        std::process::exit(1);
    }
    info!("pool controller stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot watch SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot watch ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
