//! Background loops: risk index refresh and the position monitor

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::engine::TradingEngine;
use crate::task_runner::{run_periodic, PeriodicConfig};

/// Handles of the spawned loops. Dropping this without `shutdown` leaves them running.
pub struct EngineRuntime {
    engine: Arc<TradingEngine>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl EngineRuntime {
    /// Spawn the refresher and the monitor on the current tokio runtime
    pub fn spawn(engine: Arc<TradingEngine>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let index_interval = engine.config().index_refresh_interval();
        let monitor_interval = engine.config().monitor_interval();

        let index_engine = Arc::clone(&engine);
        let index_rx = rx.clone();
        let index_task = tokio::spawn(async move {
            run_periodic(
                "risk_index_refresh",
                PeriodicConfig::every(index_interval),
                index_rx,
                || {
                    let engine = Arc::clone(&index_engine);
                    async move {
                        engine
                            .refresh_risk_index(Utc::now())
                            .await
                            .map_err(|e| e.to_string())
                    }
                },
            )
            .await;
        });

        let monitor_engine = Arc::clone(&engine);
        let monitor_task = tokio::spawn(async move {
            run_periodic(
                "position_monitor",
                PeriodicConfig::every(monitor_interval),
                rx,
                || {
                    let engine = Arc::clone(&monitor_engine);
                    async move {
                        let report = engine
                            .run_monitor_tick(Utc::now())
                            .await
                            .map_err(|e| e.to_string())?;
                        if report.failed.is_empty() {
                            Ok(())
                        } else {
                            Err(format!("{} close(s) failed", report.failed.len()))
                        }
                    }
                },
            )
            .await;
        });

        info!("Engine runtime started");
        Self {
            engine,
            shutdown,
            handles: vec![index_task, monitor_task],
        }
    }

    /// Receiver that flips to true when `shutdown` starts, for the admin server
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Signal every loop to stop, wait for them, then let in-flight exchange closes finish
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            warn!("Engine loops already stopped");
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        let pending = self.engine.pending_exchange_closes();
        if pending > 0 {
            info!("Waiting for {} exchange-side close task(s)", pending);
        }
        self.engine.drain_exchange_closes().await;
        info!("Engine runtime stopped");
    }
}
