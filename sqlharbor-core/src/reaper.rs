//! Background reapers: idle connection eviction and expired session cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::manager::ConnectionManager;
use crate::session::TxSessionRegistry;

/// Handles for the two periodic maintenance loops.
pub struct Reapers {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Reapers {
    pub fn spawn(
        manager: Arc<ConnectionManager>,
        sessions: Arc<TxSessionRegistry>,
        eviction_interval: Duration,
        reap_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let eviction = tokio::spawn(eviction_loop(manager, eviction_interval, cancel.clone()));
        let reaping = tokio::spawn(session_loop(sessions, reap_interval, cancel.clone()));
        info!(
            eviction_interval_ms = eviction_interval.as_millis() as u64,
            reap_interval_ms = reap_interval.as_millis() as u64,
            "reapers started"
        );
        Self {
            cancel,
            tasks: vec![eviction, reaping],
        }
    }

    pub fn spawn_from_config(
        config: &ServerConfig,
        manager: Arc<ConnectionManager>,
        sessions: Arc<TxSessionRegistry>,
    ) -> Self {
        Self::spawn(
            manager,
            sessions,
            config.eviction_interval(),
            config.session_reap_interval(),
        )
    }

    /// Stop both loops and wait for them to finish their current pass.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "reaper task ended abnormally");
            }
        }
        info!("reapers stopped");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn eviction_loop(manager: Arc<ConnectionManager>, period: Duration, cancel: CancellationToken) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Dropping a pool closes sqlite handles; keep that off the runtime threads.
        let target = Arc::clone(&manager);
        match tokio::task::spawn_blocking(move || target.evict_idle()).await {
            Ok(0) => debug!("no idle connections to evict"),
            Ok(evicted) => info!(evicted, "evicted idle connections"),
            Err(err) => warn!(error = %err, "connection eviction failed"),
        }
    }
}

async fn session_loop(sessions: Arc<TxSessionRegistry>, period: Duration, cancel: CancellationToken) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let reaped = sessions.reap_expired().await;
        if reaped > 0 {
            debug!(reaped, "session reaper pass finished");
        }
    }
}
