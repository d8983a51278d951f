//! Leader-gated subscription server.
//!
//! A periodic control round converges three facts (elected, connected,
//! handlers running) toward a consistent whole:
//!
//! | elected | connected | handlers | action |
//! |---------|-----------|----------|--------|
//! | no      | yes       | *        | disconnect |
//! | no      | *         | yes      | stop handlers |
//! | yes     | no        | *        | connect to the CM leader, backoff-gated |
//! | yes     | yes       | no       | start handlers |
//!
//! Connect failures double the backoff up to `max_backoff`; a successful
//! connect resets it to zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Resolves the cluster manager's current leader endpoint.
pub trait LeaderDetector: Send + Sync {
    /// `host:port` of the CM leader, if one is known.
    fn host_port(&self) -> Option<String>;
}

/// The singleton CM subscription connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_running(&self) -> bool;
    async fn start(&self, leader_host_port: &str) -> regatta_core::Result<()>;
    async fn stop(&self);
}

/// A background handler gated on the subscription being up
/// (event handler, reconciler).
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self);
    async fn stop(&self);
}

pub struct Server {
    elected: AtomicBool,
    handlers_running: AtomicBool,
    current_backoff: Mutex<Duration>,
    backoff_until: Mutex<Option<Instant>>,
    min_backoff: Duration,
    max_backoff: Duration,
    detector: std::sync::Arc<dyn LeaderDetector>,
    connection: std::sync::Arc<dyn Connection>,
    handlers: Vec<std::sync::Arc<dyn Handler>>,
}

impl Server {
    pub fn new(
        detector: std::sync::Arc<dyn LeaderDetector>,
        connection: std::sync::Arc<dyn Connection>,
        handlers: Vec<std::sync::Arc<dyn Handler>>,
        min_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            elected: AtomicBool::new(false),
            handlers_running: AtomicBool::new(false),
            current_backoff: Mutex::new(Duration::ZERO),
            backoff_until: Mutex::new(None),
            min_backoff,
            max_backoff,
            detector,
            connection,
            handlers,
        }
    }

    /// Election callback: this node became the control-plane leader.
    pub fn gained_leadership(&self) {
        info!("gained leadership");
        self.elected.store(true, Ordering::SeqCst);
    }

    /// Election callback: leadership lost; the next round tears down.
    pub fn lost_leadership(&self) {
        warn!("lost leadership");
        self.elected.store(false, Ordering::SeqCst);
    }

    pub fn is_elected(&self) -> bool {
        self.elected.load(Ordering::SeqCst)
    }

    pub fn handlers_running(&self) -> bool {
        self.handlers_running.load(Ordering::SeqCst)
    }

    pub fn current_backoff(&self) -> Duration {
        *self.current_backoff.lock().unwrap()
    }

    /// One convergence round. Invoked periodically from `run`.
    pub async fn ensure_state_round(&self) {
        let elected = self.elected.load(Ordering::SeqCst);

        if !elected {
            if self.connection.is_running() {
                info!("not elected: disconnecting from cluster manager");
                self.connection.stop().await;
            }
            if self.handlers_running.load(Ordering::SeqCst) {
                self.stop_handlers().await;
            }
            return;
        }

        if !self.connection.is_running() {
            if self.in_backoff() {
                debug!("connect attempt suppressed by backoff");
                return;
            }
            self.try_connect().await;
            return;
        }

        if !self.handlers_running.load(Ordering::SeqCst) {
            self.start_handlers().await;
        }
    }

    fn in_backoff(&self) -> bool {
        self.backoff_until
            .lock()
            .unwrap()
            .is_some_and(|until| Instant::now() < until)
    }

    async fn try_connect(&self) {
        let Some(leader) = self.detector.host_port() else {
            warn!("cluster manager leader unknown; will retry");
            self.record_connect_failure();
            return;
        };

        match self.connection.start(&leader).await {
            Ok(()) => {
                info!(%leader, "connected to cluster manager");
                *self.current_backoff.lock().unwrap() = Duration::ZERO;
                *self.backoff_until.lock().unwrap() = None;
            }
            Err(e) => {
                warn!(%leader, error = %e, "cluster manager connect failed");
                self.record_connect_failure();
            }
        }
    }

    fn record_connect_failure(&self) {
        let mut backoff = self.current_backoff.lock().unwrap();
        *backoff = if backoff.is_zero() {
            self.min_backoff
        } else {
            (*backoff * 2).min(self.max_backoff)
        };
        *self.backoff_until.lock().unwrap() = Some(Instant::now() + *backoff);
    }

    async fn start_handlers(&self) {
        for handler in &self.handlers {
            info!(handler = handler.name(), "starting handler");
            handler.start().await;
        }
        self.handlers_running.store(true, Ordering::SeqCst);
    }

    async fn stop_handlers(&self) {
        for handler in &self.handlers {
            info!(handler = handler.name(), "stopping handler");
            handler.stop().await;
        }
        self.handlers_running.store(false, Ordering::SeqCst);
    }

    /// Run convergence rounds until shutdown, then tear down.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_ms = period.as_millis() as u64, "leader-gated server started");
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => self.ensure_state_round().await,
                _ = shutdown.changed() => {
                    info!("leader-gated server shutting down");
                    if self.handlers_running.load(Ordering::SeqCst) {
                        self.stop_handlers().await;
                    }
                    if self.connection.is_running() {
                        self.connection.stop().await;
                    }
                    break;
                }
            }
        }
    }
}
