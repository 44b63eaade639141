//! The single admission coordinator.
//!
//! All event logs live inside one task. Callers talk to it through a
//! [`CoordinatorHandle`], and every command is processed to completion before
//! the next is read from the mailbox, so the read-modify-write of a log can
//! never interleave with another check.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::backend::AdmissionBackend;
use crate::error::{GatewayError, Result};
use crate::ratelimit::{AdmissionDecision, Clock, CompositeLimiter, Dimension, EventStore};

/// Default number of queued commands before callers wait for space.
const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Tuning for a coordinator instance.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Bound on queued commands
    pub mailbox_capacity: usize,
    /// How often to sweep idle logs. `None` disables the sweep.
    pub eviction_interval: Option<Duration>,
    /// A log whose latest event is this old is dropped by the sweep.
    /// Should be at least the largest configured window.
    pub idle_after: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            eviction_interval: Some(Duration::from_secs(60)),
            idle_after: Duration::from_secs(60),
        }
    }
}

enum Command {
    Check {
        dimensions: Vec<Dimension>,
        /// `None` stamps the check with the coordinator's clock.
        now_ms: Option<u64>,
        reply: oneshot::Sender<Result<AdmissionDecision>>,
    },
    Evict {
        idle_for: Duration,
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
    TrackedKeys {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Owner of every event log. Runs as a single task.
pub struct AdmissionCoordinator<S: EventStore> {
    limiter: CompositeLimiter<S>,
    clock: Arc<dyn Clock>,
    /// Latest instant the coordinator has stamped. The wall clock may step
    /// backward; stamps never do.
    last_stamp_ms: u64,
    rx: mpsc::Receiver<Command>,
}

impl<S: EventStore> AdmissionCoordinator<S> {
    /// Start a coordinator over `store` and return a handle to it.
    ///
    /// Must be called from within a Tokio runtime. The coordinator stops once
    /// every handle is dropped or [`CoordinatorHandle::shutdown`] is called.
    pub fn spawn(
        store: S,
        clock: Arc<dyn Clock>,
        options: CoordinatorOptions,
    ) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(options.mailbox_capacity.max(1));
        let coordinator = Self {
            limiter: CompositeLimiter::new(store),
            clock,
            last_stamp_ms: 0,
            rx,
        };
        tokio::spawn(coordinator.run());

        if let Some(interval) = options.eviction_interval {
            spawn_sweeper(tx.downgrade(), interval, options.idle_after);
        }

        info!(
            mailbox_capacity = options.mailbox_capacity,
            eviction_interval = ?options.eviction_interval,
            idle_after = ?options.idle_after,
            "Admission coordinator started"
        );

        CoordinatorHandle { tx }
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Check {
                    dimensions,
                    now_ms,
                    reply,
                } => {
                    let now_ms = now_ms.unwrap_or_else(|| self.stamp());
                    let result = self.limiter.evaluate(&dimensions, now_ms);
                    if let Err(ref e) = result {
                        warn!(error = %e, "Admission check failed");
                    }
                    // The caller may have given up waiting.
                    let _ = reply.send(result);
                }
                Command::Evict { idle_for, reply } => {
                    let now_ms = self.stamp();
                    let result = self.limiter.evict_idle(idle_for, now_ms);
                    match &result {
                        Ok(removed) => debug!(
                            removed = removed,
                            remaining = self.limiter.tracked_keys(),
                            "Evicted idle event logs"
                        ),
                        Err(e) => warn!(error = %e, "Eviction sweep failed"),
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Command::TrackedKeys { reply } => {
                    let _ = reply.send(self.limiter.tracked_keys());
                }
                Command::Shutdown => break,
            }
        }

        info!(
            tracked_keys = self.limiter.tracked_keys(),
            "Admission coordinator stopped"
        );
    }

    fn stamp(&mut self) -> u64 {
        self.last_stamp_ms = self.last_stamp_ms.max(self.clock.now_ms());
        self.last_stamp_ms
    }
}

fn spawn_sweeper(tx: mpsc::WeakSender<Command>, interval: Duration, idle_after: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(tx) = tx.upgrade() else {
                break;
            };
            let command = Command::Evict {
                idle_for: idle_after,
                reply: None,
            };
            if tx.send(command).await.is_err() {
                break;
            }
        }
    });
}

/// Cloneable handle to a running [`AdmissionCoordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Check a request at an explicit instant (ms since the Unix epoch).
    pub async fn check_at(
        &self,
        dimensions: Vec<Dimension>,
        now_ms: u64,
    ) -> Result<AdmissionDecision> {
        self.submit_check(dimensions, Some(now_ms)).await
    }

    /// Drop logs whose latest event is at least `idle_for` old.
    pub async fn evict_idle(&self, idle_for: Duration) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Evict {
            idle_for,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Number of keys with a live event log.
    pub async fn tracked_keys(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TrackedKeys { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Ask the coordinator to stop after the commands already queued.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn submit_check(
        &self,
        dimensions: Vec<Dimension>,
        now_ms: Option<u64>,
    ) -> Result<AdmissionDecision> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Check {
            dimensions,
            now_ms,
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> GatewayError {
    GatewayError::CoordinatorUnreachable("coordinator is not running".to_string())
}

#[async_trait]
impl AdmissionBackend for CoordinatorHandle {
    async fn check(&self, dimensions: &[Dimension]) -> Result<AdmissionDecision> {
        self.submit_check(dimensions.to_vec(), None).await
    }
}
