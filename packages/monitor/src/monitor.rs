//! Monitor Loop
//!
//! Long-running scheduler that walks the chain block by block. It tracks a
//! cursor (the highest fully processed height), fetches new blocks in
//! bounded batches, matches them against the registry and dispatches the
//! matches. Errors move the loop into backoff; they are never fatal.
//!
//! State machine:
//!
//! ```text
//!   Idle ──(registry non-empty)──► Polling ──(chain/store error)──► Backoff
//!    ▲                               │  ▲                              │
//!    └──────(registry empty)─────────┘  └──────(after backoff)─────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::chain::{ChainError, ChainReader};
use crate::config::MonitorConfig;
use crate::dispatcher::{DispatchStats, NotificationDispatcher};
use crate::matcher::match_transactions;
use crate::registry::AddressRegistry;
use crate::store::{CursorStore, StoreError};

/// Errors that stop a batch
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl MonitorError {
    /// The block height the error refers to, if any
    pub fn height(&self) -> Option<u64> {
        match self {
            MonitorError::Chain(e) => e.height(),
            MonitorError::Store(_) => None,
        }
    }
}

/// Scheduler state of the monitor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorState {
    /// No address registered; no RPC calls are made
    Idle,
    Polling,
    /// Waiting out a chain or store error
    Backoff,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Idle => "idle",
            MonitorState::Polling => "polling",
            MonitorState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Result of one polling cycle
#[derive(Debug)]
pub enum PollOutcome {
    /// Registry empty, nothing fetched
    Idle,
    /// No block past the cursor yet
    UpToDate { cursor: u64, latest: u64 },
    /// Blocks `from..=to` fully processed
    Advanced {
        from: u64,
        to: u64,
        latest: u64,
        stats: DispatchStats,
    },
    /// Stopped on an error; `cursor` is the last fully processed height
    Failed { cursor: u64, error: MonitorError },
    /// Shutdown requested between two blocks of a batch
    Interrupted { cursor: u64 },
}

/// Point-in-time diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub cursor: u64,
    pub monitored_addresses: usize,
}

/// Read-only view of a running loop, safe to share with command handlers
#[derive(Clone)]
pub struct MonitorHandle {
    cursor: Arc<AtomicU64>,
    state: watch::Receiver<MonitorState>,
    registry: Arc<AddressRegistry>,
}

impl MonitorHandle {
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.state.clone()
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            state: self.state(),
            cursor: self.cursor(),
            monitored_addresses: self.registry.len(),
        }
    }
}

/// Starting cursor: the persisted cursor if any, otherwise one below the
/// current head so the head block itself is processed
pub async fn initial_cursor(
    store: &dyn CursorStore,
    chain: &dyn ChainReader,
) -> Result<u64, MonitorError> {
    match store.load_cursor().await {
        Ok(Some(cursor)) => {
            info!(cursor, "resuming from stored cursor");
            return Ok(cursor);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to load stored cursor, starting from head"),
    }

    let latest = chain.latest_height().await?;
    Ok(latest.saturating_sub(1))
}

pub struct MonitorLoop {
    config: MonitorConfig,
    chain: Arc<dyn ChainReader>,
    registry: Arc<AddressRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    cursor_store: Arc<dyn CursorStore>,
    cursor: Arc<AtomicU64>,
    state: watch::Sender<MonitorState>,
}

impl MonitorLoop {
    pub fn new(
        config: MonitorConfig,
        chain: Arc<dyn ChainReader>,
        registry: Arc<AddressRegistry>,
        dispatcher: Arc<NotificationDispatcher>,
        cursor_store: Arc<dyn CursorStore>,
        initial_cursor: u64,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Idle);
        Self {
            config,
            chain,
            registry,
            dispatcher,
            cursor_store,
            cursor: Arc::new(AtomicU64::new(initial_cursor)),
            state,
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            cursor: self.cursor.clone(),
            state: self.state.subscribe(),
            registry: self.registry.clone(),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    fn set_state(&self, next: MonitorState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "monitor state changed");
            *current = next;
            true
        });
    }

    /// Run one polling cycle
    ///
    /// Processes at most one batch. `shutdown` is checked before every
    /// block; a block once started is always finished.
    pub async fn poll_once(&self, shutdown: &watch::Receiver<bool>) -> PollOutcome {
        if self.registry.is_empty() {
            self.set_state(MonitorState::Idle);
            return PollOutcome::Idle;
        }
        self.set_state(MonitorState::Polling);

        let cursor = self.cursor();
        let latest = match self.chain.latest_height().await {
            Ok(latest) => latest,
            Err(e) => {
                return PollOutcome::Failed {
                    cursor,
                    error: e.into(),
                }
            }
        };

        let Some((from, to)) = self.config.next_batch(cursor, latest) else {
            return PollOutcome::UpToDate { cursor, latest };
        };

        info!(from, to, latest, "checking blocks");

        let mut stats = DispatchStats::default();
        for height in from..=to {
            if *shutdown.borrow() {
                return PollOutcome::Interrupted {
                    cursor: self.cursor(),
                };
            }

            match self.process_block(height).await {
                Ok(block_stats) => stats.merge(block_stats),
                Err(error) => {
                    return PollOutcome::Failed {
                        cursor: self.cursor(),
                        error,
                    }
                }
            }

            self.advance(height).await;
        }

        PollOutcome::Advanced {
            from,
            to,
            latest,
            stats,
        }
    }

    /// Fetch, match and dispatch one block
    async fn process_block(&self, height: u64) -> Result<DispatchStats, MonitorError> {
        let transactions = self.chain.block_transactions(height).await?;

        let matches = self
            .registry
            .with_index(|index| match_transactions(height, &transactions, index));

        let mut stats = DispatchStats::default();
        for matched in &matches {
            stats.record(self.dispatcher.dispatch(matched).await?);
        }

        debug!(
            height,
            transactions = transactions.len(),
            matches = matches.len(),
            "block processed"
        );
        Ok(stats)
    }

    async fn advance(&self, height: u64) {
        self.cursor.fetch_max(height, Ordering::SeqCst);
        if let Err(e) = self.cursor_store.save_cursor(height).await {
            warn!(height, error = %e, "failed to persist cursor");
        }
    }

    /// Run until `shutdown` turns true or its sender is dropped
    ///
    /// # Returns
    /// The final cursor
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> u64 {
        info!(cursor = self.cursor(), "monitor loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.poll_once(&shutdown).await {
                PollOutcome::Idle => self.config.idle_interval,
                PollOutcome::UpToDate { .. } => self.config.poll_interval,
                PollOutcome::Advanced {
                    from,
                    to,
                    latest,
                    stats,
                } => {
                    info!(
                        from,
                        to,
                        latest,
                        matches = stats.total(),
                        delivered = stats.delivered,
                        duplicates = stats.already_delivered,
                        failed = stats.failed,
                        "blocks processed"
                    );
                    if to < latest {
                        Duration::ZERO
                    } else {
                        self.config.poll_interval
                    }
                }
                PollOutcome::Failed { cursor, error } => {
                    self.set_state(MonitorState::Backoff);
                    warn!(
                        cursor,
                        failed_height = ?error.height(),
                        error = %error,
                        backoff_secs = self.config.backoff_interval.as_secs(),
                        "monitor error, backing off"
                    );
                    self.config.backoff_interval
                }
                PollOutcome::Interrupted { .. } => break,
            };

            if delay.is_zero() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let cursor = self.cursor();
        info!(cursor, "monitor loop stopped");
        cursor
    }
}
