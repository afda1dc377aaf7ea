//! Chain poller and reconciliation orchestrator
//!
//! Each tick reads the head, derives a block window from the durable cursor
//! and the lookback setting, and feeds every decoded event through the
//! idempotent handlers in dependency order. One event failing never stops
//! the others; only a transient failure holds the cursor back so the same
//! blocks are retried next tick.

mod handlers;
pub mod monitor;

pub use handlers::{EventHandler, EventOutcome};
pub use monitor::{LoanMonitor, MonitorReport};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, EventKind};
use crate::config::IndexerConfig;
use crate::error::ReconcileResult;
use crate::models::IndexerCursor;
use crate::store::LedgerStore;

/// Outcome of one reconciliation tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub head: u64,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub applied: usize,
    pub duplicate: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Cursor after the tick
    pub cursor: Option<u64>,
    /// Another instance holds the writer lock; nothing was scanned
    pub standby: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TickReport {
    pub fn processed(&self) -> usize {
        self.applied + self.duplicate + self.skipped + self.failed
    }

    fn record(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Applied => self.applied += 1,
            EventOutcome::Duplicate => self.duplicate += 1,
            EventOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Computes the inclusive block range for a tick, or `None` when there is
/// nothing final to scan yet.
pub fn scan_range(
    head: u64,
    cursor: Option<u64>,
    lookback: u64,
    confirmations: u64,
) -> Option<(u64, u64)> {
    let safe_head = head.checked_sub(confirmations)?;
    let window_start = safe_head.saturating_sub(lookback);

    let from = match cursor {
        Some(last) if last > safe_head => {
            warn!(
                cursor = last,
                safe_head,
                "Head is behind the stored cursor (reorg or node reset), rescanning lookback window"
            );
            window_start
        }
        Some(last) => window_start.min(last.saturating_add(1)),
        None => window_start,
    };

    Some((from, safe_head))
}

pub struct ReconciliationService {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainClient>,
    handler: EventHandler,
    config: IndexerConfig,
    write_gate: Arc<Mutex<()>>,
    last_report: RwLock<Option<TickReport>>,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainClient>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            handler: EventHandler::new(store.clone(), chain.clone()),
            store,
            chain,
            config,
            write_gate: Arc::new(Mutex::new(())),
            last_report: RwLock::new(None),
        }
    }

    /// Serializes ledger writes with other in-process writers (the monitor)
    pub fn write_gate(&self) -> Arc<Mutex<()>> {
        self.write_gate.clone()
    }

    pub async fn last_report(&self) -> Option<TickReport> {
        self.last_report.read().await.clone()
    }

    pub async fn start(self: Arc<Self>) {
        info!(
            contract = %self.config.contract_address,
            interval_secs = self.config.poll_interval.as_secs(),
            lookback = self.config.lookback_blocks,
            "Starting reconciliation service..."
        );

        loop {
            match self.run_tick().await {
                Ok(report) if report.processed() > 0 => info!(
                    applied = report.applied,
                    duplicate = report.duplicate,
                    skipped = report.skipped,
                    failed = report.failed,
                    cursor = ?report.cursor,
                    "Reconciliation tick complete"
                ),
                Ok(report) => debug!(head = report.head, cursor = ?report.cursor, "Nothing to reconcile"),
                Err(e) => error!(code = e.error_code(), "Reconciliation tick failed: {}", e),
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// One pass over the current window. Safe to call repeatedly.
    pub async fn run_tick(&self) -> ReconcileResult<TickReport> {
        if !self.store.try_acquire_writer_lock().await? {
            debug!("Writer lock held elsewhere, standing by");
            let report = TickReport {
                standby: true,
                finished_at: Some(Utc::now()),
                ..TickReport::default()
            };
            *self.last_report.write().await = Some(report.clone());
            return Ok(report);
        }

        let _gate = self.write_gate.lock().await;

        let contract = &self.config.contract_address;
        let stored = self.store.load_cursor(contract).await?;
        let head = self.chain.block_number().await?;

        let mut report = TickReport {
            head,
            cursor: stored.as_ref().map(|c| c.last_processed_block),
            ..TickReport::default()
        };

        let range = scan_range(
            head,
            report.cursor,
            self.config.lookback_blocks,
            self.config.confirmations,
        );

        if let Some((from, to)) = range.filter(|(from, to)| from <= to) {
            report.from_block = Some(from);
            let step = self.config.max_block_range.max(1);
            let mut rewind = report.cursor.is_some_and(|c| c > to);
            let mut chunk_start = from;

            while chunk_start <= to {
                let chunk_end = chunk_start.saturating_add(step - 1).min(to);

                if !self.process_chunk(chunk_start, chunk_end, &mut report).await {
                    warn!(
                        from = chunk_start,
                        to = chunk_end,
                        "Transient failure, cursor held for retry"
                    );
                    break;
                }

                report.to_block = Some(chunk_end);
                // Rescans of the lookback window never move the cursor back;
                // only a head behind the cursor does
                if rewind || report.cursor.map_or(true, |c| chunk_end > c) {
                    rewind = false;
                    self.store
                        .save_cursor(&IndexerCursor {
                            contract_address: contract.clone(),
                            last_processed_block: chunk_end,
                            updated_at: Utc::now(),
                        })
                        .await?;
                    report.cursor = Some(chunk_end);
                }

                chunk_start = chunk_end + 1;
            }
        }

        report.finished_at = Some(Utc::now());
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    /// Runs every event kind over `[from, to]`. Returns false when a
    /// transient failure means the range must be seen again.
    async fn process_chunk(&self, from: u64, to: u64, report: &mut TickReport) -> bool {
        let mut clean = true;

        for kind in EventKind::PROCESSING_ORDER {
            let events = match self.chain.events(kind, from, to).await {
                Ok(events) => events,
                Err(e) => {
                    error!(
                        event = kind.name(),
                        from,
                        to,
                        code = e.error_code(),
                        "Failed to fetch events: {}",
                        e
                    );
                    clean = false;
                    continue;
                }
            };

            if !events.is_empty() {
                debug!(event = kind.name(), count = events.len(), from, to, "Fetched events");
            }

            for event in &events {
                match self.handler.handle_event(event).await {
                    Ok(outcome) => report.record(outcome),
                    Err(e) => {
                        report.failed += 1;
                        if e.is_transient() {
                            clean = false;
                        }
                        error!(
                            event = kind.name(),
                            key = %event.meta.event_key(),
                            block = event.meta.block_number,
                            code = e.error_code(),
                            transient = e.is_transient(),
                            "Failed to process event: {}",
                            e
                        );
                    }
                }
            }
        }

        clean
    }
}
