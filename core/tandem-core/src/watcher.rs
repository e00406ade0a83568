//! Periodic scan of the signal queue.
//!
//! Each tick drains the queue (oldest first) and sorts every delivery into
//! one bucket:
//!
//! | Delivery                                   | Action                          |
//! |--------------------------------------------|---------------------------------|
//! | own signal, younger than the self grace    | leave it (others may not have seen it) |
//! | own signal, older than the self grace      | ack                             |
//! | foreign, signature already applied         | ack                             |
//! | foreign, new signature                     | rebuild, notify, then ack       |
//! | unparseable, younger than malformed grace  | leave it                        |
//! | unparseable, older than malformed grace    | ack                             |
//!
//! All novel changes in one tick share a single rebuild and a single
//! `on_data_changed` call. If that rebuild fails, nothing is recorded as seen
//! and the novel deliveries stay queued for the next tick.
//!
//! A tick never returns an error. Problems are logged and counted in the
//! [`TickReport`], and the background loop survives even a panicking
//! [`crate::cache::CacheBuilder`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::events::ForeignChange;
use crate::queue::{Delivery, DeliveryPayload};
use crate::signature::{self, Signature};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub scanned: usize,
    pub self_recent: usize,
    pub self_removed: usize,
    pub foreign_known: usize,
    pub foreign_novel: usize,
    pub malformed: usize,
    pub malformed_removed: usize,
    pub errors: usize,
    pub rebuilt: bool,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.scanned == 0 && self.errors == 0
    }
}

enum Disposition {
    SelfRecent,
    SelfStale,
    ForeignKnown,
    ForeignNovel(ForeignChange),
    MalformedRecent,
    MalformedStale,
}

/// Runs one tick against `ctx`.
pub fn scan(ctx: &SyncContext) -> TickReport {
    let mut report = TickReport::default();
    let mut deliveries = match ctx.queue().drain() {
        Ok(deliveries) => deliveries,
        Err(err) => {
            warn!(error = %err, "Failed to drain change signals");
            report.errors += 1;
            return report;
        }
    };
    deliveries.sort_by(|a, b| {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.key.cmp(&b.key))
    });
    report.scanned = deliveries.len();

    let now = crate::now_ms();
    let mut seen = ctx.last_seen_snapshot();
    let mut novel: Vec<(Delivery, ForeignChange)> = Vec::new();

    for delivery in deliveries {
        let disposition = match classify(ctx, &delivery, now, &seen) {
            Ok(disposition) => disposition,
            Err(err) => {
                if err.is_transient() {
                    warn!(file = %delivery.key, error = %err, "Skipping change signal this tick");
                } else {
                    error!(file = %delivery.key, error = %err, "Cannot classify change signal");
                }
                report.errors += 1;
                continue;
            }
        };

        match disposition {
            Disposition::SelfRecent => report.self_recent += 1,
            Disposition::SelfStale => {
                if ack(ctx, &delivery, &mut report) {
                    report.self_removed += 1;
                }
            }
            Disposition::ForeignKnown => {
                report.foreign_known += 1;
                ack(ctx, &delivery, &mut report);
            }
            Disposition::ForeignNovel(change) => {
                seen.insert(change.origin.clone(), change.signature.clone());
                novel.push((delivery, change));
            }
            Disposition::MalformedRecent => report.malformed += 1,
            Disposition::MalformedStale => {
                report.malformed += 1;
                if ack(ctx, &delivery, &mut report) {
                    report.malformed_removed += 1;
                }
            }
        }
    }

    if novel.is_empty() {
        return report;
    }

    if let Err(err) = ctx.rebuild_cache() {
        warn!(
            pending = novel.len(),
            error = %err,
            "Cache rebuild for foreign changes failed; will retry next tick"
        );
        report.errors += 1;
        return report;
    }
    report.rebuilt = true;
    report.foreign_novel = novel.len();

    let changes: Vec<ForeignChange> = novel.iter().map(|(_, change)| change.clone()).collect();
    ctx.record_seen(
        changes
            .iter()
            .map(|change| (change.origin.clone(), change.signature.clone())),
    );
    info!(
        count = changes.len(),
        origins = ?changes.iter().map(|c| c.origin.as_str()).collect::<Vec<_>>(),
        "Applied foreign database changes"
    );
    ctx.observer().on_data_changed(&changes);

    for (delivery, _) in &novel {
        ack(ctx, delivery, &mut report);
    }
    report
}

fn classify(
    ctx: &SyncContext,
    delivery: &Delivery,
    now: u64,
    seen: &std::collections::HashMap<crate::session::SessionId, Signature>,
) -> Result<Disposition> {
    let signal = match &delivery.payload {
        DeliveryPayload::Signal(signal) => signal,
        DeliveryPayload::Malformed { reason } => {
            let err = SyncError::MalformedSignal {
                name: delivery.key.clone(),
                reason: reason.clone(),
            };
            let age = now.saturating_sub(delivery.modified_ms.unwrap_or(now));
            if age > ctx.config().watcher.malformed_grace_ms {
                warn!(error = %err, "Removing malformed change signal");
                return Ok(Disposition::MalformedStale);
            }
            debug!(error = %err, "Ignoring malformed change signal");
            return Ok(Disposition::MalformedRecent);
        }
    };

    if &signal.origin == ctx.session() {
        return Ok(if signal.age_ms(now) > ctx.config().watcher.self_grace_ms {
            Disposition::SelfStale
        } else {
            Disposition::SelfRecent
        });
    }

    let signature = match &signal.signature {
        Some(signature) => signature.clone(),
        None => signature::compute(ctx.paths().primary())?,
    };
    if seen.get(&signal.origin) == Some(&signature) {
        return Ok(Disposition::ForeignKnown);
    }

    Ok(Disposition::ForeignNovel(ForeignChange {
        origin: signal.origin.clone(),
        timestamp_ms: signal.timestamp_ms,
        signature,
    }))
}

fn ack(ctx: &SyncContext, delivery: &Delivery, report: &mut TickReport) -> bool {
    match ctx.queue().ack(delivery) {
        Ok(()) => true,
        Err(err) => {
            warn!(file = %delivery.key, error = %err, "Failed to remove change signal");
            report.errors += 1;
            false
        }
    }
}

/// Drives [`scan`] on a background thread.
pub struct ChangeWatcher {
    ctx: Arc<SyncContext>,
}

impl ChangeWatcher {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Runs one tick on the calling thread.
    pub fn tick(&self) -> TickReport {
        scan(&self.ctx)
    }

    /// Starts a background watcher for `ctx`.
    pub fn spawn(ctx: Arc<SyncContext>) -> Result<WatcherHandle> {
        Self::new(ctx).start()
    }

    pub fn start(self) -> Result<WatcherHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = self.ctx.config().watch_interval();
        let ctx = self.ctx;

        let thread = thread::Builder::new()
            .name("tandem-watcher".to_string())
            .spawn(move || {
                info!(
                    session_id = %ctx.session(),
                    interval_ms = interval.as_millis() as u64,
                    "Change watcher started"
                );
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    match panic::catch_unwind(AssertUnwindSafe(|| scan(&ctx))) {
                        Ok(report) if !report.is_idle() => debug!(?report, "Watcher tick"),
                        Ok(_) => {}
                        Err(_) => error!("Watcher tick panicked; continuing"),
                    }
                }
                info!(session_id = %ctx.session(), "Change watcher stopped");
            })
            .map_err(|err| SyncError::io("spawning change watcher", err))?;

        Ok(WatcherHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Stops the watcher thread when dropped.
pub struct WatcherHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Change watcher thread panicked");
            }
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
