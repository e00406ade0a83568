//! Announcing a committed write to every other process.
//!
//! Runs after a write handle is released:
//!
//! 1. Compute the primary's signature (abort the publish if this fails).
//! 2. Enqueue a change signal naming this session.
//! 3. Sleep a random delay so that writers finishing together spread out.
//! 4. Wait, bounded, for any rebuild lock marker to clear.
//! 5. Rebuild this process's replica, holding the marker if it is free.
//!
//! The commit itself already happened, so none of this is allowed to fail it.
//! A failed enqueue or local rebuild is logged; the writer's replica is still
//! refreshed when only the signal could not be written.

use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PublishConfig;
use crate::context::SyncContext;
use crate::error::Result;
use crate::lock::LockOutcome;
use crate::signal::ChangeSignal;
use crate::signature;

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    /// The signal as written, `None` if it could not be enqueued.
    pub signal: Option<ChangeSignal>,
    #[serde(serialize_with = "serialize_lock_outcome")]
    pub lock: LockOutcome,
    /// Cache generation after the local rebuild, `None` if it failed.
    pub generation: Option<u64>,
}

fn serialize_lock_outcome<S: serde::Serializer>(
    outcome: &LockOutcome,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(match outcome {
        LockOutcome::Acquired => "acquired",
        LockOutcome::TimedOut => "timed_out",
        LockOutcome::Unavailable => "unavailable",
    })
}

pub fn publish_change(ctx: &SyncContext) -> Result<PublishOutcome> {
    let signature = signature::compute(ctx.paths().primary())?;
    let signal = match ctx.queue().enqueue(ChangeSignal::new(
        ctx.session().clone(),
        crate::now_ms(),
        signature,
    )) {
        Ok(signal) => {
            info!(
                session_id = %signal.origin,
                timestamp_ms = signal.timestamp_ms,
                signature = signal.signature.as_ref().map(|sig| sig.short()).unwrap_or("-"),
                "Published change signal"
            );
            Some(signal)
        }
        Err(err) => {
            warn!(
                session_id = %ctx.session(),
                error = %err,
                "Failed to write change signal; other processes will miss this write"
            );
            None
        }
    };

    let delay = publish_delay(&ctx.config().publish);
    if !delay.is_zero() {
        debug!(delay_ms = delay.as_millis() as u64, "Staggering local cache rebuild");
        thread::sleep(delay);
    }

    let wait = ctx.config().publish_lock_wait();
    let started = Instant::now();
    if !ctx.lock().wait_for_release(wait) {
        debug!(
            wait_ms = wait.as_millis() as u64,
            "Rebuild lock still held; rebuilding without it"
        );
    }
    let remaining = wait.saturating_sub(started.elapsed());

    let (rebuilt, lock) = ctx.rebuild_cache_within(remaining);
    let generation = match rebuilt {
        Ok(generation) => Some(generation),
        Err(err) => {
            warn!(error = %err, "Local cache rebuild after write failed");
            None
        }
    };

    Ok(PublishOutcome {
        signal,
        lock,
        generation,
    })
}

fn publish_delay(config: &PublishConfig) -> Duration {
    let min = config.delay_min_ms;
    let max = config.delay_max_ms.max(min);
    if max == min {
        return Duration::from_millis(min);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}
