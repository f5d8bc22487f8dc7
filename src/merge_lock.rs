//! Merge coordinator: a single-holder lock around "integrate into the shared
//! branch".
//!
//! The lock record file's presence is the Held state. Every transition runs
//! under an advisory guard lock, so check-then-write sequences (including
//! stale takeover) cannot interleave between processes. Waiters queue with
//! numbered tickets and only the oldest live ticket may take a free lock.
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::paths::StorePaths;
use crate::util::{
    append_jsonl, duration_ms, now_epoch_ms, read_json_optional, read_json_or_default,
    with_exclusive_lock, write_json_atomic,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const LOCK_SCHEMA_VERSION: u32 = 1;

/// Current holder of the merge lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub schema_version: u32,
    pub operation_id: String,
    pub pid: u32,
    pub actor: String,
    pub acquired_at_epoch_ms: u64,
    /// Declared operation timeout; staleness is a multiple of this.
    pub timeout_secs: u64,
}

impl LockRecord {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.acquired_at_epoch_ms)
    }

    pub fn is_stale(&self, now_ms: u64, multiplier: u32) -> bool {
        let threshold_ms = self
            .timeout_secs
            .saturating_mul(1000)
            .saturating_mul(u64::from(multiplier));
        self.age_ms(now_ms) > threshold_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Free,
    Held {
        record: LockRecord,
        age_ms: u64,
        stale: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    Acquired,
    AcquiredAfterWait { waited_ms: u64, queue_position: usize },
    StaleTakeover { previous: LockRecord },
}

/// Result of a single non-blocking attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryAcquire {
    Acquired(AcquireOutcome),
    Busy(LockRecord),
    /// The lock is free or stale but earlier waiters are queued for it.
    Queued { waiting: usize },
}

/// Who is asking and for how long they expect to hold the lock.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub operation_id: String,
    pub actor: String,
    pub operation_timeout: Duration,
}

impl AcquireRequest {
    pub fn new(operation_id: impl Into<String>, config: &GateConfig) -> Self {
        Self {
            operation_id: operation_id.into(),
            actor: default_actor(),
            operation_timeout: config.operation_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    StaleTakeover,
    ForceRelease,
}

/// One line of `lock/audit.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<LockRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_operation: Option<String>,
    pub actor: String,
    pub at_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueTicket {
    ticket: u64,
    operation_id: String,
    pid: u32,
    enqueued_at_epoch_ms: u64,
    deadline_epoch_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TicketCounter {
    last: u64,
}

/// Handle onto `lock/` in a gate store.
#[derive(Debug, Clone)]
pub struct MergeCoordinator {
    paths: StorePaths,
    stale_multiplier: u32,
    acquire_timeout: Duration,
    poll_interval: Duration,
}

impl MergeCoordinator {
    pub fn new(paths: StorePaths, config: &GateConfig) -> Self {
        Self {
            paths,
            stale_multiplier: config.stale_multiplier.max(1),
            acquire_timeout: config.merge_timeout,
            poll_interval: config.merge_poll_interval,
        }
    }

    /// Override the bounded-wait window for this handle.
    pub fn with_wait(mut self, acquire_timeout: Duration, poll_interval: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        if !poll_interval.is_zero() {
            self.poll_interval = poll_interval;
        }
        self
    }

    pub fn status(&self) -> Result<LockState> {
        let now = now_epoch_ms();
        Ok(match self.read_record()? {
            None => LockState::Free,
            Some(record) => LockState::Held {
                age_ms: record.age_ms(now),
                stale: record.is_stale(now, self.stale_multiplier),
                record,
            },
        })
    }

    /// One attempt: take a free lock, take over a stale one, or report the
    /// live holder. Never overtakes queued waiters.
    pub fn try_acquire(&self, request: &AcquireRequest) -> Result<TryAcquire> {
        self.guarded(|| {
            let now = now_epoch_ms();
            let waiting = self.live_tickets(now)?.len();
            if waiting > 0 {
                match self.read_record()? {
                    Some(current) if current.operation_id == request.operation_id => {}
                    Some(current) if !current.is_stale(now, self.stale_multiplier) => {
                        return Ok(TryAcquire::Busy(current));
                    }
                    _ => {
                        tracing::debug!(operation_id = %request.operation_id, waiting, "lock reserved for queued waiters");
                        return Ok(TryAcquire::Queued { waiting });
                    }
                }
            }
            self.try_acquire_locked(request)
        })
    }

    /// Block with FIFO ordering until acquired or the wait window elapses.
    pub fn acquire(&self, request: &AcquireRequest) -> Result<AcquireOutcome> {
        let never = AtomicBool::new(false);
        self.acquire_with_cancel(request, &never)
    }

    /// Blocking acquire that gives up cleanly when `cancel` is set.
    ///
    /// A cancelled or timed-out waiter leaves the queue and never touches
    /// the lock record.
    pub fn acquire_with_cancel(
        &self,
        request: &AcquireRequest,
        cancel: &AtomicBool,
    ) -> Result<AcquireOutcome> {
        let started = Instant::now();
        let deadline_ms = now_epoch_ms().saturating_add(duration_ms(self.acquire_timeout));
        let (ticket, queue_position) = self.enqueue(request, deadline_ms)?;
        let mut waited = false;
        loop {
            if cancel.load(Ordering::SeqCst) {
                tracing::info!(operation_id = %request.operation_id, "acquire cancelled");
                return Err(GateError::Cancelled {
                    operation_id: request.operation_id.clone(),
                });
            }
            let attempt = self.guarded(|| {
                if !self.is_queue_head(ticket.number)? {
                    return Ok(None);
                }
                self.try_acquire_locked(request).map(Some)
            })?;
            let holder = match attempt {
                Some(TryAcquire::Acquired(outcome)) => {
                    drop(ticket);
                    let outcome = match outcome {
                        AcquireOutcome::Acquired if waited => AcquireOutcome::AcquiredAfterWait {
                            waited_ms: duration_ms(started.elapsed()),
                            queue_position,
                        },
                        other => other,
                    };
                    return Ok(outcome);
                }
                Some(TryAcquire::Busy(holder)) => Some(holder),
                Some(TryAcquire::Queued { .. }) | None => None,
            };
            let elapsed = started.elapsed();
            if elapsed >= self.acquire_timeout {
                let holder = match holder {
                    Some(holder) => Some(holder),
                    None => self.read_record()?,
                };
                tracing::warn!(operation_id = %request.operation_id, waited_ms = duration_ms(elapsed), "acquire timed out");
                return Err(GateError::AcquireTimeout {
                    operation_id: request.operation_id.clone(),
                    holder: holder.map(Box::new),
                    waited: elapsed,
                });
            }
            if !waited {
                tracing::info!(operation_id = %request.operation_id, queue_position, "waiting for merge lock");
                waited = true;
            }
            let remaining = self.acquire_timeout - elapsed;
            std::thread::sleep(self.poll_interval.min(remaining));
        }
    }

    /// Release the lock; only the current holder may do this.
    pub fn release(&self, operation_id: &str) -> Result<LockRecord> {
        self.guarded(|| {
            let record = self.read_record()?;
            match record {
                Some(record) if record.operation_id == operation_id => {
                    remove_if_present(self.paths.lock_record_path())?;
                    tracing::info!(operation_id, "merge lock released");
                    Ok(record)
                }
                other => Err(GateError::NotHolder {
                    operation_id: operation_id.to_string(),
                    holder: other.map(Box::new),
                }),
            }
        })
    }

    /// Administrative override. Always succeeds and audits the prior holder.
    pub fn force_release(&self, actor: &str) -> Result<Option<LockRecord>> {
        self.guarded(|| {
            // A record that no longer parses is still removed.
            let previous = self.read_record().unwrap_or(None);
            remove_if_present(self.paths.lock_record_path())?;
            append_jsonl(
                &self.paths.lock_audit_path(),
                &AuditEntry {
                    action: AuditAction::ForceRelease,
                    previous: previous.clone(),
                    by_operation: None,
                    actor: actor.to_string(),
                    at_epoch_ms: now_epoch_ms(),
                },
            )?;
            match &previous {
                Some(record) => tracing::warn!(
                    previous_operation = %record.operation_id,
                    previous_pid = record.pid,
                    actor,
                    "merge lock force-released"
                ),
                None => tracing::warn!(actor, "force-release on a free merge lock"),
            }
            Ok(previous)
        })
    }

    /// Audit entries in append order.
    pub fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        let path = self.paths.lock_audit_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(GateError::io(&path, err)),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| GateError::Corrupt {
                    path: path.clone(),
                    reason: err.to_string(),
                })
            })
            .collect()
    }

    /// Number of live wait tickets.
    pub fn queue_len(&self) -> Result<usize> {
        Ok(self.live_tickets(now_epoch_ms())?.len())
    }

    fn try_acquire_locked(&self, request: &AcquireRequest) -> Result<TryAcquire> {
        let now = now_epoch_ms();
        let fresh = LockRecord {
            schema_version: LOCK_SCHEMA_VERSION,
            operation_id: request.operation_id.clone(),
            pid: std::process::id(),
            actor: request.actor.clone(),
            acquired_at_epoch_ms: now,
            timeout_secs: request.operation_timeout.as_secs().max(1),
        };
        match self.read_record()? {
            None => {
                write_json_atomic(&self.paths.lock_record_path(), &fresh)?;
                tracing::info!(operation_id = %fresh.operation_id, "merge lock acquired");
                Ok(TryAcquire::Acquired(AcquireOutcome::Acquired))
            }
            Some(current) if current.operation_id == request.operation_id => {
                tracing::debug!(operation_id = %current.operation_id, "merge lock already held by caller");
                Ok(TryAcquire::Acquired(AcquireOutcome::Acquired))
            }
            Some(current) if current.is_stale(now, self.stale_multiplier) => {
                write_json_atomic(&self.paths.lock_record_path(), &fresh)?;
                append_jsonl(
                    &self.paths.lock_audit_path(),
                    &AuditEntry {
                        action: AuditAction::StaleTakeover,
                        previous: Some(current.clone()),
                        by_operation: Some(fresh.operation_id.clone()),
                        actor: fresh.actor.clone(),
                        at_epoch_ms: now,
                    },
                )?;
                tracing::warn!(
                    previous_operation = %current.operation_id,
                    previous_pid = current.pid,
                    age_ms = current.age_ms(now),
                    operation_id = %fresh.operation_id,
                    "stale merge lock taken over"
                );
                Ok(TryAcquire::Acquired(AcquireOutcome::StaleTakeover {
                    previous: current,
                }))
            }
            Some(current) => Ok(TryAcquire::Busy(current)),
        }
    }

    fn guarded<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        with_exclusive_lock(&self.paths.lock_guard_path(), f)
    }

    fn read_record(&self) -> Result<Option<LockRecord>> {
        read_json_optional(&self.paths.lock_record_path())
    }

    fn enqueue(&self, request: &AcquireRequest, deadline_ms: u64) -> Result<(Ticket, usize)> {
        self.guarded(|| {
            let counter_path = self.paths.lock_ticket_counter_path();
            let mut counter: TicketCounter = read_json_or_default(&counter_path)?;
            counter.last += 1;
            write_json_atomic(&counter_path, &counter)?;
            let now = now_epoch_ms();
            let ahead = self.live_tickets(now)?.len();
            let ticket = QueueTicket {
                ticket: counter.last,
                operation_id: request.operation_id.clone(),
                pid: std::process::id(),
                enqueued_at_epoch_ms: now,
                deadline_epoch_ms: deadline_ms,
            };
            let path = self.ticket_path(ticket.ticket);
            write_json_atomic(&path, &ticket)?;
            Ok((
                Ticket {
                    number: ticket.ticket,
                    path,
                },
                ahead,
            ))
        })
    }

    /// Live tickets ordered by number; tickets past their deadline plus a
    /// grace period are swept, since their owner can no longer be waiting.
    fn live_tickets(&self, now_ms: u64) -> Result<Vec<QueueTicket>> {
        let dir = self.paths.lock_queue_dir();
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(GateError::io(&dir, err)),
        };
        let grace_ms = duration_ms(self.poll_interval).saturating_mul(4);
        let mut tickets = Vec::new();
        for dirent in listing {
            let path = dirent.map_err(|err| GateError::io(&dir, err))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let ticket: QueueTicket = match read_json_optional(&path) {
                Ok(Some(ticket)) => ticket,
                Ok(None) => continue,
                Err(GateError::Corrupt { .. }) => {
                    remove_if_present(path)?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if now_ms > ticket.deadline_epoch_ms.saturating_add(grace_ms) {
                tracing::debug!(ticket = ticket.ticket, operation_id = %ticket.operation_id, "sweeping abandoned queue ticket");
                remove_if_present(path)?;
                continue;
            }
            tickets.push(ticket);
        }
        tickets.sort_by_key(|ticket| ticket.ticket);
        Ok(tickets)
    }

    fn is_queue_head(&self, number: u64) -> Result<bool> {
        let tickets = self.live_tickets(now_epoch_ms())?;
        Ok(tickets.first().is_none_or(|head| head.ticket == number))
    }

    fn ticket_path(&self, number: u64) -> PathBuf {
        self.paths.lock_queue_dir().join(format!("{number:020}.json"))
    }
}

/// Queue membership; dropping it leaves the queue.
struct Ticket {
    number: u64,
    path: PathBuf,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), %err, "failed to remove queue ticket");
            }
        }
    }
}

fn remove_if_present(path: PathBuf) -> Result<()> {
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(GateError::io(path, err)),
    }
}

/// Actor name recorded on acquisitions when none is given.
pub fn default_actor() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests;
