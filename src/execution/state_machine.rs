//! C7 - Execution State Machine (spec.md §4.7).
//!
//! Transitions are serialized per execution by an internal `Mutex`
//! (spec.md §5's "per-execution lock" design), not by a single global
//! lock shared across all executions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::model::{Execution, ExecutionStatus, JobStatus};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal transition from {from:?} to {to:?}")]
pub struct IllegalTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

fn allowed(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    use ExecutionStatus::*;
    matches!(
        (from, to),
        (Created, Assigned)
            | (Created, Cancelled)
            | (Assigned, Started)
            | (Assigned, Cancelled)
            | (Assigned, Timeout)
            | (Started, Completed)
            | (Started, Failed)
            | (Started, Cancelled)
            | (Started, Timeout)
    )
}

struct Inner {
    execution: Execution,
    pending_acks: HashSet<String>,
}

/// Owns one `Execution`'s mutable state and its reactive status feed,
/// consumed by C9 for fanout.
pub struct ExecutionStateMachine {
    inner: Mutex<Inner>,
    status_tx: watch::Sender<ExecutionStatus>,
    cancel_requested: AtomicBool,
}

impl ExecutionStateMachine {
    pub fn new(execution: Execution) -> Self {
        let (status_tx, _) = watch::channel(execution.status);
        Self {
            inner: Mutex::new(Inner {
                execution,
                pending_acks: HashSet::new(),
            }),
            status_tx,
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Recorded by `Engine::cancel` (spec.md §5) so a worker's
    /// in-flight `ExecutionResult{success=false}` - arriving after the
    /// `CancelSignal` but before the grace period forces the issue - is
    /// attributed to the cancellation rather than treated as an
    /// ordinary failure (spec.md §8 scenario S6).
    pub fn mark_cancel_requested(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }

    pub async fn current(&self) -> Execution {
        self.inner.lock().await.execution.clone()
    }

    /// Attempts the transition; illegal transitions are refused, logged
    /// by the caller, and the inbound message dropped (spec.md §4.7) -
    /// this returns the error rather than panicking so callers can log
    /// and continue.
    pub async fn transition(
        &self,
        to: ExecutionStatus,
        requires_ack: Option<String>,
    ) -> Result<Execution, IllegalTransition> {
        self.transition_with(to, requires_ack, |_| {}).await
    }

    /// As [`Self::transition`], but also applies `mutate` to the
    /// execution (e.g. to record `error_message`/`exit_code`) while
    /// still holding the per-execution lock, so the extra fields land
    /// atomically with the status change.
    pub async fn transition_with(
        &self,
        to: ExecutionStatus,
        requires_ack: Option<String>,
        mutate: impl FnOnce(&mut Execution),
    ) -> Result<Execution, IllegalTransition> {
        let mut guard = self.inner.lock().await;
        let from = guard.execution.status;
        if from.is_terminal() || !allowed(from, to) {
            return Err(IllegalTransition { from, to });
        }

        guard.execution.record_transition(to, Utc::now());
        mutate(&mut guard.execution);
        if let Some(message_id) = requires_ack {
            guard.pending_acks.insert(message_id);
        }
        let updated = guard.execution.clone();
        drop(guard);

        let _ = self.status_tx.send(to);
        Ok(updated)
    }

    /// A transition flagged `requiresAck` is not durable until this is
    /// called with its `messageId`.
    pub async fn acknowledge(&self, message_id: &str) -> bool {
        self.inner.lock().await.pending_acks.remove(message_id)
    }

    pub async fn has_pending_ack(&self, message_id: &str) -> bool {
        self.inner.lock().await.pending_acks.contains(message_id)
    }

    pub fn project_job_status(status: ExecutionStatus) -> JobStatus {
        status.project_job_status()
    }
}

pub type SharedStateMachine = Arc<ExecutionStateMachine>;
