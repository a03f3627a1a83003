//! Progress event stream
//!
//! Events go out on a `tokio::sync::broadcast` channel: sending never
//! blocks and never fails the pipeline, and a consumer that falls behind
//! the buffer loses the oldest events (it sees `RecvError::Lagged`).

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use vigil_core::{HookResult, HookStatus};

use crate::state_machine::{HaltReason, Phase};

/// Default number of buffered events
pub const DEFAULT_BUFFER: usize = 256;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressKind {
    PhaseStarted,
    PhaseFinished,
    HookFinished { hook: String, status: HookStatus },
    IterationStarted,
    IterationFinished,
    Halted { reason: String },
    Completed,
}

/// One progress update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    #[serde(flatten)]
    pub kind: ProgressKind,
    pub phase: Phase,
    pub iteration: Option<usize>,
    pub issues_remaining: Option<usize>,
    /// Time since the sink was created
    pub elapsed: Duration,
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:>6.1}s] {}", self.elapsed.as_secs_f64(), self.phase)?;
        if let Some(iteration) = self.iteration {
            write!(f, " #{}", iteration)?;
        }
        match &self.kind {
            ProgressKind::PhaseStarted => write!(f, " started")?,
            ProgressKind::PhaseFinished => write!(f, " finished")?,
            ProgressKind::HookFinished { hook, status } => {
                write!(f, " {} {}", hook, status.as_str())?
            }
            ProgressKind::IterationStarted => write!(f, " iteration started")?,
            ProgressKind::IterationFinished => write!(f, " iteration finished")?,
            ProgressKind::Halted { reason } => write!(f, " halted: {}", reason)?,
            ProgressKind::Completed => write!(f, " complete")?,
        }
        if let Some(remaining) = self.issues_remaining {
            write!(f, " ({} issues remaining)", remaining)?;
        }
        Ok(())
    }
}

/// Best-effort publisher of [`ProgressEvent`]s
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: broadcast::Sender<ProgressEvent>,
    started: Instant,
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl ProgressSink {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            started: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(
        &self,
        kind: ProgressKind,
        phase: Phase,
        iteration: Option<usize>,
        issues_remaining: Option<usize>,
    ) {
        let event = ProgressEvent {
            kind,
            phase,
            iteration,
            issues_remaining,
            elapsed: self.started.elapsed(),
        };
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn phase_started(&self, phase: Phase) {
        self.emit(ProgressKind::PhaseStarted, phase, None, None);
    }

    pub fn phase_finished(&self, phase: Phase, issues_remaining: usize) {
        self.emit(ProgressKind::PhaseFinished, phase, None, Some(issues_remaining));
    }

    pub fn hook_finished(&self, phase: Phase, result: &HookResult) {
        self.emit(
            ProgressKind::HookFinished {
                hook: result.name.clone(),
                status: result.status,
            },
            phase,
            None,
            Some(result.issue_count()),
        );
    }

    pub fn iteration_started(&self, iteration: usize, issues_remaining: usize) {
        self.emit(
            ProgressKind::IterationStarted,
            Phase::AutofixLoop,
            Some(iteration),
            Some(issues_remaining),
        );
    }

    pub fn iteration_finished(&self, iteration: usize, issues_remaining: usize) {
        self.emit(
            ProgressKind::IterationFinished,
            Phase::AutofixLoop,
            Some(iteration),
            Some(issues_remaining),
        );
    }

    pub fn halted(
        &self,
        phase: Phase,
        reason: &HaltReason,
        iteration: Option<usize>,
        issues_remaining: usize,
    ) {
        self.emit(
            ProgressKind::Halted {
                reason: reason.to_string(),
            },
            phase,
            iteration,
            Some(issues_remaining),
        );
    }

    pub fn completed(&self) {
        self.emit(ProgressKind::Completed, Phase::Downstream, None, Some(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_emit_without_subscribers() {
        let sink = ProgressSink::new(4);
        sink.phase_started(Phase::FastHooks);
        sink.completed();
    }

    #[test]
    fn test_events_in_order() {
        let sink = ProgressSink::new(8);
        let mut rx = sink.subscribe();
        sink.phase_started(Phase::AutofixLoop);
        sink.iteration_started(1, 3);
        sink.iteration_finished(1, 2);

        assert_eq!(rx.try_recv().unwrap().kind, ProgressKind::PhaseStarted);
        let started = rx.try_recv().unwrap();
        assert_eq!(started.iteration, Some(1));
        assert_eq!(started.issues_remaining, Some(3));
        assert_eq!(rx.try_recv().unwrap().issues_remaining, Some(2));
    }

    #[test]
    fn test_slow_consumer_drops_oldest() {
        let sink = ProgressSink::new(2);
        let mut rx = sink.subscribe();
        for i in 1..=5 {
            sink.iteration_started(i, 10 - i);
        }

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(3))));
        assert_eq!(rx.try_recv().unwrap().iteration, Some(4));
        assert_eq!(rx.try_recv().unwrap().iteration, Some(5));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_display() {
        let sink = ProgressSink::new(2);
        let mut rx = sink.subscribe();
        sink.halted(Phase::AutofixLoop, &HaltReason::Exhausted, Some(5), 2);
        let line = rx.try_recv().unwrap().to_string();
        assert!(line.contains("autofix-loop #5 halted: iteration budget exhausted"));
        assert!(line.contains("(2 issues remaining)"));
    }
}
