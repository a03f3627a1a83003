//! Pure state machine for pipeline phase sequencing
//!
//! This module implements a pure functional state machine with NO I/O.
//! The orchestrator executes the returned actions and feeds their outcome
//! back as the next event.
//!
//! Key design principles:
//! - Pure function: transition(state, event, policy) -> (state, actions)
//! - No async, no I/O
//! - Invalid transitions halt with an internal error (never panic)
//! - Nothing downstream runs while known issues remain

use serde::{Deserialize, Serialize};
use vigil_core::ErrorClass;

use crate::aggregator::{Aggregation, ExtractionFailure};
use crate::coordinator::LoopOutcome;

/// Exit code for a clean run
pub const EXIT_SUCCESS: i32 = 0;
/// Hooks failed and autofix was off
pub const EXIT_HOOKS_FAILED: i32 = 1;
/// Autofix ran out of iterations
pub const EXIT_EXHAUSTED: i32 = 2;
/// Internal or invariant failure
pub const EXIT_FAILED: i32 = 3;
/// A tool could not be launched or never finished
pub const EXIT_TOOL_ERROR: i32 = 4;
pub const EXIT_CANCELLED: i32 = 130;

/// Pipeline phase, as reported in progress events and halt diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    ConfigPrep,
    FastHooks,
    ComprehensiveHooks,
    AutofixLoop,
    ReVerification,
    Downstream,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigPrep => "config-prep",
            Self::FastHooks => "fast-hooks",
            Self::ComprehensiveHooks => "comprehensive-hooks",
            Self::AutofixLoop => "autofix-loop",
            Self::ReVerification => "re-verification",
            Self::Downstream => "downstream",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the pipeline stopped short of completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum HaltReason {
    /// Hooks failed and autofix was not enabled
    HooksFailed,
    /// The iteration budget ran out, or the confirmation pass found issues
    Exhausted,
    Failed { class: ErrorClass, message: String },
    DownstreamFailed { step: String, message: String },
    Cancelled,
}

impl HaltReason {
    /// Process exit code for this halt
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::HooksFailed | Self::DownstreamFailed { .. } => EXIT_HOOKS_FAILED,
            Self::Exhausted => EXIT_EXHAUSTED,
            Self::Cancelled => EXIT_CANCELLED,
            Self::Failed { class, .. } => match class {
                ErrorClass::UnrecoverableToolFailure | ErrorClass::HookTimeout => EXIT_TOOL_ERROR,
                ErrorClass::Cancelled => EXIT_CANCELLED,
                _ => EXIT_FAILED,
            },
        }
    }

    /// Error class behind the halt, if it was an error
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Failed { class, .. } => Some(*class),
            Self::Cancelled => Some(ErrorClass::Cancelled),
            _ => None,
        }
    }

    fn failed(failure: ExtractionFailure) -> Self {
        if failure.class == ErrorClass::Cancelled {
            return Self::Cancelled;
        }
        Self::Failed {
            class: failure.class,
            message: failure.message,
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HooksFailed => write!(f, "hooks failed"),
            Self::Exhausted => write!(f, "iteration budget exhausted"),
            Self::Failed { class, message } => write!(f, "failed ({}): {}", class, message),
            Self::DownstreamFailed { step, message } => {
                write!(f, "downstream step {} failed: {}", step, message)
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Pipeline state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Initial state - configuration loaded, nothing run yet
    ConfigPrep,
    /// Fast hooks running; `attempt` is 1 or 2
    FastHooks { attempt: u8 },
    ComprehensiveHooks,
    AutofixLoop,
    /// Confirmation pass after the autofix loop converged
    ReVerification,
    Downstream,
    Complete,
    Halted { phase: Phase, reason: HaltReason },
}

impl State {
    /// Phase this state belongs to; `None` once terminal
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::ConfigPrep => Some(Phase::ConfigPrep),
            Self::FastHooks { .. } => Some(Phase::FastHooks),
            Self::ComprehensiveHooks => Some(Phase::ComprehensiveHooks),
            Self::AutofixLoop => Some(Phase::AutofixLoop),
            Self::ReVerification => Some(Phase::ReVerification),
            Self::Downstream => Some(Phase::Downstream),
            Self::Complete | Self::Halted { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Halted { .. })
    }
}

/// What the run was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub run_fast: bool,
    pub run_comprehensive: bool,
    pub autofix: bool,
    pub downstream: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            run_fast: true,
            run_comprehensive: true,
            autofix: false,
            downstream: true,
        }
    }
}

/// Condensed outcome of a hook stage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageSummary {
    /// Hooks that failed, timed out or errored
    pub blocking_hooks: usize,
    /// Deduplicated issues agents could work on
    pub outstanding_issues: usize,
    /// Set when hooks block but nothing workable was extracted
    pub failure: Option<ExtractionFailure>,
}

impl StageSummary {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn from_aggregation(agg: &Aggregation) -> Self {
        Self {
            blocking_hooks: agg.blocking_count(),
            outstanding_issues: agg.issue_count(),
            failure: agg.extraction_failure(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.blocking_hooks == 0
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Configuration ready, start the run
    Start,
    FastHooksFinished(StageSummary),
    /// Summary covers the latest results of both stages
    ComprehensiveHooksFinished(StageSummary),
    AutofixFinished(LoopOutcome),
    ConfirmationFinished(StageSummary),
    DownstreamPassed,
    DownstreamFailed { step: String, message: String },
    Cancelled,
    Error { class: ErrorClass, message: String },
}

/// Actions to execute as side effects of transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RunFastHooks { attempt: u8 },
    RunComprehensiveHooks,
    RunAutofix,
    /// Re-run every selected stage once more
    RunConfirmation,
    RunDownstream,
    LogActivity { message: String },
}

fn log(message: impl Into<String>) -> Action {
    Action::LogActivity {
        message: message.into(),
    }
}

fn halt(phase: Phase, reason: HaltReason) -> (State, Vec<Action>) {
    let actions = vec![log(format!("Halted in {}: {}", phase, reason))];
    (State::Halted { phase, reason }, actions)
}

fn downstream_or_complete(policy: &Policy) -> (State, Vec<Action>) {
    if policy.downstream {
        (
            State::Downstream,
            vec![log("All hooks clean, running downstream steps"), Action::RunDownstream],
        )
    } else {
        (State::Complete, vec![log("All hooks clean")])
    }
}

fn enter_comprehensive() -> (State, Vec<Action>) {
    (State::ComprehensiveHooks, vec![Action::RunComprehensiveHooks])
}

fn enter_autofix(outstanding: usize) -> (State, Vec<Action>) {
    (
        State::AutofixLoop,
        vec![
            log(format!("{} issues outstanding, starting autofix", outstanding)),
            Action::RunAutofix,
        ],
    )
}

/// Next step once the fast stage is settled
fn after_fast(summary: &StageSummary, policy: &Policy) -> (State, Vec<Action>) {
    if policy.run_comprehensive {
        enter_comprehensive()
    } else if !summary.is_clean() && policy.autofix {
        enter_autofix(summary.outstanding_issues)
    } else {
        downstream_or_complete(policy)
    }
}

/// Pure state transition function
///
/// Takes the current state, an event and the run policy; returns the new
/// state and the actions to execute. Completely deterministic.
///
/// # Invalid Transitions
/// Any invalid transition halts with an `internal` error class.
/// This function never panics.
pub fn transition(state: State, event: Event, policy: &Policy) -> (State, Vec<Action>) {
    match (state, event) {
        // From ConfigPrep
        (State::ConfigPrep, Event::Start) => {
            if policy.run_fast {
                (
                    State::FastHooks { attempt: 1 },
                    vec![log("Starting fast hooks"), Action::RunFastHooks { attempt: 1 }],
                )
            } else if policy.run_comprehensive {
                enter_comprehensive()
            } else {
                halt(
                    Phase::ConfigPrep,
                    HaltReason::Failed {
                        class: ErrorClass::ConfigError,
                        message: "no hook stage selected".to_string(),
                    },
                )
            }
        }

        // From FastHooks
        (State::FastHooks { .. }, Event::FastHooksFinished(summary)) if summary.is_clean() => {
            after_fast(&summary, policy)
        }

        (State::FastHooks { attempt: 1 }, Event::FastHooksFinished(summary)) => (
            State::FastHooks { attempt: 2 },
            vec![
                log(format!(
                    "{} fast hooks failed, retrying once",
                    summary.blocking_hooks
                )),
                Action::RunFastHooks { attempt: 2 },
            ],
        ),

        (State::FastHooks { .. }, Event::FastHooksFinished(summary)) => {
            if let Some(failure) = summary.failure.clone() {
                halt(Phase::FastHooks, HaltReason::failed(failure))
            } else if policy.autofix {
                after_fast(&summary, policy)
            } else {
                halt(Phase::FastHooks, HaltReason::HooksFailed)
            }
        }

        // From ComprehensiveHooks
        (State::ComprehensiveHooks, Event::ComprehensiveHooksFinished(summary)) => {
            if summary.is_clean() {
                downstream_or_complete(policy)
            } else if let Some(failure) = summary.failure {
                halt(Phase::ComprehensiveHooks, HaltReason::failed(failure))
            } else if policy.autofix {
                enter_autofix(summary.outstanding_issues)
            } else {
                halt(Phase::ComprehensiveHooks, HaltReason::HooksFailed)
            }
        }

        // From AutofixLoop
        (State::AutofixLoop, Event::AutofixFinished(outcome)) => match outcome {
            LoopOutcome::Converged => (
                State::ReVerification,
                vec![log("Autofix converged, confirming"), Action::RunConfirmation],
            ),
            LoopOutcome::Exhausted => halt(Phase::AutofixLoop, HaltReason::Exhausted),
            LoopOutcome::Failed { class, message } => halt(
                Phase::AutofixLoop,
                HaltReason::failed(ExtractionFailure { class, message }),
            ),
        },

        // From ReVerification
        (State::ReVerification, Event::ConfirmationFinished(summary)) => {
            if summary.is_clean() {
                downstream_or_complete(policy)
            } else if let Some(failure) = summary.failure {
                halt(Phase::ReVerification, HaltReason::failed(failure))
            } else {
                halt(Phase::ReVerification, HaltReason::Exhausted)
            }
        }

        // From Downstream
        (State::Downstream, Event::DownstreamPassed) => {
            (State::Complete, vec![log("Pipeline complete")])
        }

        (State::Downstream, Event::DownstreamFailed { step, message }) => {
            halt(Phase::Downstream, HaltReason::DownstreamFailed { step, message })
        }

        // Terminal states - no valid transitions
        (State::Complete, event) => halt(
            Phase::Downstream,
            HaltReason::Failed {
                class: ErrorClass::Internal,
                message: format!("Invalid transition from Complete on event: {:?}", event),
            },
        ),

        (State::Halted { phase, reason }, event) => (
            State::Halted {
                phase,
                reason: HaltReason::Failed {
                    class: ErrorClass::Internal,
                    message: format!(
                        "Invalid transition from Halted ({}) on event: {:?}",
                        reason, event
                    ),
                },
            },
            vec![],
        ),

        // Cancellation and errors from any live state
        (state, Event::Cancelled) => halt(
            state.phase().unwrap_or(Phase::ConfigPrep),
            HaltReason::Cancelled,
        ),

        (state, Event::Error { class, message }) => halt(
            state.phase().unwrap_or(Phase::ConfigPrep),
            HaltReason::failed(ExtractionFailure { class, message }),
        ),

        // All other invalid transitions
        (state, event) => halt(
            state.phase().unwrap_or(Phase::ConfigPrep),
            HaltReason::Failed {
                class: ErrorClass::Internal,
                message: format!(
                    "Invalid state transition: {:?} cannot handle event {:?}",
                    state, event
                ),
            },
        ),
    }
}
