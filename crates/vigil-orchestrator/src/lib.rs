//! # vigil-orchestrator
//!
//! Phase orchestration for Vigil.
//!
//! This crate provides:
//! - Issue aggregation and deduplication across hook results
//! - The autofix coordinator and its bounded iteration loop
//! - A pure phase state machine and the pipeline that drives it
//! - The sync/async bridge used to call agents from synchronous code
//! - Progress events and the machine-readable run report

pub mod aggregator;
pub mod bridge;
pub mod coordinator;
pub mod downstream;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod state_machine;

pub use aggregator::{aggregate, Aggregation, ExtractionFailure, HookFault};
pub use bridge::{AsyncBridge, BridgeStrategy};
pub use coordinator::{
    AgentFailure, AutofixCoordinator, AutofixReport, AutofixSettings, CoordinatorState,
    IterationRecord, LoopOutcome, UnassignedIssue,
};
pub use downstream::{CommandStep, DownstreamStep, StepContext, StepOutcome};
pub use orchestrator::{PhaseSelection, Pipeline, PipelineOptions};
pub use progress::{ProgressEvent, ProgressKind, ProgressSink};
pub use report::{PipelineReport, RunStatus};
pub use state_machine::{
    transition, Action, Event, HaltReason, Phase, Policy, StageSummary, State, EXIT_CANCELLED,
    EXIT_EXHAUSTED, EXIT_FAILED, EXIT_HOOKS_FAILED, EXIT_SUCCESS, EXIT_TOOL_ERROR,
};
