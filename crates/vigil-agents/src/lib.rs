//! Vigil agents - fix agent contract, registry and routing
//!
//! Agents claim issues through a confidence score. The registry picks the
//! highest scorer per issue, leaves anything under the acceptance threshold
//! unassigned, and groups assignments into batches for the coordinator.

pub mod agent;
pub mod breaker;
pub mod builtin;
pub mod files;
pub mod registry;
pub mod router;

pub use agent::{sanitize_confidence, AgentContext, FixAgent};
pub use breaker::{CircuitBreaker, CircuitState};
pub use builtin::{registry_from_config, CommandAgent, WhitespaceAgent};
pub use files::ProjectFiles;
pub use registry::{AgentRegistry, Route, DEFAULT_CONFIDENCE_THRESHOLD};
pub use router::{plan, plan_excluding, AgentBatch, DispatchPlan, Unassigned};
