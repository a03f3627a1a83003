//! Agent registry and confidence router

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vigil_core::Issue;

use crate::agent::{sanitize_confidence, FixAgent};
use crate::breaker::CircuitBreaker;

/// Minimum confidence for an assignment
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

struct Entry {
    agent: Arc<dyn FixAgent>,
    breaker: CircuitBreaker,
}

/// An agent chosen for an issue
#[derive(Clone)]
pub struct Route {
    pub agent: Arc<dyn FixAgent>,
    pub confidence: f64,
    /// Registration index, used for deterministic ordering
    pub order: usize,
}

impl Route {
    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("agent", &self.agent.name())
            .field("confidence", &self.confidence)
            .finish()
    }
}

/// Agents in registration order, each guarded by a circuit breaker
pub struct AgentRegistry {
    entries: Vec<Entry>,
    threshold: f64,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(60),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = sanitize_confidence(threshold);
        self
    }

    /// Breaker settings for agents registered after this call
    pub fn with_breaker(mut self, failures: u32, cooldown: Duration) -> Self {
        self.breaker_threshold = failures;
        self.breaker_cooldown = cooldown;
        self
    }

    pub fn register(&mut self, agent: Arc<dyn FixAgent>) {
        if self.get(agent.name()).is_some() {
            warn!("Agent {} registered twice; keeping both", agent.name());
        }
        debug!(
            "Registered agent {} (base confidence {:.2})",
            agent.name(),
            agent.descriptor().base_confidence
        );
        self.entries.push(Entry {
            agent,
            breaker: CircuitBreaker::new(self.breaker_threshold, self.breaker_cooldown),
        });
    }

    pub fn with_agent(mut self, agent: Arc<dyn FixAgent>) -> Self {
        self.register(agent);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.agent.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FixAgent>> {
        self.entries
            .iter()
            .find(|e| e.agent.name() == name)
            .map(|e| Arc::clone(&e.agent))
    }

    /// Whether any agent can currently take work
    pub fn any_available(&self) -> bool {
        self.entries.iter().any(|e| e.breaker.can_execute())
    }

    pub fn record_success(&self, name: &str) {
        if let Some(entry) = self.entries.iter().find(|e| e.agent.name() == name) {
            entry.breaker.record_success();
        }
    }

    pub fn record_failure(&self, name: &str) {
        if let Some(entry) = self.entries.iter().find(|e| e.agent.name() == name) {
            entry.breaker.record_failure();
            if !entry.breaker.can_execute() {
                warn!(
                    "Agent {} disabled after {} consecutive failures",
                    name,
                    entry.breaker.failure_count()
                );
            }
        }
    }

    /// Highest-confidence available agent for `issue`, regardless of threshold.
    ///
    /// Ties go to the higher base confidence, then to the earlier registration.
    pub fn best_candidate(&self, issue: &Issue, exclude: Option<&str>) -> Option<Route> {
        let mut best: Option<Route> = None;

        for (order, entry) in self.entries.iter().enumerate() {
            if exclude == Some(entry.agent.name()) || !entry.breaker.can_execute() {
                continue;
            }
            let confidence = sanitize_confidence(entry.agent.can_handle(issue));
            let better = match &best {
                None => true,
                Some(current) => {
                    confidence > current.confidence
                        || (confidence == current.confidence
                            && entry.agent.descriptor().base_confidence
                                > current.agent.descriptor().base_confidence)
                }
            };
            if better {
                best = Some(Route {
                    agent: Arc::clone(&entry.agent),
                    confidence,
                    order,
                });
            }
        }
        best
    }

    /// Agent assigned to `issue`, if one clears the confidence threshold
    pub fn route(&self, issue: &Issue) -> Option<Route> {
        self.route_excluding(issue, None)
    }

    pub fn route_excluding(&self, issue: &Issue, exclude: Option<&str>) -> Option<Route> {
        self.best_candidate(issue, exclude)
            .filter(|route| route.confidence >= self.threshold)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::AgentContext;
    use async_trait::async_trait;
    use vigil_core::{AgentDescriptor, FixResult, IssueType, Result, Severity, Stage};

    /// Agent scoring a fixed confidence for its declared types
    pub(crate) struct ScoredAgent {
        descriptor: AgentDescriptor,
        score: f64,
    }

    impl ScoredAgent {
        pub(crate) fn new(name: &str, base: f64, score: f64, types: &[IssueType]) -> Arc<Self> {
            Arc::new(Self {
                descriptor: AgentDescriptor::new(name, base).with_capabilities(types.iter().copied()),
                score,
            })
        }
    }

    #[async_trait]
    impl FixAgent for ScoredAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        fn can_handle(&self, issue: &Issue) -> f64 {
            if self.descriptor.handles(issue.issue_type) {
                self.score
            } else {
                0.0
            }
        }

        async fn fix(&self, _issues: &[Issue], _ctx: &AgentContext) -> Result<FixResult> {
            Ok(FixResult::success(self.name(), self.score))
        }
    }

    pub(crate) fn issue(issue_type: IssueType, message: &str) -> Issue {
        Issue::new(issue_type, Severity::Medium, message, "tool", Stage::ComprehensiveHooks)
            .unwrap()
            .at(Some("a.py".to_string()), Some(1))
    }

    #[test]
    fn test_routes_to_max_confidence() {
        let registry = AgentRegistry::new()
            .with_agent(ScoredAgent::new("security", 0.9, 0.9, &[IssueType::Security]))
            .with_agent(ScoredAgent::new("fmt", 0.6, 0.6, &IssueType::ALL));

        let route = registry.route(&issue(IssueType::Security, "eval")).unwrap();
        assert_eq!(route.agent_name(), "security");
        assert_eq!(route.confidence, 0.9);

        assert!(registry.route(&issue(IssueType::Formatting, "long line")).is_none());
        let candidate = registry
            .best_candidate(&issue(IssueType::Formatting, "long line"), None)
            .unwrap();
        assert_eq!(candidate.agent_name(), "fmt");
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let registry =
            AgentRegistry::new().with_agent(ScoredAgent::new("edge", 0.5, 0.7, &[IssueType::Other]));
        assert!(registry.route(&issue(IssueType::Other, "x")).is_some());
    }

    #[test]
    fn test_ties_break_by_base_then_order() {
        let registry = AgentRegistry::new()
            .with_agent(ScoredAgent::new("first", 0.5, 0.8, &[IssueType::DeadCode]))
            .with_agent(ScoredAgent::new("stronger", 0.9, 0.8, &[IssueType::DeadCode]))
            .with_agent(ScoredAgent::new("late", 0.9, 0.8, &[IssueType::DeadCode]));
        let route = registry.route(&issue(IssueType::DeadCode, "unused")).unwrap();
        assert_eq!(route.agent_name(), "stronger");
        assert_eq!(route.order, 1);
    }

    #[test]
    fn test_open_breaker_skips_agent() {
        let registry = AgentRegistry::new()
            .with_breaker(1, Duration::from_secs(60))
            .with_agent(ScoredAgent::new("flaky", 0.9, 0.95, &[IssueType::TypeError]))
            .with_agent(ScoredAgent::new("steady", 0.8, 0.8, &[IssueType::TypeError]));

        registry.record_failure("flaky");
        let route = registry.route(&issue(IssueType::TypeError, "bad")).unwrap();
        assert_eq!(route.agent_name(), "steady");

        registry.record_failure("steady");
        assert!(!registry.any_available());
        assert!(registry.route(&issue(IssueType::TypeError, "bad")).is_none());
    }

    #[test]
    fn test_exclusion_for_hand_off() {
        let registry = AgentRegistry::new()
            .with_agent(ScoredAgent::new("a", 0.9, 0.9, &[IssueType::Complexity]))
            .with_agent(ScoredAgent::new("b", 0.8, 0.75, &[IssueType::Complexity]));
        let route = registry
            .route_excluding(&issue(IssueType::Complexity, "deep"), Some("a"))
            .unwrap();
        assert_eq!(route.agent_name(), "b");
    }
}
