//! Dispatch planning
//!
//! Turns an iteration's issue list into per-agent batches. Every issue is
//! routed on its own; in batch mode issues that share an agent, source tool
//! and issue type travel together so one agent pass covers the cluster.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use vigil_core::{Issue, IssueType};

use crate::agent::FixAgent;
use crate::registry::AgentRegistry;

/// Issues one agent receives in one call
#[derive(Clone)]
pub struct AgentBatch {
    pub agent: Arc<dyn FixAgent>,
    pub source_tool: String,
    pub issue_type: IssueType,
    pub issues: Vec<Issue>,
    /// Lowest routing confidence among the batch's issues
    pub confidence: f64,
}

impl AgentBatch {
    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }
}

impl std::fmt::Debug for AgentBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBatch")
            .field("agent", &self.agent.name())
            .field("source_tool", &self.source_tool)
            .field("issue_type", &self.issue_type)
            .field("issues", &self.issues.len())
            .field("confidence", &self.confidence)
            .finish()
    }
}

/// An issue no agent accepted this iteration
#[derive(Debug, Clone)]
pub struct Unassigned {
    pub issue: Issue,
    /// Best agent below the threshold, if any agent scored above zero
    pub best_agent: Option<String>,
    pub best_confidence: f64,
}

/// Result of routing one iteration's issues
#[derive(Debug, Clone, Default)]
pub struct DispatchPlan {
    pub batches: Vec<AgentBatch>,
    pub unassigned: Vec<Unassigned>,
}

impl DispatchPlan {
    pub fn assigned_count(&self) -> usize {
        self.batches.iter().map(|b| b.issues.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Batches grouped by agent, in registration order
    pub fn by_agent(&self) -> Vec<(Arc<dyn FixAgent>, Vec<AgentBatch>)> {
        let mut grouped: Vec<(Arc<dyn FixAgent>, Vec<AgentBatch>)> = Vec::new();
        for batch in &self.batches {
            match grouped
                .iter_mut()
                .find(|(agent, _)| agent.name() == batch.agent_name())
            {
                Some((_, batches)) => batches.push(batch.clone()),
                None => grouped.push((Arc::clone(&batch.agent), vec![batch.clone()])),
            }
        }
        grouped
    }
}

/// Route `issues` and group the assignments into batches.
///
/// With `batch_mode` off every assigned issue becomes its own batch.
pub fn plan(registry: &AgentRegistry, issues: &[Issue], batch_mode: bool) -> DispatchPlan {
    plan_excluding(registry, issues, batch_mode, |_| None)
}

/// Like [`plan`], skipping for each issue the agent named by `exclude`
pub fn plan_excluding<F>(
    registry: &AgentRegistry,
    issues: &[Issue],
    batch_mode: bool,
    exclude: F,
) -> DispatchPlan
where
    F: Fn(&Issue) -> Option<String>,
{
    let mut plan = DispatchPlan::default();
    // (registration order, source tool, type) -> batch index
    let mut index: HashMap<(usize, String, IssueType), usize> = HashMap::new();
    let mut ordered: Vec<(usize, AgentBatch)> = Vec::new();

    for issue in issues {
        let excluded = exclude(issue);
        let Some(route) = registry.route_excluding(issue, excluded.as_deref()) else {
            let candidate = registry.best_candidate(issue, excluded.as_deref());
            debug!(
                "Unassigned: {} at {} (best {:?})",
                issue.message,
                issue.location(),
                candidate
            );
            plan.unassigned.push(Unassigned {
                issue: issue.clone(),
                best_agent: candidate
                    .as_ref()
                    .filter(|c| c.confidence > 0.0)
                    .map(|c| c.agent_name().to_string()),
                best_confidence: candidate.map(|c| c.confidence).unwrap_or(0.0),
            });
            continue;
        };

        let key = (route.order, issue.source_tool.clone(), issue.issue_type);
        match index.get(&key).copied().filter(|_| batch_mode) {
            Some(slot) => {
                let batch = &mut ordered[slot].1;
                batch.issues.push(issue.clone());
                batch.confidence = batch.confidence.min(route.confidence);
            }
            None => {
                index.insert(key, ordered.len());
                ordered.push((
                    route.order,
                    AgentBatch {
                        agent: route.agent,
                        source_tool: issue.source_tool.clone(),
                        issue_type: issue.issue_type,
                        issues: vec![issue.clone()],
                        confidence: route.confidence,
                    },
                ));
            }
        }
    }

    // Stable: keeps first-seen order within an agent
    ordered.sort_by_key(|(order, _)| *order);
    plan.batches = ordered.into_iter().map(|(_, batch)| batch).collect();

    debug!(
        "Planned {} batches ({} issues), {} unassigned",
        plan.batches.len(),
        plan.assigned_count(),
        plan.unassigned.len()
    );
    plan
}
