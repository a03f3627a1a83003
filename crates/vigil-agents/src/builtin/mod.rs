//! Agents shipped with Vigil

mod command;
mod whitespace;

pub use command::CommandAgent;
pub use whitespace::{normalize, WhitespaceAgent};

use std::sync::Arc;
use std::time::Duration;
use vigil_core::VigilConfig;

use crate::registry::AgentRegistry;

/// Registry populated from configuration
pub fn registry_from_config(config: &VigilConfig) -> AgentRegistry {
    let mut registry = AgentRegistry::new()
        .with_threshold(config.autofix.confidence_threshold)
        .with_breaker(
            config.autofix.breaker_threshold,
            Duration::from_secs(config.autofix.breaker_cooldown_secs),
        );

    if config.agents.whitespace {
        registry.register(Arc::new(WhitespaceAgent::new()));
    }
    for agent in &config.agents.command {
        registry.register(Arc::new(CommandAgent::from_config(agent)));
    }
    registry
}
