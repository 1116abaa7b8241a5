// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! engine: the NodeFlow dataflow execution engine.
//! This crate runs node graphs as actors: one executor per node, orchestrated by
//! one network executor per graph instance.

use nodeflow_api::{Network, NetworkError, Port};
use nodeflow_core::registry::NodeRegistry;
use nodeflow_core::{mailbox, NodeDefinition, PortSpec};
use opentelemetry::global;
use std::sync::{Arc, RwLock};

// --- Public Modules ---

pub mod constants;

mod messages;
mod network_actor;
mod network_config;
mod network_handle;
mod node_executor;
mod node_handle;

// Re-exports
pub use messages::{NetworkSnapshot, NodeSnapshot, NodeStatus};
pub use network_config::NetworkExecutorConfig;
pub use network_handle::NetworkHandle;
pub use node_handle::NodeHandle;

use network_actor::NetworkExecutor;

// --- Engine Structs ---

/// The main Engine struct, the entry point for running graphs.
/// It owns the node registry and starts network executors from it.
pub struct Engine {
    pub registry: Arc<RwLock<NodeRegistry>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates a new engine with the built-in utility nodes registered.
    pub fn new() -> Self {
        let mut registry = NodeRegistry::new();
        nodeflow_nodes::register_nodes(&mut registry);
        Self::with_registry(registry)
    }

    /// Creates an engine around an existing registry.
    pub fn with_registry(registry: NodeRegistry) -> Self {
        Self { registry: Arc::new(RwLock::new(registry)) }
    }

    /// Parses a YAML graph and validates its links against the registered port
    /// declarations.
    ///
    /// # Errors
    ///
    /// Returns a [`NetworkError`] for malformed YAML, unknown kinds or invalid links.
    pub fn compile_yaml(&self, yaml: &str) -> Result<Network, NetworkError> {
        let registry = self.registry_snapshot();
        nodeflow_api::yaml::load(yaml, |kind, params| {
            let specs = registry.ports_of(kind, params).map_err(|e| e.to_string())?;
            Ok(specs.iter().map(PortSpec::descriptor).collect::<Vec<Port>>())
        })
    }

    /// Definitions of every registered node kind, sorted by kind.
    pub fn node_definitions(&self) -> Vec<NodeDefinition> {
        self.registry_snapshot().definitions()
    }

    fn registry_snapshot(&self) -> NodeRegistry {
        match self.registry.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Starts a network executor in the background and returns its handle.
    ///
    /// The executor uses a snapshot of the registry taken now; kinds registered
    /// later are not visible to it.
    pub fn start_network(&self, config: NetworkExecutorConfig) -> NetworkHandle {
        let settings = config.node_settings();
        let registry = self.registry_snapshot();
        let shared = config.shared.clone().unwrap_or_default();
        let name = config.name.clone().unwrap_or_else(|| "network".to_string());

        tracing::info!(
            network = %name,
            delivery_capacity = settings.delivery_capacity,
            mailbox_capacity = settings.mailbox_capacity,
            release_timeout_ms = settings.release_timeout.as_millis(),
            hook_grace_timeout_ms = settings.hook_grace_timeout.as_millis(),
            "Starting network executor"
        );

        let meter = global::meter("nodeflow_engine");
        let executor = NetworkExecutor::new(
            config.name,
            registry,
            shared,
            settings,
            meter.u64_gauge("engine.nodes.active").with_description("Number of live nodes").build(),
            meter
                .u64_counter("engine.operations")
                .with_description("Topology and lifecycle operations")
                .build(),
            meter
                .u64_counter("engine.hook.failures")
                .with_description("Node hook failures by hook")
                .build(),
            meter
                .u64_counter("engine.teardown.timeouts")
                .with_description("Node releases that hit the release timeout")
                .build(),
        );

        let (actor, rx) = mailbox(
            format!("network '{name}'"),
            NetworkExecutorConfig::network_mailbox_capacity(),
        );
        let network_task = tokio::spawn(executor.run(rx));
        NetworkHandle::new(actor, network_task)
    }
}

#[cfg(test)]
mod tests;
