// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node factory registry and discovery.
//!
//! - [`NodeRegistry`]: Table of node kinds the engine can construct
//! - [`NodeDefinition`]: Serializable node metadata (ports, property schema)
//!
//! The registry is an ordinary value injected into the engine; there is no
//! process-wide table.

use crate::error::{NodeFlowError, Result};
use crate::node::{NodeBody, NodeFactory, SharedContext};
use crate::ports::{PortDescriptor, PortSpec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A serializable representation of a node kind.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeDefinition {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub param_schema: serde_json::Value,
    pub ports: Vec<PortDescriptor>,
    /// Hierarchical categories (e.g., `["core", "sources"]`)
    pub categories: Vec<String>,
}

#[derive(Clone)]
struct NodeInfo {
    factory: NodeFactory,
    param_schema: serde_json::Value,
    static_ports: Option<Vec<PortSpec>>,
    categories: Vec<String>,
    description: Option<String>,
}

/// Holds every node kind an engine can construct.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    info: HashMap<String, NodeInfo>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry").field("kinds", &self.kinds()).finish()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kind whose ports depend on its properties.
    ///
    /// The factory must be able to build a default instance when `params` is `None`;
    /// that instance answers [`NodeRegistry::ports_of`].
    pub fn register<F>(
        &mut self,
        kind: &str,
        factory: F,
        param_schema: serde_json::Value,
        categories: Vec<String>,
    ) where
        F: Fn(&SharedContext, Option<&serde_json::Value>) -> Result<Box<dyn NodeBody>>
            + Send
            + Sync
            + 'static,
    {
        self.insert(kind, Arc::new(factory), param_schema, None, categories, None);
    }

    /// Registers a kind with fixed ports and a description.
    pub fn register_static<F>(
        &mut self,
        kind: &str,
        factory: F,
        param_schema: serde_json::Value,
        ports: Vec<PortSpec>,
        categories: Vec<String>,
        description: impl Into<String>,
    ) where
        F: Fn(&SharedContext, Option<&serde_json::Value>) -> Result<Box<dyn NodeBody>>
            + Send
            + Sync
            + 'static,
    {
        self.insert(
            kind,
            Arc::new(factory),
            param_schema,
            Some(ports),
            categories,
            Some(description.into()),
        );
    }

    fn insert(
        &mut self,
        kind: &str,
        factory: NodeFactory,
        param_schema: serde_json::Value,
        static_ports: Option<Vec<PortSpec>>,
        categories: Vec<String>,
        description: Option<String>,
    ) {
        if self
            .info
            .insert(
                kind.to_string(),
                NodeInfo { factory, param_schema, static_ports, categories, description },
            )
            .is_some()
        {
            tracing::warn!(kind, "Node kind registered twice; keeping the latest factory");
        }
    }

    /// Builds a node body of `kind`.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Configuration` for an unknown kind, or whatever the
    /// factory returns for invalid properties.
    pub fn create(
        &self,
        kind: &str,
        shared: &SharedContext,
        params: Option<&serde_json::Value>,
    ) -> Result<Box<dyn NodeBody>> {
        self.info.get(kind).map_or_else(
            || Err(NodeFlowError::Configuration(format!("Node kind '{kind}' not found in registry"))),
            |info| (info.factory)(shared, params),
        )
    }

    /// Port declarations of `kind` built with `params`.
    ///
    /// # Errors
    ///
    /// As [`NodeRegistry::create`] for kinds without static ports.
    pub fn ports_of(&self, kind: &str, params: Option<&serde_json::Value>) -> Result<Vec<PortSpec>> {
        let info = self.info.get(kind).ok_or_else(|| {
            NodeFlowError::Configuration(format!("Node kind '{kind}' not found in registry"))
        })?;
        if let Some(ports) = &info.static_ports {
            return Ok(ports.clone());
        }
        Ok((info.factory)(&SharedContext::default(), params)?.ports())
    }

    /// Definitions of every registered kind, sorted by kind.
    pub fn definitions(&self) -> Vec<NodeDefinition> {
        let mut defs = Vec::new();
        for (kind, info) in &self.info {
            let ports = match self.ports_of(kind, None) {
                Ok(ports) => ports,
                Err(e) => {
                    tracing::error!(kind = %kind, error = %e, "Failed to read ports for node definition");
                    continue;
                },
            };
            defs.push(NodeDefinition {
                kind: kind.clone(),
                description: info.description.clone(),
                param_schema: info.param_schema.clone(),
                ports: ports.iter().map(PortSpec::descriptor).collect(),
                categories: info.categories.clone(),
            });
        }
        defs.sort_by(|a, b| a.kind.cmp(&b.kind));
        defs
    }

    /// Returns true if `kind` was registered.
    pub fn unregister(&mut self, kind: &str) -> bool {
        self.info.remove(kind).is_some()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.info.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.info.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ports::{Key, PortCardinality, PortDirection};

    const OUT: Key<u8> = Key::new("out");
    const IN: Key<u8> = Key::new("in");

    struct Fanout {
        outputs: usize,
    }

    #[async_trait::async_trait]
    impl NodeBody for Fanout {
        fn ports(&self) -> Vec<PortSpec> {
            let mut ports = vec![PortSpec::input(IN, "byte")];
            ports.extend(
                (0..self.outputs).map(|_| PortSpec::output(OUT, "byte", PortCardinality::One)),
            );
            ports
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register(
            "test::fanout",
            |_, params| {
                let outputs = params.and_then(|p| p.get("outputs")).and_then(|v| v.as_u64());
                Ok(Box::new(Fanout { outputs: usize::try_from(outputs.unwrap_or(1)).unwrap() }))
            },
            serde_json::json!({}),
            vec!["test".into()],
        );
        registry.register_static(
            "test::sink",
            |_, _| Ok(Box::new(Fanout { outputs: 0 })),
            serde_json::json!({}),
            vec![PortSpec::input(IN, "byte")],
            vec!["test".into()],
            "Swallows bytes",
        );
        registry
    }

    #[test]
    fn test_create_and_ports() {
        let registry = registry();
        assert_eq!(registry.kinds(), vec!["test::fanout", "test::sink"]);

        let params = serde_json::json!({ "outputs": 2 });
        let ports = registry.ports_of("test::fanout", Some(&params)).unwrap();
        assert_eq!(ports.iter().filter(|p| p.direction == PortDirection::Output).count(), 2);

        let body = registry.create("test::sink", &SharedContext::default(), None).unwrap();
        assert_eq!(body.ports().len(), 1);

        assert!(matches!(
            registry.create("nope", &SharedContext::default(), None),
            Err(NodeFlowError::Configuration(_))
        ));
    }

    #[test]
    fn test_definitions_and_unregister() {
        let mut registry = registry();
        let defs = registry.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[1].description.as_deref(), Some("Swallows bytes"));

        assert!(registry.unregister("test::sink"));
        assert!(!registry.contains("test::sink"));
        assert!(!registry.unregister("test::sink"));
    }
}
