// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Loading, validating and running graph files.

use anyhow::{Context, Result};
use nodeflow_api::Network;
use nodeflow_engine::{Engine, NetworkSnapshot};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::config::EngineConfig;

/// What `validate` reports about a graph file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GraphSummary {
    pub name: Option<String>,
    pub nodes: usize,
    pub links: usize,
    /// Links whose endpoints lie on one feedback cycle.
    pub cycle_links: usize,
}

impl GraphSummary {
    fn of(network: &Network) -> Self {
        Self {
            name: network.name.clone(),
            nodes: network.node_count(),
            links: network.link_count(),
            cycle_links: network.cyclic_links().count(),
        }
    }
}

/// Reads and compiles a YAML graph against the engine's registry.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the graph is invalid.
pub fn compile_file(engine: &Engine, path: &Path) -> Result<Network> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read graph file {}", path.display()))?;
    engine.compile_yaml(&yaml).with_context(|| format!("Invalid graph {}", path.display()))
}

/// # Errors
///
/// Returns an error if the file cannot be read or the graph is invalid.
pub fn validate(engine: &Engine, path: &Path) -> Result<GraphSummary> {
    let network = compile_file(engine, path)?;
    Ok(GraphSummary::of(&network))
}

/// Runs a graph until `duration` elapses or Ctrl-C is pressed, then releases it.
///
/// Nodes that fail setup stay in the graph as unavailable and are reported; the
/// rest of the graph keeps running. Returns the last snapshot taken before release.
///
/// # Errors
///
/// Returns an error if the graph is invalid or the network stops unexpectedly.
pub async fn run(
    engine: &Engine,
    engine_config: &EngineConfig,
    path: &Path,
    duration: Option<Duration>,
) -> Result<NetworkSnapshot> {
    let network = compile_file(engine, path)?;
    let summary = GraphSummary::of(&network);
    tracing::info!(
        graph = %path.display(),
        nodes = summary.nodes,
        links = summary.links,
        cycle_links = summary.cycle_links,
        "Starting graph"
    );

    let handle = engine.start_network(engine_config.network_config(network.name.clone()));

    let mut updates = handle.subscribe_state().await?;
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            tracing::debug!(node_id = %update.node_id, state = ?update.state, "Node state changed");
        }
    });

    if let Err(e) = handle.load(network).await {
        tracing::warn!(error = %e, "Graph loaded with errors");
    }
    if let Err(e) = handle.resume().await {
        tracing::warn!(error = %e, "Some nodes failed to resume");
    }

    match duration {
        Some(duration) => {
            tokio::select! {
                () = tokio::time::sleep(duration) => {
                    tracing::info!(seconds = duration.as_secs_f64(), "Run duration elapsed");
                },
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl-C")?;
                    tracing::info!("Interrupted");
                },
            }
        },
        None => {
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted");
        },
    }

    let snapshot = handle.snapshot().await?;
    handle.release().await.context("Failed to release the network")?;
    Ok(snapshot)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const PIPELINE: &str = r"
name: demo
nodes:
  ticker:
    kind: core::ticker
    properties: { interval_ms: 5, limit: 10 }
  relay: { kind: core::relay }
  sink: { kind: core::sink }
links:
  - { from: ticker.out, to: relay.in }
  - { from: relay.out, to: sink.in }
";

    fn graph_file(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_validate_summarizes_graph() {
        let file = graph_file(PIPELINE);
        let summary = validate(&Engine::new(), file.path()).unwrap();
        assert_eq!(
            summary,
            GraphSummary { name: Some("demo".to_string()), nodes: 3, links: 2, cycle_links: 0 }
        );
    }

    #[test]
    fn test_validate_reports_bad_links() {
        let file = graph_file(
            r"
nodes:
  sink: { kind: core::sink }
  ticker: { kind: core::ticker }
links:
  - { from: sink.in, to: ticker.out }
",
        );
        assert!(validate(&Engine::new(), file.path()).is_err());
    }

    #[tokio::test]
    async fn test_run_for_a_duration() {
        let file = graph_file(PIPELINE);
        let snapshot = run(
            &Engine::new(),
            &EngineConfig::default(),
            file.path(),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap();

        assert_eq!(snapshot.name.as_deref(), Some("demo"));
        assert!(snapshot.is_resumed);
        assert_eq!(snapshot.nodes.len(), 3);
        assert_eq!(snapshot.links.len(), 2);
    }
}
