// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end tests running the built-in nodes through the engine.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use nodeflow_api::NetworkError;
use nodeflow_engine::{Engine, NetworkExecutorConfig};
use nodeflow_nodes::core::sink::{SinkNode, SinkProbe};
use std::time::Duration;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// An engine with the built-in nodes plus `test::probe`, a sink reporting into `probe`.
fn engine_with_probe(probe: &SinkProbe) -> Engine {
    let engine = Engine::new();
    let probe = probe.clone();
    engine.registry.write().unwrap().register_static(
        "test::probe",
        move |_shared, params| Ok(Box::new(SinkNode::with_probe(params, probe.clone())?)),
        serde_json::json!({}),
        SinkNode::ports(),
        vec!["test".to_string()],
        "Sink that reports into a probe",
    );
    engine
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_ticker_relay_sink_pipeline() {
    init_tracing();
    let probe = SinkProbe::default();
    let engine = engine_with_probe(&probe);

    let network = engine
        .compile_yaml(
            r"
name: pipeline
nodes:
  source:
    kind: core::ticker
    properties: { interval_ms: 1, pool_size: 2, limit: 20 }
  relay:
    kind: core::relay
  out:
    kind: test::probe
links:
  - { from: source.out, to: relay.in }
  - { from: relay.out, to: out.in }
",
        )
        .unwrap();

    let handle = engine.start_network(NetworkExecutorConfig::default());
    handle.load(network).await.unwrap();
    handle.resume().await.unwrap();

    wait_until(|| probe.saw_end_of_stream()).await;
    assert_eq!(probe.received(), 20);
    assert_eq!(probe.last_sequence(), 19);
    assert_eq!(probe.out_of_order(), 0);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.name.as_deref(), Some("pipeline"));
    assert!(snapshot.is_resumed);
    assert_eq!(snapshot.nodes.len(), 3);

    handle.release().await.unwrap();
}

#[tokio::test]
async fn test_slow_consumer_applies_backpressure() {
    init_tracing();
    let probe = SinkProbe::default();
    let engine = engine_with_probe(&probe);

    let network = engine
        .compile_yaml(
            r"
nodes:
  source:
    kind: core::ticker
    properties: { interval_ms: 1, pool_size: 2 }
  out:
    kind: test::probe
    properties: { hold_ms: 20 }
links:
  - { from: source.out, to: out.in }
",
        )
        .unwrap();

    let config = NetworkExecutorConfig { delivery_capacity: Some(1), ..Default::default() };
    let handle = engine.start_network(config);
    handle.load(network).await.unwrap();
    handle.resume().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let received = probe.received();
    assert!(received > 0);
    // The ticker fires every millisecond but can only run as fast as the sink
    // hands events back.
    assert!(received < 50, "received {received} events despite a 20ms consumer");
    assert_eq!(probe.out_of_order(), 0);

    timeout(Duration::from_secs(5), handle.release())
        .await
        .expect("release must not deadlock on a full pipeline")
        .unwrap();
}

#[tokio::test]
async fn test_feedback_cycle_is_flagged() {
    init_tracing();
    let engine = Engine::new();
    let network = engine
        .compile_yaml(
            r"
nodes:
  a: { kind: core::relay }
  b: { kind: core::relay }
links:
  - { from: a.out, to: b.in }
  - { from: b.out, to: a.in }
",
        )
        .unwrap();

    let handle = engine.start_network(NetworkExecutorConfig::default());
    handle.load(network).await.unwrap();
    handle.resume().await.unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.links.len(), 2);
    assert!(snapshot.links.iter().all(|link| link.in_cycle));

    handle.release().await.unwrap();
}

#[test]
fn test_compile_rejects_unknown_kinds() {
    let engine = Engine::new();
    let result = engine.compile_yaml(
        r"
nodes:
  a: { kind: core::nope }
",
    );
    assert!(matches!(result, Err(NetworkError::UnknownKind { .. })));
}
