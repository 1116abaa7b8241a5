// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

use super::{registry, test_config, Recorder, RECORDING};
use crate::node_handle::NodeHandle;
use nodeflow_core::{Hook, NodeFlowError, NodeLifecycle, SharedContext};
use std::time::Duration;

fn spawn_node(recorder: &Recorder, id: &str, params: serde_json::Value) -> NodeHandle {
    let shared = SharedContext::default();
    let body = registry(recorder).create(RECORDING, &shared, Some(&params)).unwrap();
    let counter = opentelemetry::global::meter("test").u64_counter("teardown").build();
    NodeHandle::spawn(id, RECORDING, body, shared, test_config().node_settings(), counter)
}

#[tokio::test]
async fn test_resume_and_pause_are_idempotent() {
    let recorder = Recorder::default();
    let node = spawn_node(&recorder, "n", serde_json::json!({}));

    node.setup().await.unwrap();
    node.setup().await.unwrap();
    node.resume().await.unwrap();
    node.resume().await.unwrap();
    assert_eq!(node.status().await.unwrap().lifecycle, NodeLifecycle::Resumed);

    node.pause().await.unwrap();
    node.pause().await.unwrap();
    assert_eq!(node.status().await.unwrap().lifecycle, NodeLifecycle::Paused);

    assert_eq!(recorder.count("n:setup"), 1);
    assert_eq!(recorder.count("n:resume"), 1);
    assert_eq!(recorder.count("n:pause"), 1);

    node.release().await;
}

#[tokio::test]
async fn test_operations_require_setup() {
    let recorder = Recorder::default();
    let node = spawn_node(&recorder, "n", serde_json::json!({}));

    let Err(err) = node.resume().await else {
        panic!("resume before setup must fail");
    };
    assert!(err.is_topology(), "unexpected error: {err}");

    let Err(err) = node.get_consumer("out").await else {
        panic!("linking before setup must fail");
    };
    assert!(err.is_topology(), "unexpected error: {err}");
    assert!(recorder.entries().is_empty());

    node.release().await;
}

#[tokio::test]
async fn test_failed_resume_keeps_state() {
    let recorder = Recorder::default();
    let node = spawn_node(&recorder, "n", serde_json::json!({ "fail_resume": true }));
    node.setup().await.unwrap();

    let Err(NodeFlowError::Hook { hook, node_id, .. }) = node.resume().await else {
        panic!("expected a hook failure");
    };
    assert_eq!(hook, Hook::Resume);
    assert_eq!(node_id, "n");
    assert_eq!(node.status().await.unwrap().lifecycle, NodeLifecycle::Paused);

    node.release().await;
}

#[tokio::test]
async fn test_failed_connect_rolls_back_consumer() {
    let recorder = Recorder::default();
    let node = spawn_node(&recorder, "n", serde_json::json!({ "fail_connect": true }));
    node.setup().await.unwrap();

    let Err(NodeFlowError::Hook { hook: Hook::Connect, .. }) = node.get_consumer("out").await
    else {
        panic!("expected on_connect to fail");
    };
    assert!(node.status().await.unwrap().linked_ports.is_empty());

    node.release().await;
}

#[tokio::test]
async fn test_unmarking_keeps_attached_ports_linked() {
    let recorder = Recorder::default();
    let node = spawn_node(&recorder, "n", serde_json::json!({}));
    node.setup().await.unwrap();

    node.mark_port("in", Some(true), None).await.unwrap();
    assert_eq!(node.status().await.unwrap().linked_ports, vec!["in".to_string()]);
    node.mark_port("in", Some(false), None).await.unwrap();
    assert!(node.status().await.unwrap().linked_ports.is_empty());

    let _channel = node.get_consumer("out").await.unwrap();
    node.mark_port("out", Some(false), None).await.unwrap();
    assert_eq!(node.status().await.unwrap().linked_ports, vec!["out".to_string()]);

    node.release().await;
}

#[tokio::test]
async fn test_teardown_pause_is_bounded() {
    let recorder = Recorder::default();
    let node = spawn_node(&recorder, "n", serde_json::json!({ "hang_pause": true }));
    node.setup().await.unwrap();
    node.resume().await.unwrap();

    let Err(NodeFlowError::Timeout(_)) = node.pause_for_teardown().await else {
        panic!("expected the pause to time out");
    };
    tokio::time::timeout(Duration::from_secs(5), node.release()).await.unwrap();
    assert!(node.is_released());
    assert!(matches!(node.status().await, Err(NodeFlowError::Released(_))));
}

#[tokio::test]
async fn test_operations_after_release_report_released() {
    let recorder = Recorder::default();
    let node = spawn_node(&recorder, "n", serde_json::json!({}));
    node.setup().await.unwrap();
    node.resume().await.unwrap();

    node.release().await;
    node.release().await;
    assert!(node.is_released());
    assert_eq!(recorder.count("n:release"), 1);

    assert!(matches!(node.resume().await, Err(NodeFlowError::Released(_))));
    assert!(matches!(node.pause().await, Err(NodeFlowError::Released(_))));
    assert!(matches!(node.status().await, Err(NodeFlowError::Released(_))));
    assert!(matches!(node.get_consumer("out").await, Err(NodeFlowError::Released(_))));
}

#[tokio::test]
async fn test_hanging_release_is_bounded() {
    let recorder = Recorder::default();
    let node = spawn_node(&recorder, "n", serde_json::json!({ "hang_release": true }));
    node.setup().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), node.release())
        .await
        .expect("release must finish even when on_release hangs");
    assert!(node.is_released());
    assert_eq!(recorder.count("n:release"), 1);
}
