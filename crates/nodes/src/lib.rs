// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

use nodeflow_core::NodeRegistry;

pub mod core;

// Shared utilities
pub mod streaming_utils;

/// A single function to register all built-in nodes.
pub fn register_nodes(registry: &mut NodeRegistry) {
    core::register_core_nodes(registry);

    tracing::info!("Finished registering built-in nodes.");
}
