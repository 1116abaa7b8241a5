// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Command-line runner for NodeFlow graphs.

pub mod cli;
pub mod config;
pub mod logging;
pub mod runner;
pub mod telemetry;
