// Copyright 2025 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![doc = include_str!("../README.md")]

/// Executable shims for installed packages
pub mod bins;
/// Content-addressed archive cache
pub mod cache;
/// CLI command implementations
pub mod command;
/// Configuration discovery
pub mod config;
/// Shared component wiring
pub mod context;
/// Error taxonomy
pub mod errors;
/// Subresource integrity parsing and validation
pub mod integrity;
/// Lockfile model and writer
pub mod lock;
/// Project manifest format and IO
pub mod manifest;
/// Package names, store and extraction
pub mod package;
/// Manifest/lock reconciliation
pub mod reconcile;
/// Registry metadata model and access
pub mod registry;
/// Parallel dependency resolution
pub mod resolver;
/// Lifecycle script execution
pub mod scripts;
/// Version selection against registry metadata
pub mod solver;
/// Workspace member registry
pub mod workspace;
/// Yarn v1 lock import
pub mod yarn;
/// Materialization of resolved trees
pub mod installer;

mod fsutil;
mod sync;
