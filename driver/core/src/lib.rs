// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Scale CSI core
//!
//! Volume lifecycle engine for a CSI driver backed by a clustered POSIX
//! filesystem. Kubernetes volumes map onto filesets (quota-bound
//! subdirectories) managed through the filesystem's REST management API.
//!
//! # Architecture
//!
//! - **domain:** handles, storage class plans, filesets, snapshots, the backend contract
//! - **application:** fileset and snapshot lifecycle services, operator rendering
//! - **infrastructure:** REST client, in-memory backend, event bus, Kubernetes apply
//! - **presentation:** CSI Identity / Controller / Node gRPC services

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
