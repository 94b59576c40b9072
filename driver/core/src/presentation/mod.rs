// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`scale-csi-core`)
//!
//! CSI gRPC surface that translates sidecar and kubelet requests into
//! application service calls. Handlers decode, delegate and encode; the
//! lifecycle rules live in `crate::application`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`grpc`] | gRPC (Tonic) over a Unix socket | CSI v1 Identity, Controller and Node services |

pub mod grpc;
