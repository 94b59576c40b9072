// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Build Script for scale-csi-core
//!
//! Compiles the CSI v1 Protocol Buffer definitions served by the driver.
//!
//! # Code Generation
//!
//! Uses `tonic-prost-build` to generate Rust code from `proto/csi.proto`.
//! Generated code is placed in `OUT_DIR` and included via `tonic::include_proto!`
//! in `src/presentation/grpc/mod.rs`.
//!
//! # Dependencies
//!
//! - **protoc**: Protocol buffer compiler (vendored via `protoc-bin-vendored`)
//! - **tonic-prost-build**: Code generator for Rust gRPC stubs

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set PROTOC environment variable to point to the vendored protoc binary
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    let well_known = protoc_bin_vendored::include_path()?;

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[std::path::PathBuf::from("proto/csi.proto")],
            &[std::path::PathBuf::from("proto"), well_known],
        )?;

    println!("cargo:rerun-if-changed=proto/csi.proto");

    Ok(())
}
