// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Pure types and contracts. Nothing in here performs I/O except through the
//! [`backend::ScaleBackend`] trait.

pub mod error;
pub mod quota;
pub mod permissions;
pub mod volume_handle;
pub mod storage_class;
pub mod fileset;
pub mod snapshot;
pub mod backend;
pub mod repository;
pub mod events;
pub mod config;
pub mod operator;
