// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the scale-csi binary

pub mod config;
pub mod operator;
pub mod serve;

pub use self::config::ConfigCommand;
pub use self::serve::{Role, ServeArgs};
