// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod kubernetes;
pub mod mount;
pub mod repositories;
pub mod retry;
pub mod scale;
