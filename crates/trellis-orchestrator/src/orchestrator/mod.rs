// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator module - container orchestrator clients.

pub mod kubectl;
pub mod mock;
mod traits;

pub use kubectl::KubectlOrchestrator;
pub use mock::MockOrchestrator;
pub use traits::*;
