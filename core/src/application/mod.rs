// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod approvals;
pub mod audit;
pub mod autoscaler;
pub mod board;
pub mod budget;
pub mod channels;
pub mod locks;
pub mod queue;
pub mod registry;
pub mod session;
pub mod spawner;
