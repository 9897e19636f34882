// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod docker;
pub mod local;

pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use local::LocalProcessRuntime;
