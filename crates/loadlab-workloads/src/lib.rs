// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! Built-in demo workload steps.
//!
//! These exist so the CLI and server produce data out of the box; the
//! engine itself never depends on them. Real deployments register their own
//! steps against the target service instead.

use loadlab_core::{LocalWorker, Step};
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Registers every built-in step on `worker`.
pub fn register_defaults(worker: &LocalWorker) {
    worker.add_step(push());
    worker.add_step(login());
    worker.add_step(dummy());
}

/// Simulated application push: roughly 100 ms of work with jitter.
pub fn push() -> Step {
    Step::new(
        "push",
        || async {
            let jitter = rand::thread_rng().gen_range(0..50);
            sleep(Duration::from_millis(75 + jitter)).await;
            Ok(())
        },
        "simulated application push against the target service",
    )
}

/// Simulated login that leaves a session token in the iteration context
/// under the key `token`.
pub fn login() -> Step {
    Step::with_context(
        "login",
        |ctx| async move {
            sleep(Duration::from_millis(20)).await;
            let token = i64::from(rand::thread_rng().gen::<u32>());
            ctx.put_int("token", token);
            Ok(())
        },
        "acquires a session token and stores it in the iteration context",
    )
}

/// Does nothing for 10-50 ms.
pub fn dummy() -> Step {
    Step::new(
        "dummy",
        || async {
            let pause = rand::thread_rng().gen_range(10..=50);
            sleep(Duration::from_millis(pause)).await;
            Ok(())
        },
        "sleeps for a short random interval",
    )
}
