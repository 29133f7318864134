// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use rand::prelude::*;
use std::time::Duration;

pub fn jitter(value: Duration) -> Duration {
    let random: u64 = thread_rng().gen_range(0..10);
    Duration::from_secs(random) + value
}

/// Sleeps for `value` plus a few seconds of jitter, to keep retry loops
/// (reconnects, polling) from lining up across restarts.
pub async fn delay_with_jitter(value: Duration) {
    tokio::time::sleep(jitter(value)).await
}
