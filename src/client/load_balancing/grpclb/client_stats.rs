/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex,
    },
};

use crate::byte_str::ByteStr;

use super::load_balancer_api::ClientStatsReport;

/// Per-call counters reported to the balancer.
///
/// Writers are the pick path (calls started, drops) and the per-call
/// completion trackers (calls finished); the single reader is the balancer
/// call, which drains a snapshot into each load report.  All counters are
/// atomics; the drop-token map takes a mutex on the (rare) drop path and on
/// drain.
#[derive(Debug, Default)]
pub struct ClientStats {
    num_calls_started: AtomicI64,
    num_calls_finished: AtomicI64,
    num_calls_finished_with_client_failed_to_send: AtomicI64,
    num_calls_finished_known_received: AtomicI64,
    drop_token_counts: Mutex<HashMap<ByteStr, i64>>,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_call_started(&self) {
        self.num_calls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_call_finished(&self, client_failed_to_send: bool, known_received: bool) {
        self.num_calls_finished.fetch_add(1, Ordering::Relaxed);
        if client_failed_to_send {
            self.num_calls_finished_with_client_failed_to_send
                .fetch_add(1, Ordering::Relaxed);
        }
        if known_received {
            self.num_calls_finished_known_received
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_call_dropped(&self, token: &ByteStr) {
        *self
            .drop_token_counts
            .lock()
            .unwrap()
            .entry(token.clone())
            .or_insert(0) += 1;
    }

    /// Returns the counts accumulated since the previous snapshot and resets
    /// them.
    pub fn snapshot(&self) -> ClientStatsReport {
        let mut calls_finished_with_drop: Vec<(ByteStr, i64)> = self
            .drop_token_counts
            .lock()
            .unwrap()
            .drain()
            .collect();
        // Deterministic order for encoding and tests.
        calls_finished_with_drop.sort();
        ClientStatsReport {
            num_calls_started: self.num_calls_started.swap(0, Ordering::Relaxed),
            num_calls_finished: self.num_calls_finished.swap(0, Ordering::Relaxed),
            num_calls_finished_with_client_failed_to_send: self
                .num_calls_finished_with_client_failed_to_send
                .swap(0, Ordering::Relaxed),
            num_calls_finished_known_received: self
                .num_calls_finished_known_received
                .swap(0, Ordering::Relaxed),
            calls_finished_with_drop,
        }
    }
}

#[cfg(test)]
mod test {
    use super::ClientStats;

    #[test]
    fn snapshot_resets_counters() {
        let stats = ClientStats::new();
        stats.add_call_started();
        stats.add_call_started();
        stats.add_call_finished(false, true);
        stats.add_call_finished(true, false);

        let report = stats.snapshot();
        assert_eq!(report.num_calls_started, 2);
        assert_eq!(report.num_calls_finished, 2);
        assert_eq!(report.num_calls_finished_with_client_failed_to_send, 1);
        assert_eq!(report.num_calls_finished_known_received, 1);
        assert!(report.calls_finished_with_drop.is_empty());
        assert!(!report.is_zero());

        // Everything was drained by the first snapshot.
        assert!(stats.snapshot().is_zero());
    }

    #[test]
    fn drop_tokens_accumulate_per_bucket() {
        let stats = ClientStats::new();
        stats.add_call_dropped(&"rate_limiting".into());
        stats.add_call_dropped(&"rate_limiting".into());
        stats.add_call_dropped(&"load_shedding".into());

        let report = stats.snapshot();
        assert_eq!(
            report.calls_finished_with_drop,
            vec![
                ("load_shedding".into(), 1),
                ("rate_limiting".into(), 2),
            ]
        );
        assert!(stats.snapshot().calls_finished_with_drop.is_empty());
    }

    #[test]
    fn zero_snapshot_is_zero() {
        let stats = ClientStats::new();
        assert!(stats.snapshot().is_zero());
    }
}
