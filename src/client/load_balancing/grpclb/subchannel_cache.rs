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
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    client::load_balancing::Subchannel,
    rt::{BoxedTaskHandle, GrpcRuntime},
};

use super::{CallbackEvent, PolicyShared};

/// Holds subchannels whose wrappers were released, keeping the underlying
/// connections alive for a grace period.  Rapid serverlist churn then reuses
/// warm connections instead of re-dialing.
///
/// Buckets are keyed by absolute release deadline; within a bucket, insertion
/// order is preserved.  A single timer is armed for the earliest bucket.
pub(crate) struct SubchannelCache {
    interval: Duration,
    cached_subchannels: BTreeMap<Instant, Vec<Arc<dyn Subchannel>>>,
    timer: Option<BoxedTaskHandle>,
}

impl SubchannelCache {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            cached_subchannels: BTreeMap::new(),
            timer: None,
        }
    }

    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Parks a released subchannel until its deadline.  With a zero interval
    /// the subchannel is released immediately.
    pub(crate) fn cache(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        runtime: &GrpcRuntime,
        shared: &Arc<PolicyShared>,
    ) {
        if self.interval.is_zero() {
            return;
        }
        let deadline = Instant::now() + self.interval;
        self.cached_subchannels
            .entry(deadline)
            .or_default()
            .push(subchannel);
        if self.timer.is_none() {
            self.start_timer(runtime, shared);
        }
    }

    fn start_timer(&mut self, runtime: &GrpcRuntime, shared: &Arc<PolicyShared>) {
        let deadline = *self
            .cached_subchannels
            .keys()
            .next()
            .expect("cache timer armed with no cached subchannels");
        let delay = deadline.saturating_duration_since(Instant::now());
        let rt = runtime.clone();
        let shared = shared.clone();
        self.timer = Some(runtime.spawn(Box::pin(async move {
            rt.sleep(delay).await;
            shared.post(CallbackEvent::SubchannelCacheTimer);
        })));
    }

    /// Releases the earliest bucket and re-arms the timer if more buckets
    /// remain.
    pub(crate) fn on_timer(&mut self, runtime: &GrpcRuntime, shared: &Arc<PolicyShared>) {
        if self.timer.is_none() {
            return;
        }
        self.timer = None;
        if let Some((_, subchannels)) = self.cached_subchannels.pop_first() {
            debug!("removing {} subchannels from cache", subchannels.len());
        }
        if !self.cached_subchannels.is_empty() {
            self.start_timer(runtime, shared);
        }
    }

    /// Cancels the timer and releases everything held.
    pub(crate) fn shutdown(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.cached_subchannels.clear();
    }
}
