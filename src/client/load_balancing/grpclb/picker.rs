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

use std::sync::Arc;

use tonic::{metadata::MetadataValue, Status};
use tracing::warn;

use crate::{
    client::load_balancing::{CallOutcome, PickResult, Picker},
    service::Request,
};

use super::{client_stats::ClientStats, serverlist::Serverlist, SubchannelWrapper};

/// The picker the policy exposes to the channel.
///
/// It enforces balancer-directed drops ahead of the child policy's pick, and
/// decorates complete picks with the backend's LB token and per-call stats
/// tracking.  The serverlist is None whenever drops must not be counted (the
/// child is not READY and the list is not drop-only), so queued picks retried
/// against later pickers are not double-counted.
pub(crate) struct DropPicker {
    serverlist: Option<Arc<Serverlist>>,
    child_picker: Arc<dyn Picker>,
    client_stats: Option<Arc<ClientStats>>,
}

impl DropPicker {
    pub(crate) fn new(
        serverlist: Option<Arc<Serverlist>>,
        child_picker: Arc<dyn Picker>,
        client_stats: Option<Arc<ClientStats>>,
    ) -> Self {
        Self {
            serverlist,
            child_picker,
            client_stats,
        }
    }
}

impl Picker for DropPicker {
    fn pick(&self, request: &Request) -> PickResult {
        // Check if the balancer directed this call to be dropped.  Dropped
        // calls never reach a subchannel, so they are counted here rather
        // than by the per-call tracker.
        if let Some(serverlist) = &self.serverlist {
            if let Some(token) = serverlist.should_drop() {
                if let Some(stats) = &self.client_stats {
                    stats.add_call_dropped(token);
                }
                return PickResult::Drop(Status::unavailable(
                    "drop directed by grpclb balancer",
                ));
            }
        }
        // Forward the pick to the child policy.
        let result = self.child_picker.pick(request);
        let PickResult::Pick(mut pick) = result else {
            return result;
        };
        let subchannel = pick.subchannel.clone();
        let Some(wrapper) = subchannel.as_any().downcast_ref::<SubchannelWrapper>() else {
            debug_assert!(false, "child picker returned a subchannel grpclb did not create");
            return PickResult::Pick(pick);
        };
        if let Some(stats) = wrapper.client_stats() {
            stats.add_call_started();
            // Chain a tracker that records the call's completion.  If the
            // call never starts, the tracker is dropped uninvoked and only
            // the stats reference is released.
            let stats = stats.clone();
            let inner_on_complete = pick.on_complete.take();
            pick.on_complete = Some(Box::new(move |outcome: &CallOutcome| {
                stats.add_call_finished(outcome.client_failed_to_send, outcome.known_received);
                if let Some(on_complete) = inner_on_complete {
                    on_complete(outcome);
                }
            }));
        }
        // Attach the LB token so the balancer can correlate the call with
        // the backend it handed out.
        if !wrapper.lb_token().is_empty() {
            match MetadataValue::try_from(&**wrapper.lb_token()) {
                Ok(value) => {
                    pick.metadata.insert("lb-token", value);
                }
                Err(err) => warn!("grpclb: failed to encode lb-token metadata: {err}"),
            }
        }
        // Unwrap so the channel sees the real subchannel.
        pick.subchannel = wrapper.wrapped_subchannel();
        PickResult::Pick(pick)
    }
}
