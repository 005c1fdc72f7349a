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

use std::{cmp, sync::Arc, time::Duration};

use tonic::Status;
use tracing::{debug, info, warn};

use crate::rt::{BoxedTaskHandle, GrpcRuntime};

use super::{
    client_stats::ClientStats,
    load_balancer_api::{
        BalancerChannel, BalancerStream, InitialLoadBalanceRequest, InitialLoadBalanceResponse,
        LoadBalanceRequest,
    },
    CallbackEvent, PolicyShared,
};

/// One streaming call to the balancer and all data related to it.
///
/// The stream itself is driven by a background task that forwards everything
/// it observes into the policy's event queue; every field here is only
/// touched from the policy's serialized context.  Events are tagged with the
/// call's id so events from an abandoned call are discarded.
///
/// The call ends when the balancer sends its trailing status or when the call
/// is cancelled; in both cases the final `BalancerCallStatus` event performs
/// the cleanup.
pub(crate) struct BalancerCall {
    pub(crate) id: u64,
    shared: Arc<PolicyShared>,
    driver: BoxedTaskHandle,
    // Set once the call is established; requests are sent through it.
    stream: Option<Arc<dyn BalancerStream>>,

    // The stats for client-side load reporting associated with this call.
    // Created after the first serverlist is received.
    client_stats: Option<Arc<ClientStats>>,
    client_stats_report_interval: Option<Duration>,
    load_report_timer: Option<BoxedTaskHandle>,
    last_load_report_counters_were_zero: bool,
    // Set when a report came due while the initial request was still being
    // sent; the initial-request completion emits it.
    load_report_is_due: bool,

    initial_request_sent: bool,
    pub(crate) seen_initial_response: bool,
    pub(crate) seen_serverlist: bool,
}

impl BalancerCall {
    /// Starts the call: issues the RPC, sends the initial request, and begins
    /// the receive loop.
    pub(crate) fn start(
        id: u64,
        channel: Arc<dyn BalancerChannel>,
        deadline: Option<Duration>,
        initial_request_name: String,
        runtime: &GrpcRuntime,
        shared: &Arc<PolicyShared>,
    ) -> Self {
        let events = shared.clone();
        let driver = runtime.spawn(Box::pin(async move {
            let stream = match channel.start_call(deadline).await {
                Ok(stream) => stream,
                Err(status) => {
                    events.post(CallbackEvent::BalancerCallStatus { call: id, status });
                    return;
                }
            };
            events.post(CallbackEvent::BalancerCallEstablished {
                call: id,
                stream: stream.clone(),
            });
            let initial = LoadBalanceRequest::Initial(InitialLoadBalanceRequest {
                name: initial_request_name,
            });
            if let Err(status) = stream.send(initial).await {
                events.post(CallbackEvent::BalancerCallStatus { call: id, status });
                return;
            }
            events.post(CallbackEvent::InitialRequestSent { call: id });
            loop {
                match stream.recv().await {
                    Ok(Some(response)) => {
                        events.post(CallbackEvent::BalancerMessage { call: id, response });
                    }
                    Ok(None) => {
                        events.post(CallbackEvent::BalancerCallStatus {
                            call: id,
                            status: Status::ok("balancer closed the stream"),
                        });
                        return;
                    }
                    Err(status) => {
                        events.post(CallbackEvent::BalancerCallStatus { call: id, status });
                        return;
                    }
                }
            }
        }));
        Self {
            id,
            shared: shared.clone(),
            driver,
            stream: None,
            client_stats: None,
            client_stats_report_interval: None,
            load_report_timer: None,
            last_load_report_counters_were_zero: false,
            load_report_is_due: false,
            initial_request_sent: false,
            seen_initial_response: false,
            seen_serverlist: false,
        }
    }

    pub(crate) fn client_stats(&self) -> Option<&Arc<ClientStats>> {
        self.client_stats.as_ref()
    }

    /// Cancels the underlying call and the pending load-report timer.  Final
    /// cleanup still happens when the trailing status is delivered (or, for a
    /// call that never became established, when the driver is aborted).
    pub(crate) fn cancel(&mut self) {
        match &self.stream {
            Some(stream) => stream.cancel(),
            None => self.driver.abort(),
        }
        if let Some(timer) = self.load_report_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn on_established(&mut self, stream: Arc<dyn BalancerStream>) {
        self.stream = Some(stream);
    }

    /// The initial request finished sending; emit any load report that came
    /// due in the meantime.
    pub(crate) fn on_initial_request_sent(&mut self, runtime: &GrpcRuntime) {
        self.initial_request_sent = true;
        if self.load_report_is_due {
            self.load_report_is_due = false;
            self.send_load_report(runtime);
        }
    }

    pub(crate) fn on_initial_response(&mut self, response: InitialLoadBalanceResponse) {
        if self.seen_initial_response {
            warn!("grpclb: duplicate initial LB response received, ignoring");
            return;
        }
        if !response.client_stats_report_interval.is_zero() {
            let interval = cmp::max(
                Duration::from_secs(1),
                response.client_stats_report_interval,
            );
            info!(
                "grpclb: received initial LB response; client load reporting interval = {} ms",
                interval.as_millis()
            );
            self.client_stats_report_interval = Some(interval);
        } else {
            info!("grpclb: received initial LB response; client load reporting NOT enabled");
        }
        self.seen_initial_response = true;
    }

    /// Records that a serverlist arrived on this call and, on the first one,
    /// begins load reporting if the balancer asked for it.
    pub(crate) fn note_serverlist(&mut self, runtime: &GrpcRuntime) {
        self.seen_serverlist = true;
        if self.client_stats_report_interval.is_some() && self.client_stats.is_none() {
            self.client_stats = Some(Arc::new(ClientStats::new()));
            self.schedule_load_report(runtime);
        }
    }

    fn schedule_load_report(&mut self, runtime: &GrpcRuntime) {
        let interval = self.client_stats_report_interval.unwrap();
        let shared = self.shared.clone();
        let id = self.id;
        let rt = runtime.clone();
        self.load_report_timer = Some(runtime.spawn(Box::pin(async move {
            rt.sleep(interval).await;
            shared.post(CallbackEvent::LoadReportTimer { call: id });
        })));
    }

    pub(crate) fn on_load_report_timer(&mut self, runtime: &GrpcRuntime) {
        self.load_report_timer = None;
        // The load report must not overlap the initial request send; if the
        // initial request is still in flight, emit the report once it has
        // been sent.
        if !self.initial_request_sent {
            self.load_report_is_due = true;
            return;
        }
        self.send_load_report(runtime);
    }

    fn send_load_report(&mut self, runtime: &GrpcRuntime) {
        let report = self.client_stats.as_ref().unwrap().snapshot();
        // Skip the report if the counters were all zero in the last report
        // and are still all zero in this one.
        if report.is_zero() {
            if self.last_load_report_counters_were_zero {
                self.schedule_load_report(runtime);
                return;
            }
            self.last_load_report_counters_were_zero = true;
        } else {
            self.last_load_report_counters_were_zero = false;
        }
        let stream = self.stream.clone().unwrap();
        let shared = self.shared.clone();
        let id = self.id;
        debug!("grpclb: sending client load report");
        // The send completion re-enters the policy to schedule the next
        // report; the task handle is intentionally not retained.
        drop(runtime.spawn(Box::pin(async move {
            let result = stream.send(LoadBalanceRequest::ClientStats(report)).await;
            shared.post(CallbackEvent::LoadReportSent { call: id, result });
        })));
    }

    pub(crate) fn on_load_report_sent(
        &mut self,
        result: Result<(), Status>,
        runtime: &GrpcRuntime,
    ) {
        match result {
            // Schedule the next load report only if the last one was sent
            // successfully; a failed send means the stream is going away and
            // its trailing status will drive the retry logic.
            Ok(()) => self.schedule_load_report(runtime),
            Err(status) => warn!("grpclb: failed to send client load report: {status}"),
        }
    }
}

impl Drop for BalancerCall {
    fn drop(&mut self) {
        self.driver.abort();
        if let Some(timer) = self.load_report_timer.take() {
            timer.abort();
        }
    }
}
