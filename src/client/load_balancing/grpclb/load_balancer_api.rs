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

//! The LoadBalancer protocol surface the policy consumes.
//!
//! The policy only depends on the in-memory shape of the protocol messages
//! and on the two seams below (`BalancerChannel`, `BalancerStream`).  Wire
//! encoding, connection management of the balancer channel, and the
//! `pick_first` selection among balancer addresses all live behind those
//! seams.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::watch;
use tonic::{async_trait, Status};

use crate::{
    byte_str::ByteStr,
    client::{
        name_resolution::{Endpoint, Target},
        ConnectivityState,
    },
    rt::GrpcRuntime,
};

/// The full method name of the balancer's streaming RPC.
pub static BALANCE_LOAD_METHOD: &str = "/grpc.lb.v1.LoadBalancer/BalanceLoad";

/// A request message sent by the client on the balancer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadBalanceRequest {
    /// The first (and only the first) message on every stream.
    Initial(InitialLoadBalanceRequest),
    /// A periodic client load report.
    ClientStats(ClientStatsReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialLoadBalanceRequest {
    /// The name of the load balanced service, e.g. the channel authority.
    pub name: String,
}

/// A snapshot of per-call counters since the previous report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatsReport {
    pub num_calls_started: i64,
    pub num_calls_finished: i64,
    pub num_calls_finished_with_client_failed_to_send: i64,
    pub num_calls_finished_known_received: i64,
    /// Per-token counts of calls dropped on balancer direction.
    pub calls_finished_with_drop: Vec<(ByteStr, i64)>,
}

impl ClientStatsReport {
    /// Reports whether every counter in the snapshot is zero.
    pub fn is_zero(&self) -> bool {
        self.num_calls_started == 0
            && self.num_calls_finished == 0
            && self.num_calls_finished_with_client_failed_to_send == 0
            && self.num_calls_finished_known_received == 0
            && self.calls_finished_with_drop.is_empty()
    }
}

/// A response message received from the balancer, already decoded from the
/// wire by the `BalancerStream` implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadBalanceResponse {
    /// The first message on every stream.
    Initial(InitialLoadBalanceResponse),
    /// A new authoritative list of backends.
    ServerList(Vec<GrpclbServer>),
    /// A directive to use resolver-provided backends instead.
    Fallback,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialLoadBalanceResponse {
    /// Interval at which the client should report load; zero disables load
    /// reporting.
    pub client_stats_report_interval: Duration,
}

/// One entry of a serverlist: a backend address or a drop marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrpclbServer {
    /// The backend IP in network byte order: 4 bytes for IPv4, 16 for IPv6.
    /// Empty for drop entries.
    pub ip_address: Bytes,
    pub port: u32,
    /// Opaque token to echo back in the `lb-token` metadata of calls routed
    /// to this backend, and to name the drop bucket for drop entries.
    pub load_balance_token: ByteStr,
    /// When set, calls landing on this entry fail locally and are counted
    /// against `load_balance_token`.
    pub drop: bool,
}

/// One `/grpc.lb.v1.LoadBalancer/BalanceLoad` streaming call.
///
/// `send` and `recv` may be invoked concurrently from different tasks;
/// implementations provide their own interior synchronization.
#[async_trait]
pub trait BalancerStream: Send + Sync {
    /// Sends a request message on the stream.
    async fn send(&self, request: LoadBalanceRequest) -> Result<(), Status>;

    /// Receives the next response message.  Returns `Ok(None)` once the
    /// server has closed the stream with an OK status; a non-OK close
    /// surfaces as `Err` carrying the trailing status.
    async fn recv(&self) -> Result<Option<LoadBalanceResponse>, Status>;

    /// Cancels the call.  A pending or future `recv` completes with a
    /// CANCELLED status.  Idempotent.
    fn cancel(&self);
}

/// The dedicated client channel to the balancer service.
///
/// A production implementation is a regular channel running `pick_first`
/// across the balancer addresses, fed through an in-process resolver.
pub trait BalancerChannel: Send + Sync {
    /// Replaces the set of balancer addresses the channel connects over, as
    /// if the channel's resolver had produced them.
    fn update_addresses(&self, endpoints: Vec<Endpoint>);

    /// Returns a receiver tracking the channel's connectivity state.
    fn watch_state(&self) -> watch::Receiver<ConnectivityState>;

    /// Starts a new `BalanceLoad` call with the given deadline (`None` means
    /// no deadline).
    fn start_call(
        &self,
        deadline: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BalancerStream>, Status>> + Send + 'static>>;

    /// Resets any connection backoff in progress so the next connection
    /// attempt may happen immediately.
    fn reset_connect_backoff(&self);
}

/// Creates balancer channels on behalf of the policy.
pub trait BalancerChannelFactory: Send + Sync {
    /// Creates a channel for the given target.  The target authority names
    /// the balanced service; the addresses to connect to are supplied later
    /// via `BalancerChannel::update_addresses`.
    fn create_channel(&self, target: &Target, runtime: GrpcRuntime) -> Arc<dyn BalancerChannel>;
}
