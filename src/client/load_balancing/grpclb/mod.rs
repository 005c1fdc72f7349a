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

//! The gRPCLB load balancing policy.
//!
//! This policy takes as input a list of resolved addresses, which must
//! include at least one balancer address (carried in the update's
//! [`BalancerAddresses`] attribute).
//!
//! A dedicated channel (the balancer channel) is maintained to the balancer
//! addresses; over it, the policy keeps a long-lived streaming call to the
//! balancer.  The call completes when the balancer sends status or when the
//! policy cancels it; if needed, the call is retried.  If at least one valid
//! message was received on a call, the next attempt is made immediately,
//! otherwise attempts are spaced by exponential backoff.
//!
//! A child policy instance (round_robin by default) distributes requests
//! across the backends named in the most recent serverlist from the
//! balancer.  If the balancer cannot be reached around startup, the policy
//! may enter fallback mode, in which the child policy is populated with the
//! backend addresses returned by the resolver instead.
//!
//! See https://github.com/grpc/grpc/blob/master/doc/load-balancing.md for the
//! high level design.

mod balancer_call;
mod client_stats;
mod config;
mod load_balancer_api;
mod picker;
mod serverlist;
mod subchannel_cache;


pub use client_stats::ClientStats;
pub use load_balancer_api::{
    BalancerChannel, BalancerChannelFactory, BalancerStream, ClientStatsReport, GrpclbServer,
    InitialLoadBalanceRequest, InitialLoadBalanceResponse, LoadBalanceRequest,
    LoadBalanceResponse, BALANCE_LOAD_METHOD,
};

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{HashMap, VecDeque},
    error::Error,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use tonic::Status;
use tracing::{debug, info, warn};

use crate::{
    attributes::Attributes,
    byte_str::ByteStr,
    client::{
        load_balancing::{
            ChannelController, ForwardingSubchannel, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
            LbState, Subchannel, SubchannelState, WeakSubchannel, WorkScheduler,
            GLOBAL_LB_REGISTRY,
        },
        name_resolution::{backoff::ExponentialBackoff, Address, Endpoint, ResolverUpdate, Target},
        service_config::{LbConfig, ParsedJsonLbConfig},
        ConnectivityState,
    },
    rt::{BoxedTaskHandle, GrpcRuntime},
};

use balancer_call::BalancerCall;
use config::GrpclbConfig;
use picker::DropPicker;
use serverlist::Serverlist;
use subchannel_cache::SubchannelCache;

pub static POLICY_NAME: &str = "grpclb";

/// The balancer endpoints extracted by the resolver, delivered to the policy
/// as a `ResolverUpdate` attribute.  The update's own endpoint list carries
/// the fallback backends.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BalancerAddresses(pub Vec<Endpoint>);

/// Marks an address as pointing at a grpclb balancer rather than a backend.
/// Set by the policy on every address pushed into the balancer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IsGrpclbLoadBalancer;

/// Set on the child policy's update to indicate whether its addresses came
/// from the balancer (as opposed to resolver-provided fallback backends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IsBackendFromGrpclbBalancer(pub bool);

/// Instructs the subchannel machinery not to run per-connection health checks
/// for balancer-provided backends; the balancer is authoritative for backend
/// health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InhibitHealthChecking;

/// Tunables the channel hands the policy through the update's attributes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GrpclbArgs {
    /// Deadline applied to each balancer call; zero means none.
    pub call_timeout: Duration,
    /// How long to wait for a serverlist at startup before using the
    /// resolver-provided backends.
    pub fallback_at_startup_timeout: Duration,
    /// How long released subchannels are kept warm; zero releases them
    /// immediately.
    pub subchannel_cache_interval: Duration,
    /// When set, a serverlist received in fallback mode does not exit
    /// fallback until the child policy reports READY on the new backends.
    /// Off by default: the stock behavior exits fallback on the first
    /// serverlist even if none of its backends are reachable.
    pub retain_fallback_until_child_ready: bool,
}

impl Default for GrpclbArgs {
    fn default() -> Self {
        Self {
            call_timeout: Duration::ZERO,
            fallback_at_startup_timeout: Duration::from_secs(10),
            subchannel_cache_interval: Duration::from_secs(10),
            retain_fallback_until_child_ready: false,
        }
    }
}

/// Per-address attribute carrying the backend's LB token and the stats object
/// that calls routed to it are counted against.  Attached by the policy to
/// every address handed to the child, so the subchannel-creation path can
/// build the matching wrapper.
#[derive(Debug, Clone)]
pub struct TokenAndClientStats {
    pub lb_token: ByteStr,
    pub client_stats: Option<Arc<ClientStats>>,
}

impl TokenAndClientStats {
    fn stats_ptr(&self) -> usize {
        self.client_stats
            .as_ref()
            .map_or(0, |stats| Arc::as_ptr(stats) as usize)
    }
}

impl PartialEq for TokenAndClientStats {
    fn eq(&self, other: &Self) -> bool {
        self.lb_token == other.lb_token && self.stats_ptr() == other.stats_ptr()
    }
}

impl Eq for TokenAndClientStats {}

impl PartialOrd for TokenAndClientStats {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TokenAndClientStats {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.lb_token
            .cmp(&other.lb_token)
            .then(self.stats_ptr().cmp(&other.stats_ptr()))
    }
}

/// Builds grpclb policy instances.  The factory supplies the balancer-channel
/// machinery, which lives outside this policy.
pub struct GrpclbBuilder {
    channel_factory: Arc<dyn BalancerChannelFactory>,
}

impl GrpclbBuilder {
    pub fn new(channel_factory: Arc<dyn BalancerChannelFactory>) -> Self {
        Self { channel_factory }
    }
}

impl LbPolicyBuilder for GrpclbBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(GrpclbPolicy::new(options, self.channel_factory.clone()))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        config::parse_config(config)
    }
}

/// Registers the grpclb policy with the given balancer-channel factory.
pub fn reg(channel_factory: Arc<dyn BalancerChannelFactory>) {
    GLOBAL_LB_REGISTRY.add_builder(GrpclbBuilder::new(channel_factory));
}

/// The completions the policy's asynchronous collaborators re-enter it with.
///
/// Everything here is queued and later drained inside `work`, so all policy
/// state is only ever touched from the channel's serialized context.  Events
/// carrying a `call` id are dropped when they outlive the call they belong
/// to.
pub(crate) enum CallbackEvent {
    BalancerCallEstablished {
        call: u64,
        stream: Arc<dyn BalancerStream>,
    },
    InitialRequestSent {
        call: u64,
    },
    BalancerMessage {
        call: u64,
        response: LoadBalanceResponse,
    },
    BalancerCallStatus {
        call: u64,
        status: Status,
    },
    LoadReportTimer {
        call: u64,
    },
    LoadReportSent {
        call: u64,
        result: Result<(), Status>,
    },
    FallbackTimer,
    RetryTimer,
    LbChannelState(ConnectivityState),
    OrphanedSubchannel(Arc<dyn Subchannel>),
    SubchannelCacheTimer,
    ChildWork,
}

/// The handle shared with timers, stream tasks and subchannel wrappers.
/// Posting enqueues an event and pokes the channel's work scheduler; once the
/// policy shuts down, posts become no-ops.
pub(crate) struct PolicyShared {
    shutting_down: AtomicBool,
    events: Mutex<VecDeque<CallbackEvent>>,
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl PolicyShared {
    pub(crate) fn new(work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            events: Mutex::new(VecDeque::new()),
            work_scheduler,
        }
    }

    pub(crate) fn post(&self, event: CallbackEvent) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let mut events = self.events.lock().unwrap();
        events.push_back(event);
        // A single pending work call drains the whole queue.
        if events.len() == 1 {
            self.work_scheduler.schedule_work();
        }
    }

    fn next_event(&self) -> Option<CallbackEvent> {
        self.events.lock().unwrap().pop_front()
    }

    fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.events.lock().unwrap().clear();
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

/// Decorates each backend subchannel with its LB token and stats reference.
/// When the child policy releases the wrapper, the wrapped subchannel is
/// handed back to the policy for delayed release through the cache.
pub(crate) struct SubchannelWrapper {
    subchannel: Arc<dyn Subchannel>,
    lb_token: ByteStr,
    client_stats: Option<Arc<ClientStats>>,
    policy: Arc<PolicyShared>,
}

impl SubchannelWrapper {
    pub(crate) fn new(
        subchannel: Arc<dyn Subchannel>,
        lb_token: ByteStr,
        client_stats: Option<Arc<ClientStats>>,
        policy: Arc<PolicyShared>,
    ) -> Self {
        Self {
            subchannel,
            lb_token,
            client_stats,
            policy,
        }
    }

    pub(crate) fn lb_token(&self) -> &ByteStr {
        &self.lb_token
    }

    pub(crate) fn client_stats(&self) -> Option<&Arc<ClientStats>> {
        self.client_stats.as_ref()
    }

    pub(crate) fn wrapped_subchannel(&self) -> Arc<dyn Subchannel> {
        self.subchannel.clone()
    }
}

impl ForwardingSubchannel for SubchannelWrapper {
    fn delegate(&self) -> Arc<dyn Subchannel> {
        self.subchannel.clone()
    }
}

impl Display for SubchannelWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.subchannel)
    }
}

impl Drop for SubchannelWrapper {
    fn drop(&mut self) {
        // Posting is a no-op once the policy is shutting down, in which case
        // the subchannel is simply released.
        self.policy
            .post(CallbackEvent::OrphanedSubchannel(self.subchannel.clone()));
    }
}

struct ChildPolicy {
    builder: Arc<dyn LbPolicyBuilder>,
    policy: Box<dyn LbPolicy>,
}

struct ChildWorkScheduler {
    shared: Arc<PolicyShared>,
}

impl WorkScheduler for ChildWorkScheduler {
    fn schedule_work(&self) {
        self.shared.post(CallbackEvent::ChildWork);
    }
}

pub struct GrpclbPolicy {
    runtime: GrpcRuntime,
    authority: String,
    channel_factory: Arc<dyn BalancerChannelFactory>,
    shared: Arc<PolicyShared>,

    config: Option<Arc<GrpclbConfig>>,
    args: GrpclbArgs,

    lb_channel: Option<Arc<dyn BalancerChannel>>,
    lb_channel_watch: Option<BoxedTaskHandle>,

    // At most one balancer call is alive at a time.  Its id tags the events
    // it emits; events for any other id refer to an abandoned call.
    balancer_call: Option<BalancerCall>,
    next_call_id: u64,
    lb_call_backoff: ExponentialBackoff,
    retry_timer: Option<BoxedTaskHandle>,

    // The most recent non-duplicate serverlist from the balancer.
    serverlist: Option<Arc<Serverlist>>,

    fallback_mode: bool,
    // Set when a serverlist was applied in fallback mode but, per
    // `GrpclbArgs::retain_fallback_until_child_ready`, fallback is only left
    // once the child reports READY.
    fallback_exit_pending: bool,
    fallback_at_startup_checks_pending: bool,
    fallback_timer: Option<BoxedTaskHandle>,
    // The backend addresses from the resolver, used in fallback mode.
    fallback_backends: Result<Vec<Endpoint>, String>,
    // The last resolution note from the resolver, passed through to the
    // child when the fallback backend list is empty.
    resolution_note: Option<String>,

    child_policy: Option<ChildPolicy>,
    child_ready: bool,

    // Maps the channel's subchannels to the wrappers handed to the child.
    subchannels: HashMap<WeakSubchannel, Weak<SubchannelWrapper>>,
    subchannel_cache: SubchannelCache,
}

impl GrpclbPolicy {
    fn new(options: LbPolicyOptions, channel_factory: Arc<dyn BalancerChannelFactory>) -> Self {
        let args = GrpclbArgs::default();
        Self {
            runtime: options.runtime,
            authority: options.authority,
            channel_factory,
            shared: Arc::new(PolicyShared::new(options.work_scheduler)),
            config: None,
            subchannel_cache: SubchannelCache::new(args.subchannel_cache_interval),
            args,
            lb_channel: None,
            lb_channel_watch: None,
            balancer_call: None,
            next_call_id: 0,
            lb_call_backoff: ExponentialBackoff::default(),
            retry_timer: None,
            serverlist: None,
            fallback_mode: false,
            fallback_exit_pending: false,
            fallback_at_startup_checks_pending: false,
            fallback_timer: None,
            fallback_backends: Ok(vec![]),
            resolution_note: None,
            child_policy: None,
            child_ready: false,
            subchannels: HashMap::new(),
        }
    }

    //
    // Balancer channel and call management.
    //

    fn update_balancer_channel(
        &mut self,
        update: &ResolverUpdate,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut balancer_endpoints = update
            .attributes
            .get::<BalancerAddresses>()
            .map(|addresses| addresses.0.clone())
            .unwrap_or_default();
        for endpoint in &balancer_endpoints {
            for address in &endpoint.addresses {
                debug!("grpclb: balancer address: {address}");
            }
        }
        let result = if balancer_endpoints.is_empty() {
            Err("balancer address list must be non-empty".into())
        } else {
            Ok(())
        };
        for endpoint in &mut balancer_endpoints {
            for address in &mut endpoint.addresses {
                address.attributes = address.attributes.add(IsGrpclbLoadBalancer);
            }
        }
        if self.lb_channel.is_none() {
            let target: Target = format!("fake:///{}", self.authority).parse()?;
            self.lb_channel = Some(
                self.channel_factory
                    .create_channel(&target, self.runtime.clone()),
            );
        }
        // Propagate the (possibly empty) address list into the balancer
        // channel.
        self.lb_channel
            .as_ref()
            .unwrap()
            .update_addresses(balancer_endpoints);
        result
    }

    fn start_lb_channel_watch(&mut self) {
        let mut state_rx = self.lb_channel.as_ref().unwrap().watch_state();
        let shared = self.shared.clone();
        self.lb_channel_watch = Some(self.runtime.spawn(Box::pin(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                shared.post(CallbackEvent::LbChannelState(state));
            }
        })));
    }

    fn cancel_lb_channel_watch(&mut self) {
        if let Some(watch) = self.lb_channel_watch.take() {
            watch.abort();
        }
    }

    fn start_balancer_call(&mut self) {
        if self.shared.is_shutting_down() {
            return;
        }
        debug_assert!(self.balancer_call.is_none());
        let channel = self.lb_channel.as_ref().unwrap().clone();
        let deadline = (!self.args.call_timeout.is_zero()).then_some(self.args.call_timeout);
        // The initial request names the configured service, or the channel
        // authority when no service name was configured.
        let name = self
            .config
            .as_ref()
            .and_then(|config| config.service_name().map(str::to_string))
            .unwrap_or_else(|| self.authority.clone());
        self.next_call_id += 1;
        info!(
            "grpclb: querying balancer for backends (call {})",
            self.next_call_id
        );
        self.balancer_call = Some(BalancerCall::start(
            self.next_call_id,
            channel,
            deadline,
            name,
            &self.runtime,
            &self.shared,
        ));
    }

    fn start_balancer_call_retry_timer(&mut self) {
        let delay = self.lb_call_backoff.backoff_duration();
        info!("grpclb: connection to balancer lost; retrying call in {delay:?}");
        let shared = self.shared.clone();
        let rt = self.runtime.clone();
        self.retry_timer = Some(self.runtime.spawn(Box::pin(async move {
            rt.sleep(delay).await;
            shared.post(CallbackEvent::RetryTimer);
        })));
    }

    fn on_retry_timer(&mut self) {
        self.retry_timer = None;
        if self.balancer_call.is_none() {
            info!("grpclb: restarting call to balancer");
            self.start_balancer_call();
        }
    }

    fn current_call(&self) -> Option<u64> {
        self.balancer_call.as_ref().map(|call| call.id)
    }

    //
    // Balancer message and status handling.
    //

    fn on_balancer_message(
        &mut self,
        response: LoadBalanceResponse,
        channel_controller: &mut dyn ChannelController,
    ) {
        match response {
            LoadBalanceResponse::Initial(initial) => {
                self.balancer_call.as_mut().unwrap().on_initial_response(initial);
            }
            LoadBalanceResponse::ServerList(servers) => {
                self.on_serverlist(servers, channel_controller);
            }
            LoadBalanceResponse::Fallback => self.on_fallback_directive(channel_controller),
        }
    }

    fn on_serverlist(
        &mut self,
        servers: Vec<GrpclbServer>,
        channel_controller: &mut dyn ChannelController,
    ) {
        let serverlist = Arc::new(Serverlist::new(servers));
        info!(
            "grpclb: serverlist with {} servers received:\n{}",
            serverlist.len(),
            serverlist.as_text()
        );
        // Load reports cover the time the serverlist from this call is in
        // use, so reporting starts with the first serverlist.
        let runtime = self.runtime.clone();
        self.balancer_call.as_mut().unwrap().note_serverlist(&runtime);
        if self
            .serverlist
            .as_ref()
            .is_some_and(|current| **current == *serverlist)
        {
            info!("grpclb: incoming serverlist identical to current, ignoring");
            return;
        }
        // A new serverlist: leave fallback mode and stop any
        // fallback-at-startup bookkeeping before adopting it.
        if self.fallback_mode {
            if self.args.retain_fallback_until_child_ready {
                info!("grpclb: received serverlist; leaving fallback once child is ready");
                self.fallback_exit_pending = true;
            } else {
                info!("grpclb: received response from balancer; exiting fallback mode");
                self.fallback_mode = false;
            }
        }
        if self.fallback_at_startup_checks_pending {
            self.fallback_at_startup_checks_pending = false;
            self.cancel_fallback_timer();
            self.cancel_lb_channel_watch();
        }
        self.serverlist = Some(serverlist);
        self.create_or_update_child_policy(channel_controller);
    }

    fn on_fallback_directive(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.fallback_mode {
            if self.fallback_exit_pending {
                // The balancer reasserted fallback while we were waiting for
                // the child to become ready on balancer backends.
                info!("grpclb: balancer reasserted fallback; abandoning pending fallback exit");
                self.fallback_exit_pending = false;
                self.serverlist = None;
                self.create_or_update_child_policy(channel_controller);
            }
            return;
        }
        info!("grpclb: entering fallback mode as requested by balancer");
        if self.fallback_at_startup_checks_pending {
            self.fallback_at_startup_checks_pending = false;
            self.cancel_fallback_timer();
            self.cancel_lb_channel_watch();
        }
        self.fallback_mode = true;
        self.create_or_update_child_policy(channel_controller);
        // Reset the serverlist so that if the balancer later exits fallback
        // by sending the serverlist we were previously using, it is not
        // ignored as a duplicate.
        self.serverlist = None;
    }

    fn on_balancer_call_status(
        &mut self,
        status: Status,
        channel_controller: &mut dyn ChannelController,
    ) {
        // The call is no longer usable; this ending was not deliberate, so
        // arrange for a new one.
        let call = self.balancer_call.take().unwrap();
        info!(
            "grpclb: balancer call ended with status {:?}: {}",
            status.code(),
            status.message()
        );
        if self.fallback_at_startup_checks_pending {
            debug_assert!(!call.seen_serverlist);
            info!(
                "grpclb: balancer call finished without receiving serverlist; entering fallback \
                 mode"
            );
            self.fallback_at_startup_checks_pending = false;
            self.cancel_fallback_timer();
            self.cancel_lb_channel_watch();
            self.fallback_mode = true;
            self.create_or_update_child_policy(channel_controller);
        } else {
            self.maybe_enter_fallback_mode_after_startup(channel_controller);
        }
        channel_controller.request_resolution();
        if call.seen_initial_response {
            // The balancer was reached on this call; reset the backoff and
            // restart the call immediately.
            self.lb_call_backoff.reset();
            self.start_balancer_call();
        } else {
            // No connection was established on this call; retry later.
            self.start_balancer_call_retry_timer();
        }
    }

    //
    // Fallback handling.
    //

    fn start_fallback_timer(&mut self) {
        let timeout = self.args.fallback_at_startup_timeout;
        let shared = self.shared.clone();
        let rt = self.runtime.clone();
        self.fallback_timer = Some(self.runtime.spawn(Box::pin(async move {
            rt.sleep(timeout).await;
            shared.post(CallbackEvent::FallbackTimer);
        })));
    }

    fn cancel_fallback_timer(&mut self) {
        if let Some(timer) = self.fallback_timer.take() {
            timer.abort();
        }
    }

    fn on_fallback_timer(&mut self, channel_controller: &mut dyn ChannelController) {
        self.fallback_timer = None;
        // A serverlist that arrived after the timer fired but before this
        // event ran has already cleared the pending flag; do not fall back.
        if self.fallback_at_startup_checks_pending {
            info!(
                "grpclb: no response from balancer within the fallback timeout; entering \
                 fallback mode"
            );
            self.fallback_at_startup_checks_pending = false;
            self.cancel_lb_channel_watch();
            self.fallback_mode = true;
            self.create_or_update_child_policy(channel_controller);
        }
    }

    fn on_lb_channel_state(
        &mut self,
        state: ConnectivityState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if self.fallback_at_startup_checks_pending
            && state == ConnectivityState::TransientFailure
        {
            info!("grpclb: balancer channel in TRANSIENT_FAILURE; entering fallback mode");
            self.fallback_at_startup_checks_pending = false;
            self.cancel_fallback_timer();
            self.fallback_mode = true;
            self.create_or_update_child_policy(channel_controller);
            // The channel state no longer matters once in fallback mode.
            self.cancel_lb_channel_watch();
        }
    }

    fn maybe_enter_fallback_mode_after_startup(
        &mut self,
        channel_controller: &mut dyn ChannelController,
    ) {
        // Enter fallback mode if all of the following are true:
        // - We are not currently in fallback mode.
        // - We are not currently waiting for the initial fallback timeout.
        // - We are not currently in contact with the balancer.
        // - The child policy is not in state READY.
        if !self.fallback_mode
            && !self.fallback_at_startup_checks_pending
            && self
                .balancer_call
                .as_ref()
                .map_or(true, |call| !call.seen_serverlist)
            && !self.child_ready
        {
            info!(
                "grpclb: lost contact with balancer and backends from most recent serverlist; \
                 entering fallback mode"
            );
            self.fallback_mode = true;
            self.create_or_update_child_policy(channel_controller);
        }
    }

    //
    // Child policy management.
    //

    fn create_or_update_child_policy(&mut self, channel_controller: &mut dyn ChannelController) {
        let config = self.config.clone().unwrap();
        let use_fallback = self.fallback_mode && !self.fallback_exit_pending;
        let mut resolution_note = None;
        let mut attributes =
            Attributes::new().add(IsBackendFromGrpclbBalancer(!use_fallback));
        let endpoints: Result<Vec<Endpoint>, String>;
        if use_fallback {
            // Use the fallback backends from the resolver.  The list may be
            // empty, in which case the child policy will fail picks.
            endpoints = self.fallback_backends.clone().map(|endpoints| {
                endpoints
                    .into_iter()
                    .map(|mut endpoint| {
                        for address in &mut endpoint.addresses {
                            debug!("grpclb: fallback address: {address}");
                            address.attributes =
                                address.attributes.add(TokenAndClientStats {
                                    lb_token: ByteStr::default(),
                                    client_stats: None,
                                });
                        }
                        endpoint
                    })
                    .collect()
            });
            if endpoints.as_ref().is_ok_and(|endpoints| endpoints.is_empty()) {
                resolution_note = Some(format!(
                    "grpclb in fallback mode without any fallback addresses: {}",
                    self.resolution_note.clone().unwrap_or_default()
                ));
            }
        } else {
            let client_stats = self
                .balancer_call
                .as_ref()
                .and_then(|call| call.client_stats().cloned());
            endpoints = Ok(self
                .serverlist
                .as_ref()
                .unwrap()
                .backend_endpoints(client_stats.as_ref()));
            if endpoints.as_ref().unwrap().is_empty() {
                resolution_note = Some("empty serverlist from grpclb balancer".to_string());
            }
            attributes = attributes.add(InhibitHealthChecking);
        }
        // Recreate the child if the configured policy type changed; the old
        // child's subchannels migrate to the cache as it drops them.
        let builder = config.child_policy_builder();
        if self
            .child_policy
            .as_ref()
            .is_some_and(|child| child.builder.name() != builder.name())
        {
            info!(
                "grpclb: child policy type changed to {}; recreating",
                builder.name()
            );
            self.child_policy = None;
        }
        if self.child_policy.is_none() {
            let policy = builder.build(LbPolicyOptions {
                work_scheduler: Arc::new(ChildWorkScheduler {
                    shared: self.shared.clone(),
                }),
                runtime: self.runtime.clone(),
                authority: self.authority.clone(),
            });
            info!("grpclb: created new child policy {}", builder.name());
            self.child_policy = Some(ChildPolicy { builder, policy });
        }
        let update = ResolverUpdate {
            attributes,
            endpoints,
            service_config: Ok(None),
            resolution_note,
        };
        let child_config = config.child_policy_config();
        let mut wrapped = WrappedController::new(
            channel_controller,
            self.shared.clone(),
            self.fallback_mode,
        );
        debug!("grpclb: updating child policy");
        if let Err(err) = self.child_policy.as_mut().unwrap().policy.resolver_update(
            update,
            child_config.as_ref(),
            &mut wrapped,
        ) {
            // Not propagated upstream; in fallback mode this leaves the
            // resolver unaware of the rejection.
            warn!("grpclb: child policy rejected update: {err}");
        }
        self.absorb_child_controller(wrapped);
    }

    /// Folds the side effects the child produced on a wrapped controller back
    /// into the policy.
    fn absorb_child_controller(&mut self, mut wrapped: WrappedController) {
        for (inner, wrapper) in wrapped.created_subchannels.drain(..) {
            self.subchannels
                .insert(WeakSubchannel::new(&inner), Arc::downgrade(&wrapper));
        }
        self.subchannels.retain(|_, wrapper| wrapper.strong_count() > 0);
        if let Some(state) = wrapped.picker_update.take() {
            self.handle_child_state_update(state, wrapped.channel_controller);
        }
    }

    fn handle_child_state_update(
        &mut self,
        state: LbState,
        channel_controller: &mut dyn ChannelController,
    ) {
        // Record whether the child policy reports READY.
        self.child_ready = state.connectivity_state == ConnectivityState::Ready;
        if self.child_ready && self.fallback_mode && self.fallback_exit_pending {
            info!("grpclb: child policy ready on balancer backends; exiting fallback mode");
            self.fallback_mode = false;
            self.fallback_exit_pending = false;
        }
        // Enter fallback mode if needed.
        self.maybe_enter_fallback_mode_after_startup(channel_controller);
        // The picker gets the serverlist so it can enforce drops, but only
        // when the child is READY or every entry is a drop.  Otherwise picks
        // yielding a queue result would be re-seen and each occurrence would
        // count as a separate call in the drop accounting.
        let serverlist = if state.connectivity_state == ConnectivityState::Ready
            || self
                .serverlist
                .as_ref()
                .is_some_and(|serverlist| serverlist.contains_all_drop_entries())
        {
            self.serverlist.clone()
        } else {
            None
        };
        let client_stats = self
            .balancer_call
            .as_ref()
            .and_then(|call| call.client_stats().cloned());
        debug!(
            "grpclb: publishing picker, state={} serverlist={} stats={}",
            state.connectivity_state,
            serverlist.is_some(),
            client_stats.is_some(),
        );
        channel_controller.update_picker(LbState {
            connectivity_state: state.connectivity_state,
            picker: Arc::new(DropPicker::new(serverlist, state.picker, client_stats)),
        });
    }
}

impl LbPolicy for GrpclbPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        debug!("grpclb: received update");
        let is_initial_update = self.lb_channel.is_none();
        let Some(config) = config else {
            return Err("grpclb: no policy configuration provided".into());
        };
        self.config = Some(config.convert_to::<GrpclbConfig>()?);
        if is_initial_update {
            if let Some(args) = update.attributes.get::<GrpclbArgs>() {
                self.args = args.clone();
            }
            self.subchannel_cache
                .set_interval(self.args.subchannel_cache_interval);
        }
        // Record the fallback backends and resolution note from this update.
        self.fallback_backends = update.endpoints.clone();
        self.resolution_note = update.resolution_note.clone();
        // Update the balancer channel.
        let status = self.update_balancer_channel(&update);
        // Update the existing child policy, if any.
        if self.child_policy.is_some() {
            self.create_or_update_child_policy(channel_controller);
        }
        // On the initial update, start the fallback-at-startup checks and
        // the balancer call.
        if is_initial_update {
            self.fallback_at_startup_checks_pending = true;
            self.start_fallback_timer();
            // If the balancer channel reaches TRANSIENT_FAILURE before the
            // fallback timer fires, fall back immediately.
            self.start_lb_channel_watch();
            self.start_balancer_call();
        }
        status
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let key = WeakSubchannel::new(&subchannel);
        let Some(wrapper) = self.subchannels.get(&key).and_then(|weak| weak.upgrade()) else {
            // The wrapper was already released; the connection is either
            // parked in the deletion cache or gone.  Nothing to update.
            self.subchannels.remove(&key);
            return;
        };
        let shared = self.shared.clone();
        let fallback_mode = self.fallback_mode;
        let Some(child) = self.child_policy.as_mut() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller, shared, fallback_mode);
        child
            .policy
            .subchannel_update(wrapper, state, &mut wrapped);
        self.absorb_child_controller(wrapped);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        while let Some(event) = self.shared.next_event() {
            self.handle_event(event, channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let shared = self.shared.clone();
        let fallback_mode = self.fallback_mode;
        let Some(child) = self.child_policy.as_mut() else {
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller, shared, fallback_mode);
        child.policy.exit_idle(&mut wrapped);
        self.absorb_child_controller(wrapped);
    }

    fn reset_backoff(&mut self) {
        if let Some(lb_channel) = &self.lb_channel {
            lb_channel.reset_connect_backoff();
        }
        if let Some(child) = self.child_policy.as_mut() {
            child.policy.reset_backoff();
        }
    }
}

impl GrpclbPolicy {
    fn handle_event(
        &mut self,
        event: CallbackEvent,
        channel_controller: &mut dyn ChannelController,
    ) {
        match event {
            CallbackEvent::BalancerCallEstablished { call, stream } => {
                if self.current_call() == Some(call) {
                    self.balancer_call.as_mut().unwrap().on_established(stream);
                }
            }
            CallbackEvent::InitialRequestSent { call } => {
                if self.current_call() == Some(call) {
                    let runtime = self.runtime.clone();
                    self.balancer_call
                        .as_mut()
                        .unwrap()
                        .on_initial_request_sent(&runtime);
                }
            }
            CallbackEvent::BalancerMessage { call, response } => {
                if self.current_call() == Some(call) {
                    self.on_balancer_message(response, channel_controller);
                }
            }
            CallbackEvent::BalancerCallStatus { call, status } => {
                if self.current_call() == Some(call) {
                    self.on_balancer_call_status(status, channel_controller);
                } else {
                    debug!("grpclb: status for abandoned balancer call {call}, ignoring");
                }
            }
            CallbackEvent::LoadReportTimer { call } => {
                if self.current_call() == Some(call) {
                    let runtime = self.runtime.clone();
                    self.balancer_call
                        .as_mut()
                        .unwrap()
                        .on_load_report_timer(&runtime);
                }
            }
            CallbackEvent::LoadReportSent { call, result } => {
                if self.current_call() == Some(call) {
                    let runtime = self.runtime.clone();
                    self.balancer_call
                        .as_mut()
                        .unwrap()
                        .on_load_report_sent(result, &runtime);
                }
            }
            CallbackEvent::FallbackTimer => self.on_fallback_timer(channel_controller),
            CallbackEvent::RetryTimer => self.on_retry_timer(),
            CallbackEvent::LbChannelState(state) => {
                self.on_lb_channel_state(state, channel_controller);
            }
            CallbackEvent::OrphanedSubchannel(subchannel) => {
                debug!("grpclb: caching released subchannel {subchannel}");
                self.subchannel_cache
                    .cache(subchannel, &self.runtime, &self.shared);
            }
            CallbackEvent::SubchannelCacheTimer => {
                self.subchannel_cache.on_timer(&self.runtime, &self.shared);
            }
            CallbackEvent::ChildWork => {
                let shared = self.shared.clone();
                let fallback_mode = self.fallback_mode;
                let Some(child) = self.child_policy.as_mut() else {
                    return;
                };
                let mut wrapped =
                    WrappedController::new(channel_controller, shared, fallback_mode);
                child.policy.work(&mut wrapped);
                self.absorb_child_controller(wrapped);
            }
        }
    }
}

impl Drop for GrpclbPolicy {
    fn drop(&mut self) {
        self.shared.shutdown();
        if let Some(mut call) = self.balancer_call.take() {
            call.cancel();
        }
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.cancel_fallback_timer();
        self.cancel_lb_channel_watch();
        self.subchannel_cache.shutdown();
        // Dropping the child releases its subchannel wrappers; their orphan
        // notifications are suppressed by the shutdown flag.
        self.child_policy = None;
        self.lb_channel = None;
    }
}

/// The controller handed to the child policy.  It wraps every subchannel the
/// child creates, captures the child's picker updates for post-processing,
/// and gates re-resolution requests.
struct WrappedController<'a> {
    channel_controller: &'a mut dyn ChannelController,
    shared: Arc<PolicyShared>,
    fallback_mode: bool,
    created_subchannels: Vec<(Arc<dyn Subchannel>, Arc<SubchannelWrapper>)>,
    picker_update: Option<LbState>,
}

impl<'a> WrappedController<'a> {
    fn new(
        channel_controller: &'a mut dyn ChannelController,
        shared: Arc<PolicyShared>,
        fallback_mode: bool,
    ) -> Self {
        Self {
            channel_controller,
            shared,
            fallback_mode,
            created_subchannels: vec![],
            picker_update: None,
        }
    }
}

impl ChannelController for WrappedController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let Some(arg) = address.attributes.get::<TokenAndClientStats>() else {
            panic!("grpclb: no TokenAndClientStats attribute for address {address}");
        };
        let (lb_token, client_stats) = (arg.lb_token.clone(), arg.client_stats.clone());
        let inner = self.channel_controller.new_subchannel(address);
        let wrapper = Arc::new(SubchannelWrapper::new(
            inner.clone(),
            lb_token,
            client_stats,
            self.shared.clone(),
        ));
        self.created_subchannels.push((inner, wrapper.clone()));
        wrapper
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_update = Some(update);
    }

    fn request_resolution(&mut self) {
        // If the backends came from the balancer, re-resolving is not going
        // to fix anything; only forward the request in fallback mode.
        if self.fallback_mode {
            self.channel_controller.request_resolution();
        }
    }
}
