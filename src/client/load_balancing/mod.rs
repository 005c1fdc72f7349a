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

pub mod grpclb;

#[cfg(test)]
pub(crate) mod test_utils;

use std::{
    any::Any,
    collections::HashMap,
    error::Error,
    fmt::Display,
    hash::{Hash, Hasher},
    sync::{Arc, LazyLock, Mutex, Weak},
};

use tonic::{metadata::MetadataMap, Status};

use crate::{
    client::{
        name_resolution::{Address, ResolverUpdate},
        service_config::{LbConfig, ParsedJsonLbConfig},
        ConnectivityState,
    },
    rt::GrpcRuntime,
    service::Request,
};

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,

    /// The runtime which provides utilities to do async work.
    pub runtime: GrpcRuntime,

    /// The default authority of the channel, i.e. the `:authority` value used
    /// for RPCs unless overridden.
    pub authority: String,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule
    // another call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal
    /// representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.
///
/// The channel guarantees that all methods below are invoked serially; an LB
/// policy never needs a lock around its own state.  Anything asynchronous the
/// policy starts must re-enter it through the `WorkScheduler` and the `work`
/// method.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by the channel when the application asks the channel to leave
    /// the Idle state.  The default implementation does nothing.
    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {}

    /// Called by the channel to reset any connection backoff in progress so
    /// the next attempt may happen immediately.  The default implementation
    /// does nothing.
    fn reset_backoff(&mut self) {}
}

/// Controls channel behaviors.
pub trait ChannelController: Send + Sync {
    /// Creates a new subchannel in IDLE state.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.
    /// Typically used when connections fail, indicating a possible change in
    /// the overall network configuration.
    fn request_resolution(&mut self);
}

/// Represents the current state of a Subchannel.
#[derive(Clone, Default)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See Subchannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    /// Set if connectivity state is TransientFailure to describe the most
    /// recent connection error.  None for any other connectivity_state value.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last_connection_error {
            Some(err) => write!(f, "{} ({})", self.connectivity_state, err),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

/// A Subchannel represents a method of communicating with a server which may
/// be connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when connect() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on
///   error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to CONNECTING when the reconnect backoff
///   timer has expired.  This timer scales exponentially and is reset when
///   the subchannel becomes READY.
///
/// When the last reference to a Subchannel is dropped, it is disconnected,
/// and no subsequent state updates will be provided for it to the LB policy.
pub trait Subchannel: Any + Send + Sync + Display {
    /// Returns the address this subchannel connects to.
    fn address(&self) -> Address;

    /// Begins connecting the subchannel asynchronously.
    fn connect(&self);

    /// Supports downcasting to the concrete subchannel type; decorating LB
    /// policies use this to recover their wrappers from picks.
    fn as_any(&self) -> &dyn Any;
}

/// A Subchannel decorator that forwards all operations to an inner subchannel
/// unless overridden.  Types implementing this trait automatically implement
/// `Subchannel`.
pub trait ForwardingSubchannel: Send + Sync + Display {
    /// Returns the delegate to forward un-overridden operations to.
    fn delegate(&self) -> Arc<dyn Subchannel>;

    fn address(&self) -> Address {
        self.delegate().address()
    }

    fn connect(&self) {
        self.delegate().connect()
    }
}

impl<T: ForwardingSubchannel + 'static> Subchannel for T {
    fn address(&self) -> Address {
        ForwardingSubchannel::address(self)
    }

    fn connect(&self) {
        ForwardingSubchannel::connect(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A weak, pointer-identity reference to a Subchannel, usable as a map key.
///
/// Two WeakSubchannels are equal iff they reference the same subchannel
/// instance, regardless of whether that instance is still alive.
#[derive(Clone)]
pub struct WeakSubchannel(Weak<dyn Subchannel>);

impl WeakSubchannel {
    pub fn new(subchannel: &Arc<dyn Subchannel>) -> Self {
        WeakSubchannel(Arc::downgrade(subchannel))
    }

    pub fn upgrade(&self) -> Option<Arc<dyn Subchannel>> {
        self.0.upgrade()
    }
}

impl Hash for WeakSubchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0.as_ptr() as *const () as usize).hash(state);
    }
}

impl PartialEq for WeakSubchannel {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            self.0.as_ptr() as *const (),
            other.0.as_ptr() as *const (),
        )
    }
}

impl Eq for WeakSubchannel {}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns
/// Queue, the channel will queue the RPC until a new Picker is produced by
/// the LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are consulted from arbitrary request tasks, concurrently with each
/// other and with the LB policy replacing the picker, so implementations must
/// be `Send + Sync` and restrict themselves to atomic operations on shared
/// state.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue,
    /// and the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LbPolicy.
    fn pick(&self, request: &Request) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status
    /// (with the code converted to UNAVAILABLE).  If the RPC is
    /// wait-for-ready, then it will not be terminated, but instead attempted
    /// on a new picker if one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.  The channel will
    /// convert the status code to INTERNAL if it is not a valid code for the
    /// gRPC library to produce, per [gRFC A54].
    ///
    /// [gRFC A54]:
    ///     https://github.com/grpc/proposal/blob/master/A54-restrict-control-plane-status-codes.md
    Drop(Status),
}

/// The terminal disposition of a call routed by a Pick, reported to the
/// pick's `on_complete` tracker.
pub struct CallOutcome {
    /// The final status of the call.
    pub status: Status,
    /// True if the client failed to put the request onto the wire.
    pub client_failed_to_send: bool,
    /// True if a message or trailing status was received from the server.
    pub known_received: bool,
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    /// Invoked exactly once with the call's outcome once the routed call
    /// completes.  Dropped without being invoked if the call is never
    /// started.  LB policies use this to track per-call statistics.
    pub on_complete: Option<Box<dyn FnOnce(&CallOutcome) + Send + Sync>>,
    /// Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker
    /// which queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// A picker that fails all picks with the error it was built with.
pub struct FailingPicker {
    pub error: String,
}

impl Picker for FailingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Fail(Status::unavailable(self.error.clone()))
    }
}

/// A registry to store and retrieve LB policies.  LB policies are indexed by
/// their names.
pub(crate) struct LbPolicyRegistry {
    m: Mutex<HashMap<String, Arc<dyn LbPolicyBuilder>>>,
}

impl LbPolicyRegistry {
    /// Construct an empty LB policy registry.
    pub fn new() -> Self {
        Self {
            m: Mutex::default(),
        }
    }

    /// Add a LB policy into the registry.  Re-registering a name replaces the
    /// previous builder.
    pub(crate) fn add_builder(&self, builder: impl LbPolicyBuilder + 'static) {
        self.m
            .lock()
            .unwrap()
            .insert(builder.name().to_string(), Arc::new(builder));
    }

    /// Retrieve a LB policy from the registry, or None if not found.
    pub(crate) fn get_policy(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.m.lock().unwrap().get(name).cloned()
    }
}

impl Default for LbPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry used if a local registry is not provided to a channel or if
/// it does not exist in the local registry.
pub(crate) static GLOBAL_LB_REGISTRY: LazyLock<LbPolicyRegistry> =
    LazyLock::new(LbPolicyRegistry::new);
