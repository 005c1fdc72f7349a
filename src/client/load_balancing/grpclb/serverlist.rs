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
    fmt::Write,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tracing::error;

use crate::{
    byte_str::ByteStr,
    client::name_resolution::{Address, Endpoint, TCP_IP_NETWORK_TYPE},
};

use super::{client_stats::ClientStats, load_balancer_api::GrpclbServer, TokenAndClientStats};

/// One serverlist received from the balancer.
///
/// The entry list is immutable; the only mutable piece is the drop cursor,
/// which the picker advances from arbitrary request tasks.  Equality is
/// positional over the entries and ignores the cursor.
#[derive(Debug, Default)]
pub(crate) struct Serverlist {
    servers: Vec<GrpclbServer>,
    // Advanced on every pick; drop decisions are made modulo the full entry
    // list, including invalid entries.
    drop_index: AtomicUsize,
}

impl PartialEq for Serverlist {
    fn eq(&self, other: &Self) -> bool {
        self.servers == other.servers
    }
}

impl Eq for Serverlist {}

/// Reports whether the entry describes a usable backend address.  Invalid
/// entries are skipped during address extraction but still occupy a slot in
/// the drop cursor's rotation.
fn is_valid_server(server: &GrpclbServer, idx: usize, log: bool) -> bool {
    if server.drop {
        return false;
    }
    if server.port >> 16 != 0 {
        if log {
            error!(
                "Invalid port '{}' at index {idx} of serverlist. Ignoring.",
                server.port
            );
        }
        return false;
    }
    let ip_size = server.ip_address.len();
    if ip_size != 4 && ip_size != 16 {
        if log {
            error!(
                "Expected IP to be 4 or 16 bytes, got {ip_size} at index {idx} of serverlist. \
                 Ignoring."
            );
        }
        return false;
    }
    true
}

/// Converts a valid non-drop entry into a socket address.
fn parse_server(server: &GrpclbServer) -> SocketAddr {
    let ip = match *server.ip_address {
        [a, b, c, d] => IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
        _ => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&server.ip_address);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    SocketAddr::new(ip, server.port as u16)
}

impl Serverlist {
    pub(crate) fn new(servers: Vec<GrpclbServer>) -> Self {
        Self {
            servers,
            drop_index: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns a text representation suitable for logging.
    pub(crate) fn as_text(&self) -> String {
        let mut text = String::new();
        for (idx, server) in self.servers.iter().enumerate() {
            let ipport = if server.drop {
                "(drop)".to_string()
            } else if is_valid_server(server, idx, false) {
                parse_server(server).to_string()
            } else {
                "(invalid)".to_string()
            };
            let _ = writeln!(
                text,
                "  {idx}: {ipport} token={}",
                server.load_balance_token
            );
        }
        text
    }

    /// Extracts the valid non-drop entries as endpoints for the child policy.
    /// Each address carries its LB token and a reference to the stats object
    /// (if load reporting is enabled) for the pick path to consume.
    pub(crate) fn backend_endpoints(&self, client_stats: Option<&Arc<ClientStats>>) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        for (idx, server) in self.servers.iter().enumerate() {
            if !is_valid_server(server, idx, true) {
                continue;
            }
            let addr = parse_server(server);
            if server.load_balance_token.is_empty() {
                tracing::info!(
                    "Missing LB token for backend address '{addr}'. The empty token will be used \
                     instead"
                );
            }
            let address = Address {
                network_type: TCP_IP_NETWORK_TYPE,
                address: addr.to_string().into(),
                attributes: crate::attributes::Attributes::new().add(TokenAndClientStats {
                    lb_token: server.load_balance_token.clone(),
                    client_stats: client_stats.cloned(),
                }),
            };
            endpoints.push(Endpoint {
                addresses: vec![address],
                ..Default::default()
            });
        }
        endpoints
    }

    /// Returns true if the serverlist contains at least one drop entry and no
    /// backend address entries.
    pub(crate) fn contains_all_drop_entries(&self) -> bool {
        if self.servers.is_empty() {
            return false;
        }
        self.servers.iter().all(|server| server.drop)
    }

    /// Returns the LB token to count a drop against, or None if the call
    /// should not be dropped.
    ///
    /// Note: this is called from the picker, not from the policy's serialized
    /// context.
    pub(crate) fn should_drop(&self) -> Option<&ByteStr> {
        if self.servers.is_empty() {
            return None;
        }
        let index = self.drop_index.fetch_add(1, Ordering::Relaxed);
        let server = &self.servers[index % self.servers.len()];
        server.drop.then_some(&server.load_balance_token)
    }
}
