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

use std::{error::Error, fmt, sync::Arc};

use serde::Deserialize;

use crate::client::{
    load_balancing::{LbPolicyBuilder, GLOBAL_LB_REGISTRY},
    service_config::{LbConfig, ParsedJsonLbConfig},
};

/// The parsed grpclb policy configuration.
pub(crate) struct GrpclbConfig {
    child_policy_builder: Arc<dyn LbPolicyBuilder>,
    child_policy_config: Option<LbConfig>,
    service_name: Option<String>,
}

impl GrpclbConfig {
    pub(crate) fn child_policy_builder(&self) -> Arc<dyn LbPolicyBuilder> {
        self.child_policy_builder.clone()
    }

    pub(crate) fn child_policy_config(&self) -> Option<LbConfig> {
        self.child_policy_config.clone()
    }

    /// The service name to send to the balancer, if one was configured.  An
    /// empty string counts as unset, in which case the channel authority is
    /// used instead.
    pub(crate) fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref().filter(|name| !name.is_empty())
    }
}

impl fmt::Debug for GrpclbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpclbConfig")
            .field("child_policy", &self.child_policy_builder.name())
            .field("service_name", &self.service_name)
            .finish()
    }
}

// The JSON shape:
// { "childPolicy": [ { "<name>": <config> }, ... ]?, "serviceName": "..."? }
//
// Unknown fields are rejected.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GrpclbConfigJson {
    child_policy: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    service_name: Option<String>,
}

/// Parses the grpclb JSON configuration.  The child policy is the first
/// `childPolicy` entry whose name is registered; when the field is absent,
/// `round_robin` is used.
pub(crate) fn parse_config(
    config: &ParsedJsonLbConfig,
) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
    let json: GrpclbConfigJson = config
        .convert_to()
        .map_err(|err| format!("errors validating grpclb LB policy config: {err}"))?;
    let entries = json.child_policy.unwrap_or_else(|| {
        let mut round_robin = serde_json::Map::new();
        round_robin.insert(
            "round_robin".to_string(),
            serde_json::Value::Object(serde_json::Map::new()),
        );
        vec![round_robin]
    });
    for entry in &entries {
        if entry.len() != 1 {
            return Err(format!(
                "each childPolicy entry must contain exactly one policy, found {}",
                entry.len()
            )
            .into());
        }
        let (name, child_json) = entry.iter().next().unwrap();
        let Some(builder) = GLOBAL_LB_REGISTRY.get_policy(name) else {
            // Skip unregistered policies; the first registered one wins.
            continue;
        };
        let child_policy_config = builder
            .parse_config(&ParsedJsonLbConfig::from_value(child_json.clone()))
            .map_err(|err| format!("failed to parse childPolicy config for {name}: {err}"))?;
        return Ok(Some(LbConfig::new(GrpclbConfig {
            child_policy_builder: builder,
            child_policy_config,
            service_name: json.service_name,
        })));
    }
    Err("no registered LB policy found in childPolicy".into())
}
