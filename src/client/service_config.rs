/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::any::Any;
use std::error::Error;
use std::sync::Arc;

use serde::de::DeserializeOwned;

/// An in-memory representation of a service config, usually provided to gRPC
/// as a JSON object.
#[derive(Debug, Default, Clone)]
pub(crate) struct ServiceConfig;

/// A convenience wrapper for an LB policy's configuration object, produced by
/// `LbPolicyBuilder::parse_config` and delivered back to the policy on every
/// resolver update.
#[derive(Debug, Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Convenience method to extract the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(
        &self,
    ) -> Result<Arc<T>, Box<dyn Error + Send + Sync>> {
        self.config
            .clone()
            .downcast::<T>()
            .map_err(|_| "LB config does not hold the requested type".into())
    }
}

/// The JSON form of an LB policy's configuration, before the policy's builder
/// has validated it.
#[derive(Debug, Clone)]
pub struct ParsedJsonLbConfig {
    pub value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    /// Parses the provided JSON text.
    pub fn new(json: &str) -> Result<Self, String> {
        match serde_json::from_str(json) {
            Ok(value) => Ok(ParsedJsonLbConfig { value }),
            Err(err) => Err(format!("failed to parse LB config JSON: {err}")),
        }
    }

    /// Wraps an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Self {
        ParsedJsonLbConfig { value }
    }

    /// Deserializes the JSON into the policy's typed configuration.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, Box<dyn Error + Send + Sync>> {
        serde_json::from_value(self.value.clone()).map_err(|err| err.to_string().into())
    }
}
