// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-call overrides for publish and subscribe.

use rumqttc::QoS;

/// Overrides applied to a single publish or subscribe call.
///
/// By default the call is logged and uses the client's configured QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    qos: Option<QoS>,
    log: bool,
}

pub type PublishOptions = CallOptions;
pub type SubscribeOptions = CallOptions;

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = Some(qos);
        self
    }

    /// Skip the log callback and the message logger for this call.
    pub fn without_log(mut self) -> Self {
        self.log = false;
        self
    }

    pub(crate) fn effective_qos(&self, default: QoS) -> QoS {
        self.qos.unwrap_or(default)
    }

    pub(crate) fn log_enabled(&self) -> bool {
        self.log
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            qos: None,
            log: true,
        }
    }
}
