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

//! Routing of inbound publishes to subscription handlers.
//!
//! Each matching handler runs on its own blocking task unless ordered
//! delivery is enabled, in which case every subscription gets a worker that
//! drains its messages in arrival order.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::config::{MessageHandler, MqttClientConfig};
use crate::logging::{record_traffic, Direction, Field, LogEvent, LogHandler, StructuredLogger};

const NO_MATCH_HANDLER: &str = "no match handler";

/// Hooks shared by every delivery.
struct DeliveryContext {
    pre_handler: Option<MessageHandler>,
    log_handler: Option<LogHandler>,
    message_logger: Option<Arc<dyn StructuredLogger>>,
}

impl DeliveryContext {
    fn deliver(&self, route: &Route, topic: &str, message: &str) {
        let outcome = match &self.pre_handler {
            Some(pre) => pre(topic, message).and_then(|()| (route.handler)(topic, message)),
            None => (route.handler)(topic, message),
        };

        if !route.log {
            return;
        }
        let error = outcome.err().map(|e| format!("{e:#}"));
        record_traffic(
            self.log_handler.as_ref(),
            self.message_logger.as_ref(),
            &LogEvent {
                direction: Direction::Sub,
                topic,
                message,
                error: error.as_deref(),
            },
        );
    }
}

struct Route {
    handler: MessageHandler,
    log: bool,
}

struct Inbound {
    topic: String,
    message: String,
}

/// A registered handler for one topic filter.
pub(crate) struct Subscription {
    filter: String,
    route: Arc<Route>,
    /// Worker queue when delivery is ordered.
    queue: Option<mpsc::UnboundedSender<Inbound>>,
}

impl Subscription {
    fn matches(&self, topic: &str) -> bool {
        rumqttc::mqttbytes::matches(topic, routing_filter(&self.filter))
    }
}

/// Outcome of [`Dispatcher::register`], used to undo it.
pub(crate) struct Registration {
    current: Arc<Subscription>,
    previous: Option<Arc<Subscription>>,
}

pub(crate) struct Dispatcher {
    client_id: String,
    ordered: bool,
    context: Arc<DeliveryContext>,
    subscriptions: DashMap<String, Arc<Subscription>>,
}

impl Dispatcher {
    pub(crate) fn new(config: &MqttClientConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            ordered: config.ordered_delivery,
            context: Arc::new(DeliveryContext {
                pre_handler: config.pre_handler.clone(),
                log_handler: config.log_handler.clone(),
                message_logger: config.message_logger.clone(),
            }),
            subscriptions: DashMap::new(),
        }
    }

    /// Install `handler` for `filter`, replacing any handler already
    /// registered for the same filter.
    ///
    /// Must be called from within a tokio runtime when delivery is ordered.
    pub(crate) fn register(&self, filter: &str, handler: MessageHandler, log: bool) -> Registration {
        let route = Arc::new(Route { handler, log });
        let queue = self.ordered.then(|| self.spawn_worker(filter, route.clone()));
        let current = Arc::new(Subscription {
            filter: filter.to_string(),
            route,
            queue,
        });
        let previous = self.subscriptions.insert(filter.to_string(), current.clone());
        Registration { current, previous }
    }

    /// Undo a registration, restoring the handler it replaced. Leaves the
    /// entry alone if another registration has replaced it meanwhile.
    pub(crate) fn rollback(&self, registration: Registration) {
        let Registration { current, previous } = registration;
        let filter = current.filter.clone();
        match previous {
            Some(previous) => {
                if let Some(mut entry) = self.subscriptions.get_mut(&filter) {
                    if Arc::ptr_eq(entry.value(), &current) {
                        *entry.value_mut() = previous;
                    }
                }
            }
            None => {
                self.subscriptions
                    .remove_if(&filter, |_, existing| Arc::ptr_eq(existing, &current));
            }
        }
    }

    pub(crate) fn unregister(&self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, filter: &str) -> bool {
        self.subscriptions.contains_key(filter)
    }

    /// Route one inbound publish to every subscription whose filter matches.
    pub(crate) fn dispatch(&self, topic: &str, payload: &[u8]) {
        let message = String::from_utf8_lossy(payload).into_owned();
        let targets: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().matches(topic))
            .map(|entry| entry.value().clone())
            .collect();

        if targets.is_empty() {
            debug!("[{}] No handler for topic '{topic}'", self.client_id);
            if let Some(logger) = &self.context.message_logger {
                logger.error(
                    &message,
                    &[
                        Field::new("type", Direction::Sub.as_str()),
                        Field::new("topic", topic),
                        Field::new("error", NO_MATCH_HANDLER),
                    ],
                );
            }
            return;
        }

        for subscription in targets {
            let inbound = Inbound {
                topic: topic.to_string(),
                message: message.clone(),
            };
            match &subscription.queue {
                Some(queue) => {
                    if queue.send(inbound).is_err() {
                        warn!(
                            "[{}] Delivery worker for '{}' has stopped",
                            self.client_id, subscription.filter
                        );
                    }
                }
                None => {
                    let context = self.context.clone();
                    let route = subscription.route.clone();
                    tokio::task::spawn_blocking(move || {
                        context.deliver(&route, &inbound.topic, &inbound.message);
                    });
                }
            }
        }
    }

    fn spawn_worker(&self, filter: &str, route: Arc<Route>) -> mpsc::UnboundedSender<Inbound> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
        let context = self.context.clone();
        let client_id = self.client_id.clone();
        let filter = filter.to_string();
        tokio::task::spawn_blocking(move || {
            debug!("[{client_id}] Delivery worker for '{filter}' started");
            while let Some(inbound) = rx.blocking_recv() {
                context.deliver(&route, &inbound.topic, &inbound.message);
            }
            debug!("[{client_id}] Delivery worker for '{filter}' stopped");
        });
        tx
    }
}

/// Strip the `$share/<group>/` prefix of shared subscriptions; the broker
/// delivers them on the plain topic.
fn routing_filter(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, filter)| filter)
        .unwrap_or(filter)
}
