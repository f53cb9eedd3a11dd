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

//! The client facade: one broker connection plus logged publish/subscribe.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::MqttClientConfig;
use crate::connection::{Connection, RumqttConnection};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::logging::{record_traffic, Direction, LogEvent};
use crate::options::{PublishOptions, SubscribeOptions};
use crate::payload::IntoPayload;

/// How long [`MqttClient::disconnect`] lets pending work flush.
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Connected MQTT client.
///
/// Cheap to clone; clones share the same connection and subscriptions.
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: MqttClientConfig,
    connection: Arc<dyn Connection>,
    dispatcher: Arc<Dispatcher>,
}

impl MqttClient {
    /// Validate `config`, open the connection and wait for the broker to
    /// accept it.
    ///
    /// Missing credentials or client id are reported before any network
    /// activity. Must be called from within a tokio runtime.
    pub async fn connect(config: MqttClientConfig) -> Result<Self> {
        let address = config.validate()?;
        info!(
            "[{}] Connecting to MQTT broker at {}:{}",
            config.client_id, address.host, address.port
        );

        let dispatcher = Arc::new(Dispatcher::new(&config));
        let connection = RumqttConnection::open(&config, &address, dispatcher.clone()).await?;
        Ok(Self::with_connection(config, Arc::new(connection), dispatcher))
    }

    pub(crate) fn with_connection(
        config: MqttClientConfig,
        connection: Arc<dyn Connection>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                connection,
                dispatcher,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &MqttClientConfig {
        &self.inner.config
    }

    /// Publish with the configured QoS and logging enabled.
    pub async fn publish<P: IntoPayload>(&self, topic: &str, payload: P) -> Result<()> {
        self.publish_with(topic, payload, PublishOptions::default()).await
    }

    /// Publish `payload` to `topic`, never retained.
    ///
    /// Resolves once the broker link reports delivery for the effective QoS.
    /// When logging is enabled the outcome is reported to the log callback and
    /// the message logger, including serialization failures.
    pub async fn publish_with<P: IntoPayload>(
        &self,
        topic: &str,
        payload: P,
        options: PublishOptions,
    ) -> Result<()> {
        let config = &self.inner.config;
        let qos = options.effective_qos(config.qos);

        let (message, result) = match payload.into_payload() {
            Ok(bytes) => {
                let message = if options.log_enabled() {
                    String::from_utf8_lossy(&bytes).into_owned()
                } else {
                    String::new()
                };
                let result = self.inner.connection.publish(topic, qos, false, bytes).await;
                (message, result)
            }
            Err(e) => (String::new(), Err(e)),
        };

        if let Err(e) = &result {
            debug!("[{}] Publish to '{topic}' failed: {e}", config.client_id);
        }

        if options.log_enabled() {
            let error = result.as_ref().err().map(|e| format!("{e:#}"));
            record_traffic(
                config.log_handler.as_ref(),
                config.message_logger.as_ref(),
                &LogEvent {
                    direction: Direction::Pub,
                    topic,
                    message: &message,
                    error: error.as_deref(),
                },
            );
        }

        result
    }

    /// Subscribe with the configured QoS and logging enabled.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<()>
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with(topic, handler, SubscribeOptions::default()).await
    }

    /// Route messages matching `topic` to `handler`.
    ///
    /// `topic` may contain `+` and `#` wildcards; the handler receives the
    /// concrete topic of each message. Resolves once the broker acknowledged
    /// the subscription. If it refuses, the handler is removed again and any
    /// handler previously registered for `topic` is restored.
    pub async fn subscribe_with<F>(
        &self,
        topic: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> Result<()>
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let client_id = &self.inner.config.client_id;
        let qos = options.effective_qos(self.inner.config.qos);

        let registration =
            self.inner
                .dispatcher
                .register(topic, Arc::new(handler), options.log_enabled());

        if let Err(e) = self.inner.connection.subscribe(topic, qos).await {
            warn!("[{client_id}] Subscription to '{topic}' failed: {e}");
            self.inner.dispatcher.rollback(registration);
            return Err(e);
        }

        info!("[{client_id}] Subscribed to '{topic}' with {qos:?}");
        Ok(())
    }

    /// Stop receiving messages for `topic`. The handler stays installed
    /// until the broker acknowledges.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.inner.connection.unsubscribe(topic).await?;
        if !self.inner.dispatcher.unregister(topic) {
            debug!(
                "[{}] Unsubscribed from '{topic}' without a local handler",
                self.inner.config.client_id
            );
        }
        info!("[{}] Unsubscribed from '{topic}'", self.inner.config.client_id);
        Ok(())
    }

    /// Close the connection, waiting up to [`DISCONNECT_GRACE`] for pending
    /// work.
    pub async fn disconnect(&self) {
        self.inner.connection.disconnect(DISCONNECT_GRACE).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::Level;
    use rumqttc::QoS;
    use serde::Serialize;

    use super::*;
    use crate::config::MqttClientConfigBuilder;
    use crate::error::Error;
    use crate::logging::StructuredLogger;
    use crate::payload::Json;
    use crate::testing::{eventually, MemoryLogger, MockConnection, Published};

    struct Harness {
        client: MqttClient,
        connection: Arc<MockConnection>,
        messages: Arc<MemoryLogger>,
        events: Arc<Mutex<Vec<String>>>,
    }

    fn builder() -> MqttClientConfigBuilder {
        MqttClientConfig::builder("localhost:1883", "user", "secret", "test-client")
    }

    fn harness(builder: MqttClientConfigBuilder) -> Harness {
        let messages = Arc::new(MemoryLogger::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let logger: Arc<dyn StructuredLogger> = messages.clone();
        let config = builder
            .message_logger(logger)
            .log_handler(move |event: &LogEvent<'_>| {
                sink.lock().unwrap().push(format!(
                    "{}|{}|{}|{}",
                    event.direction,
                    event.topic,
                    event.message,
                    event.error.unwrap_or("-")
                ));
            })
            .build();

        let connection = Arc::new(MockConnection::default());
        let dispatcher = Arc::new(Dispatcher::new(&config));
        let client = MqttClient::with_connection(config, connection.clone(), dispatcher);
        Harness {
            client,
            connection,
            messages,
            events,
        }
    }

    fn dispatcher(client: &MqttClient) -> &Dispatcher {
        &client.inner.dispatcher
    }

    #[tokio::test]
    async fn test_empty_password_fails_before_connecting() {
        let config = MqttClientConfig::builder("127.0.0.1:1", "user", "", "test-client").build();
        match MqttClient::connect(config).await {
            Err(Error::MissingField(field)) => assert_eq!(field, "password"),
            Err(e) => panic!("expected missing password, got {e}"),
            Ok(_) => panic!("connect must fail"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connect_error() {
        let lifecycle = Arc::new(MemoryLogger::default());
        let logger: Arc<dyn StructuredLogger> = lifecycle.clone();
        let config = MqttClientConfig::builder("127.0.0.1:1", "user", "secret", "test-client")
            .client_logger(logger)
            .build();

        let result = MqttClient::connect(config).await;

        assert!(matches!(result, Err(Error::Connect(_))));
        let entries = lifecycle.entries();
        assert_eq!(entries[0].message, "ConnectionAttempt");
        assert_eq!(entries[0].field("type"), Some("handler"));
        assert!(entries.iter().all(|e| e.message != "OnConnect"));
    }

    #[tokio::test]
    async fn test_publish_hello_logs_once_and_sends_bytes() {
        let h = harness(builder());

        h.client.publish("a/b", "hello").await.unwrap();

        assert_eq!(
            h.connection.published(),
            vec![Published {
                topic: "a/b".to_string(),
                qos: QoS::AtMostOnce,
                retain: false,
                payload: b"hello".to_vec(),
            }]
        );
        let entries = h.messages.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, Level::Info);
        assert_eq!(entries[0].message, "hello");
        assert_eq!(entries[0].field("type"), Some("pub"));
        assert_eq!(entries[0].field("topic"), Some("a/b"));
        assert_eq!(entries[0].field("error"), None);
        assert_eq!(h.events.lock().unwrap().as_slice(), ["pub|a/b|hello|-"]);
    }

    #[tokio::test]
    async fn test_publish_structured_payload_as_json() {
        #[derive(Serialize)]
        struct Reading {
            id: u32,
            value: f64,
        }

        let h = harness(builder());
        h.client
            .publish("sensors/1", Json(Reading { id: 1, value: 20.5 }))
            .await
            .unwrap();

        let published = h.connection.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, br#"{"id":1,"value":20.5}"#.to_vec());
        assert_eq!(h.messages.entries()[0].message, r#"{"id":1,"value":20.5}"#);
    }

    #[tokio::test]
    async fn test_serialization_failure_is_logged_and_not_sent() {
        let h = harness(builder());
        let mut unrepresentable = HashMap::new();
        unrepresentable.insert((1, 2), "tuple keys are not JSON");

        let result = h.client.publish("a/b", Json(&unrepresentable)).await;

        assert!(matches!(result, Err(Error::Serialization(_))));
        assert!(h.connection.published().is_empty());
        let entries = h.messages.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "");
        assert_eq!(entries[0].field("type"), Some("pub"));
        assert!(entries[0]
            .field("error")
            .is_some_and(|e| e.starts_with("payload serialization failed")));
        assert_eq!(h.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_logged_once_with_error() {
        let h = harness(builder().qos(QoS::AtLeastOnce));
        h.connection.close();

        let result = h.client.publish("a/b", "lost").await;

        assert!(matches!(result, Err(Error::ConnectionClosed)));
        let entries = h.messages.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "lost");
        assert_eq!(entries[0].field("type"), Some("pub"));
        assert_eq!(
            entries[0].field("error"),
            Some("connection closed before acknowledgement")
        );
        assert_eq!(
            h.events.lock().unwrap().as_slice(),
            ["pub|a/b|lost|connection closed before acknowledgement"]
        );
    }

    #[tokio::test]
    async fn test_suppressed_publish_log() {
        let h = harness(builder());

        h.client
            .publish_with("a/b", "quiet", PublishOptions::new().without_log())
            .await
            .unwrap();

        assert_eq!(h.connection.published().len(), 1);
        assert!(h.messages.entries().is_empty());
        assert!(h.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_qos_override_and_default() {
        let h = harness(builder().qos(QoS::AtLeastOnce));

        h.client.publish("a", vec![1u8, 2, 3]).await.unwrap();
        h.client
            .publish_with("b", &b"raw"[..], PublishOptions::new().qos(QoS::ExactlyOnce))
            .await
            .unwrap();

        let published = h.connection.published();
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        assert_eq!(published[0].payload, vec![1, 2, 3]);
        assert_eq!(published[1].qos, QoS::ExactlyOnce);
        assert!(published.iter().all(|p| !p.retain));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_concrete_topic() {
        let h = harness(builder().qos(QoS::AtLeastOnce));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        h.client
            .subscribe("gateway/+/read", move |topic: &str, message: &str| -> anyhow::Result<()> {
                sink.lock()
                    .unwrap()
                    .push((topic.to_string(), message.to_string()));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(
            h.connection.subscribed.lock().unwrap().as_slice(),
            [("gateway/+/read".to_string(), QoS::AtLeastOnce)]
        );

        dispatcher(&h.client).dispatch("gateway/42/read", b"21.5");
        eventually(|| received.lock().unwrap().len() == 1).await;
        assert_eq!(
            received.lock().unwrap()[0],
            ("gateway/42/read".to_string(), "21.5".to_string())
        );

        eventually(|| h.messages.entries().len() == 1).await;
        let entries = h.messages.entries();
        let entry = &entries[0];
        assert_eq!(entry.field("type"), Some("sub"));
        assert_eq!(entry.field("topic"), Some("gateway/42/read"));
    }

    #[tokio::test]
    async fn test_failing_handler_is_logged_with_error() {
        let h = harness(builder());
        h.client
            .subscribe("jobs/#", |_: &str, _: &str| -> anyhow::Result<()> {
                anyhow::bail!("cannot parse job")
            })
            .await
            .unwrap();

        dispatcher(&h.client).dispatch("jobs/7", b"{");

        eventually(|| h.messages.entries().len() == 1).await;
        assert_eq!(h.messages.entries()[0].field("error"), Some("cannot parse job"));
        assert_eq!(h.events.lock().unwrap().as_slice(), ["sub|jobs/7|{|cannot parse job"]);
    }

    #[tokio::test]
    async fn test_rejected_subscription_leaves_no_handler() {
        let h = harness(builder());
        h.connection.reject("forbidden/#");

        let result = h
            .client
            .subscribe("forbidden/#", |_: &str, _: &str| -> anyhow::Result<()> { Ok(()) })
            .await;

        assert!(matches!(result, Err(Error::SubscribeRejected(_))));
        assert!(!dispatcher(&h.client).is_registered("forbidden/#"));
    }

    #[tokio::test]
    async fn test_rejected_resubscription_restores_previous_handler() {
        let h = harness(builder());
        let hits = Arc::new(Mutex::new(Vec::new()));

        let first = hits.clone();
        h.client
            .subscribe("t", move |_: &str, _: &str| -> anyhow::Result<()> {
                first.lock().unwrap().push("first");
                Ok(())
            })
            .await
            .unwrap();

        h.connection.reject("t");
        let second = hits.clone();
        let result = h
            .client
            .subscribe("t", move |_: &str, _: &str| -> anyhow::Result<()> {
                second.lock().unwrap().push("second");
                Ok(())
            })
            .await;
        assert!(result.is_err());

        dispatcher(&h.client).dispatch("t", b"x");
        eventually(|| hits.lock().unwrap().len() == 1).await;
        assert_eq!(hits.lock().unwrap().as_slice(), ["first"]);
    }

    #[tokio::test]
    async fn test_subscribe_options() {
        let h = harness(builder());
        h.client
            .subscribe_with(
                "quiet/#",
                |_: &str, _: &str| -> anyhow::Result<()> { Ok(()) },
                SubscribeOptions::new().qos(QoS::ExactlyOnce).without_log(),
            )
            .await
            .unwrap();

        assert_eq!(
            h.connection.subscribed.lock().unwrap()[0],
            ("quiet/#".to_string(), QoS::ExactlyOnce)
        );

        dispatcher(&h.client).dispatch("quiet/1", b"x");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.messages.entries().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_handler() {
        let h = harness(builder());
        h.client
            .subscribe("a/#", |_: &str, _: &str| -> anyhow::Result<()> { Ok(()) })
            .await
            .unwrap();

        h.client.unsubscribe("a/#").await.unwrap();

        assert_eq!(h.connection.unsubscribed.lock().unwrap().as_slice(), ["a/#"]);
        assert!(!dispatcher(&h.client).is_registered("a/#"));
    }

    #[tokio::test]
    async fn test_disconnect_delegates_to_connection() {
        let h = harness(builder());
        let clone = h.client.clone();

        clone.disconnect().await;

        assert_eq!(*h.connection.disconnects.lock().unwrap(), 1);
        assert_eq!(h.client.client_id(), "test-client");
    }
}
