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

//! Broker connection backed by `rumqttc`.
//!
//! `rumqttc` only queues requests; the event loop has to be polled for them
//! to reach the broker. [`RumqttConnection`] spawns that driver, reports
//! lifecycle events, feeds inbound publishes to the dispatcher and matches
//! broker acknowledgements back to the waiting caller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, SubAck,
    SubscribeReasonCode,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{BrokerAddress, MqttClientConfig};
use crate::diagnostics::Diagnostics;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::logging::{Field, StructuredLogger};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Primitive broker operations used by [`MqttClient`](crate::MqttClient).
///
/// Every call resolves once the broker has acknowledged the request.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Close the connection, letting queued work flush for up to `grace`.
    async fn disconnect(&self, grace: Duration);
}

type Waiter = oneshot::Sender<Result<()>>;

struct PendingPublish {
    waiter: Waiter,
    /// PUBREC seen; only the PUBREL is retransmitted from here on.
    received: bool,
}

#[derive(Default)]
struct AckState {
    /// Requests handed to the client but not yet written by the event loop,
    /// in submission order.
    publishes: VecDeque<(QoS, Waiter)>,
    subscribes: VecDeque<(String, Waiter)>,
    unsubscribes: VecDeque<Waiter>,

    // Written requests awaiting acknowledgement. Packet ids are shared by all
    // request kinds, so each kind has its own map.
    /// A publish released after a collision queues behind the one still
    /// holding its id.
    publishes_inflight: HashMap<u16, VecDeque<PendingPublish>>,
    subscribes_inflight: HashMap<u16, (String, Waiter)>,
    unsubscribes_inflight: HashMap<u16, Waiter>,

    /// Publish held back by the event loop until its id is acknowledged.
    collided: Option<(u16, Waiter)>,
    /// Ids the event loop retransmits after reconnecting.
    replays: HashSet<u16>,
}

impl AckState {
    fn track_publish(&mut self, pkid: u16, waiter: Waiter) {
        self.publishes_inflight
            .entry(pkid)
            .or_default()
            .push_back(PendingPublish {
                waiter,
                received: false,
            });
    }
}

/// Pairs outgoing requests with broker acknowledgements.
///
/// The event loop writes requests in the order they were queued, so each
/// `Outgoing` event belongs to the oldest waiter of its kind. From then on
/// the packet id identifies it.
#[derive(Default)]
struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expect_publish(&self, qos: QoS) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.lock().publishes.push_back((qos, tx));
        rx
    }

    fn expect_subscribe(&self, filter: &str) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.lock().subscribes.push_back((filter.to_string(), tx));
        rx
    }

    fn expect_unsubscribe(&self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.lock().unsubscribes.push_back(tx);
        rx
    }

    // The cancel_* methods drop the newest waiter after the client refused
    // to queue its request. Callers hold the send lock across expect/cancel.
    fn cancel_publish(&self) {
        self.lock().publishes.pop_back();
    }

    fn cancel_subscribe(&self) {
        self.lock().subscribes.pop_back();
    }

    fn cancel_unsubscribe(&self) {
        self.lock().unsubscribes.pop_back();
    }

    fn publish_written(&self, pkid: u16) {
        let mut state = self.lock();
        if pkid != 0 && state.replays.remove(&pkid) {
            return;
        }
        // Retransmissions are written before anything new.
        state.replays.clear();

        if matches!(state.collided, Some((held, _)) if held == pkid) {
            if let Some((_, waiter)) = state.collided.take() {
                state.track_publish(pkid, waiter);
            }
            return;
        }

        match state.publishes.pop_front() {
            Some((QoS::AtMostOnce, waiter)) => {
                let _ = waiter.send(Ok(()));
            }
            Some((_, waiter)) => state.track_publish(pkid, waiter),
            None => {}
        }
    }

    /// The next publish got an id that is still unacknowledged; the event
    /// loop holds it back and writes it once that id is released.
    fn publish_collided(&self, pkid: u16) {
        let mut state = self.lock();
        state.replays.clear();
        if let Some((_, waiter)) = state.publishes.pop_front() {
            // The event loop keeps a single held publish; a replaced one is
            // never written and its caller sees ConnectionClosed.
            state.collided = Some((pkid, waiter));
        }
    }

    fn publish_received(&self, pkid: u16) {
        if let Some(front) = self
            .lock()
            .publishes_inflight
            .get_mut(&pkid)
            .and_then(|queue| queue.front_mut())
        {
            front.received = true;
        }
    }

    /// PUBACK for QoS 1, PUBCOMP for QoS 2.
    fn publish_acknowledged(&self, pkid: u16) {
        let mut state = self.lock();
        let Some(queue) = state.publishes_inflight.get_mut(&pkid) else {
            return;
        };
        let done = queue.pop_front();
        if queue.is_empty() {
            state.publishes_inflight.remove(&pkid);
        }
        if let Some(done) = done {
            let _ = done.waiter.send(Ok(()));
        }
    }

    fn subscribe_written(&self, pkid: u16) {
        let mut state = self.lock();
        state.replays.clear();
        if let Some(entry) = state.subscribes.pop_front() {
            state.subscribes_inflight.insert(pkid, entry);
        }
    }

    fn subscribe_acknowledged(&self, ack: &SubAck) {
        let Some((filter, waiter)) = self.lock().subscribes_inflight.remove(&ack.pkid) else {
            return;
        };
        let rejected = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let outcome = if rejected {
            Err(Error::SubscribeRejected(filter))
        } else {
            Ok(())
        };
        let _ = waiter.send(outcome);
    }

    fn unsubscribe_written(&self, pkid: u16) {
        let mut state = self.lock();
        state.replays.clear();
        if let Some(waiter) = state.unsubscribes.pop_front() {
            state.unsubscribes_inflight.insert(pkid, waiter);
        }
    }

    fn unsubscribe_acknowledged(&self, pkid: u16) {
        if let Some(waiter) = self.lock().unsubscribes_inflight.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// The network link dropped. Written SUBSCRIBE/UNSUBSCRIBE packets are
    /// not retransmitted, so their callers fail. Unacknowledged publishes
    /// are rewritten with the same id after reconnecting. Requests not yet
    /// written stay queued; the event loop sends them in order later.
    fn connection_lost(&self) {
        let mut state = self.lock();
        for (_, (_, waiter)) in state.subscribes_inflight.drain() {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
        for (_, waiter) in state.unsubscribes_inflight.drain() {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
        state.replays = state
            .publishes_inflight
            .iter()
            .filter(|(_, queue)| queue.front().is_some_and(|p| !p.received))
            .map(|(pkid, _)| *pkid)
            .collect();
    }

    /// Drop every waiter; their callers observe [`Error::ConnectionClosed`].
    fn clear(&self) {
        *self.lock() = AckState::default();
    }
}

async fn await_ack(ack: oneshot::Receiver<Result<()>>) -> Result<()> {
    ack.await.unwrap_or(Err(Error::ConnectionClosed))
}

/// Lifecycle entries on the client logger, tagged `type=handler`.
struct Lifecycle {
    logger: Option<Arc<dyn StructuredLogger>>,
}

impl Lifecycle {
    fn emit(&self, event: &str) {
        if let Some(logger) = &self.logger {
            logger.info(event, &[Field::new("type", "handler")]);
        }
    }
}

type Ready = oneshot::Sender<std::result::Result<(), String>>;

/// Connection state as observed through event loop results.
struct Session {
    client_id: String,
    acks: Arc<AckTracker>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Lifecycle,
    diagnostics: Diagnostics,
    /// Resolved by the outcome of the first handshake.
    ready: Option<Ready>,
    connected: bool,
    attempting: bool,
    ever_connected: bool,
}

impl Session {
    fn new(
        config: &MqttClientConfig,
        acks: Arc<AckTracker>,
        dispatcher: Arc<Dispatcher>,
        ready: Ready,
    ) -> Self {
        Self {
            client_id: config.client_id.clone(),
            acks,
            dispatcher,
            lifecycle: Lifecycle {
                logger: config.client_logger.clone(),
            },
            diagnostics: Diagnostics::new(config.client_logger.clone(), config.debug),
            ready: Some(ready),
            connected: false,
            attempting: false,
            ever_connected: false,
        }
    }

    /// Called before each poll; logs the start of a connection attempt.
    fn begin_attempt(&mut self) {
        if self.connected || self.attempting {
            return;
        }
        if self.ever_connected {
            self.lifecycle.emit("Reconnecting");
        }
        self.lifecycle.emit("ConnectionAttempt");
        self.attempting = true;
    }

    /// Returns `false` once the event loop should stop.
    fn handle_event(&mut self, event: Event) -> bool {
        if self.diagnostics.debug_enabled() {
            self.diagnostics.debug.printf(format_args!("{event:?}"));
        }

        match event {
            Event::Incoming(Incoming::ConnAck(_)) => {
                self.connected = true;
                self.attempting = false;
                self.ever_connected = true;
                self.lifecycle.emit("OnConnect");
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Event::Incoming(Incoming::Publish(publish)) => {
                self.dispatcher.dispatch(&publish.topic, &publish.payload);
            }
            Event::Incoming(Incoming::PubAck(ack)) => self.acks.publish_acknowledged(ack.pkid),
            Event::Incoming(Incoming::PubRec(rec)) => self.acks.publish_received(rec.pkid),
            Event::Incoming(Incoming::PubComp(comp)) => self.acks.publish_acknowledged(comp.pkid),
            Event::Incoming(Incoming::SubAck(ack)) => self.acks.subscribe_acknowledged(&ack),
            Event::Incoming(Incoming::UnsubAck(ack)) => self.acks.unsubscribe_acknowledged(ack.pkid),
            Event::Incoming(Incoming::Disconnect) => {
                warn!("[{}] Disconnected by broker", self.client_id);
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.acks.publish_written(pkid),
            Event::Outgoing(Outgoing::AwaitAck(pkid)) => self.acks.publish_collided(pkid),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => self.acks.subscribe_written(pkid),
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => self.acks.unsubscribe_written(pkid),
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("[{}] DISCONNECT sent", self.client_id);
                return false;
            }
            _ => {} // Pings, PUBREL and acks we send are handled by rumqttc.
        }
        true
    }

    /// Returns `false` once the event loop should stop, `true` to retry
    /// after [`RECONNECT_DELAY`].
    fn handle_error(&mut self, e: &ConnectionError) -> bool {
        self.attempting = false;

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(e.to_string()));
            return false;
        }

        if self.connected {
            self.connected = false;
            self.acks.connection_lost();
            self.lifecycle.emit("ConnectionLost");
            self.diagnostics.error.printf(format_args!("connection lost: {e}"));
        } else {
            self.diagnostics.error.printf(format_args!("connection attempt failed: {e}"));
        }

        if matches!(e, ConnectionError::RequestsDone) {
            self.diagnostics.critical.println("request channel closed, stopping event loop");
            return false;
        }

        warn!("[{}] MQTT eventloop error (will reconnect): {e}", self.client_id);
        self.diagnostics
            .warn
            .printf(format_args!("reconnecting in {}s", RECONNECT_DELAY.as_secs()));
        true
    }
}

/// Polls the event loop for the lifetime of the connection.
struct Driver {
    eventloop: EventLoop,
    session: Session,
}

impl Driver {
    async fn run(mut self) {
        let client_id = self.session.client_id.clone();
        info!("[{client_id}] MQTT event loop started");
        loop {
            self.session.begin_attempt();
            match self.eventloop.poll().await {
                Ok(event) => {
                    if !self.session.handle_event(event) {
                        break;
                    }
                }
                Err(e) => {
                    if !self.session.handle_error(&e) {
                        break;
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
        self.session.acks.clear();
        info!("[{client_id}] MQTT event loop stopped");
    }
}

/// [`Connection`] over a `rumqttc` client and its spawned event loop.
pub struct RumqttConnection {
    client_id: String,
    client: AsyncClient,
    acks: Arc<AckTracker>,
    /// Keeps the order of queued requests and tracked waiters identical.
    send_lock: tokio::sync::Mutex<()>,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RumqttConnection {
    /// Start the event loop and wait for the broker's CONNACK.
    pub(crate) async fn open(
        config: &MqttClientConfig,
        address: &BrokerAddress,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let mut mqtt_opts = MqttOptions::new(&config.client_id, &address.host, address.port);
        mqtt_opts.set_credentials(&config.username, &config.password);
        mqtt_opts.set_clean_session(config.clean_session);
        mqtt_opts.set_keep_alive(config.keep_alive.max(MIN_KEEP_ALIVE));

        let (client, eventloop) = AsyncClient::new(mqtt_opts, config.request_capacity);
        let acks = Arc::new(AckTracker::default());
        let (ready_tx, ready_rx) = oneshot::channel();

        let driver = Driver {
            eventloop,
            session: Session::new(config, acks.clone(), dispatcher, ready_tx),
        };
        let handle = tokio::spawn(driver.run());

        let handshake = ready_rx
            .await
            .unwrap_or_else(|_| Err("event loop stopped before CONNACK".to_string()));
        if let Err(reason) = handshake {
            handle.abort();
            error!(
                "[{}] MQTT connect to {}:{} failed: {reason}",
                config.client_id, address.host, address.port
            );
            return Err(Error::Connect(reason));
        }

        info!(
            "[{}] MQTT connected to {}:{}",
            config.client_id, address.host, address.port
        );
        Ok(Self {
            client_id: config.client_id.clone(),
            client,
            acks,
            send_lock: tokio::sync::Mutex::new(()),
            driver: tokio::sync::Mutex::new(Some(handle)),
        })
    }
}

#[async_trait]
impl Connection for RumqttConnection {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        let ack = {
            let _order = self.send_lock.lock().await;
            let ack = self.acks.expect_publish(qos);
            if let Err(e) = self.client.publish(topic, qos, retain, payload).await {
                self.acks.cancel_publish();
                return Err(e.into());
            }
            ack
        };
        await_ack(ack).await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        let ack = {
            let _order = self.send_lock.lock().await;
            let ack = self.acks.expect_subscribe(filter);
            if let Err(e) = self.client.subscribe(filter, qos).await {
                self.acks.cancel_subscribe();
                return Err(e.into());
            }
            ack
        };
        await_ack(ack).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let ack = {
            let _order = self.send_lock.lock().await;
            let ack = self.acks.expect_unsubscribe();
            if let Err(e) = self.client.unsubscribe(filter).await {
                self.acks.cancel_unsubscribe();
                return Err(e.into());
            }
            ack
        };
        await_ack(ack).await
    }

    async fn disconnect(&self, grace: Duration) {
        let Some(mut handle) = self.driver.lock().await.take() else {
            warn!("[{}] MQTT client already disconnected", self.client_id);
            return;
        };

        if let Err(e) = self.client.disconnect().await {
            warn!("[{}] Failed to queue DISCONNECT: {e}", self.client_id);
        }
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!(
                "[{}] Event loop still busy after {}ms, closing",
                self.client_id,
                grace.as_millis()
            );
            handle.abort();
        }
        self.acks.clear();
        info!("[{}] MQTT client disconnected", self.client_id);
    }
}
