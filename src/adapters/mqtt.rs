//! Broker client adapter.
//!
//! Implements [`MqttPort`].  On ESP-IDF it wraps `EspMqttClient`: a
//! receiver thread drains the connection and forwards session events into
//! a bounded [`CrossCoreChannel`], which `poll_event` reads without
//! blocking.  The transport client owns reconnect timing, so the adapter
//! drops the native client as soon as the link goes down instead of letting
//! esp-mqtt reconnect on its own schedule.
//!
//! The session registers a retained last-will of `{"online":false}` on the
//! status topic, so the broker marks the panel offline when it vanishes.
//!
//! On simulation targets `connect` succeeds immediately, publishes are
//! recorded for inspection and inbound traffic is injected by tests.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::app::ports::{MqttEvent, MqttPort};
use crate::channel::CrossCoreChannel;
use crate::config::SystemConfig;
use crate::error::TransportError;
use crate::transport::commands::MAX_INBOUND_BYTES;
use crate::transport::topics::Topics;

/// Broker events buffered between the receiver thread and the I/O tick.
pub const MQTT_EVENT_DEPTH: usize = 16;

/// Retained will published by the broker when the session dies.
pub const OFFLINE_WILL: &[u8] = br#"{"online":false}"#;

type EventQueue = CrossCoreChannel<MqttEvent, MQTT_EVENT_DEPTH>;

/// A publish captured by the simulation backend.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

pub struct MqttAdapter {
    url: String,
    client_id: String,
    username: String,
    password: String,
    will_topic: String,
    events: Arc<EventQueue>,
    #[cfg(target_os = "espidf")]
    client: Option<esp_idf_svc::mqtt::client::EspMqttClient<'static>>,
    #[cfg(not(target_os = "espidf"))]
    sim: SimBroker,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
struct SimBroker {
    connected: bool,
    reject_auth: bool,
    refuse_connect: bool,
    subscriptions: Vec<String>,
    published: Vec<Published>,
}

impl MqttAdapter {
    pub fn new(cfg: &SystemConfig, device_id: &str) -> Self {
        let topics = Topics::for_device(device_id);
        Self {
            url: format!("mqtt://{}:{}", cfg.broker_host, cfg.broker_port),
            client_id: device_id.to_owned(),
            username: cfg.broker_user.as_str().to_owned(),
            password: cfg.broker_password.as_str().to_owned(),
            will_topic: topics.status.as_str().to_owned(),
            events: Arc::new(CrossCoreChannel::new()),
            #[cfg(target_os = "espidf")]
            client: None,
            #[cfg(not(target_os = "espidf"))]
            sim: SimBroker::default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        #[cfg(target_os = "espidf")]
        {
            self.client.is_some()
        }
        #[cfg(not(target_os = "espidf"))]
        {
            self.sim.connected
        }
    }

    /// Broker events lost because the queue was full.
    pub fn dropped_events(&self) -> u32 {
        self.events.dropped()
    }

    // ── Simulation hooks ──────────────────────────────────────

    /// Deliver an inbound message as if the broker had sent it.
    #[cfg(not(target_os = "espidf"))]
    pub fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        self.events.send(MqttEvent::Message {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
        })
    }

    /// Simulate the broker dropping the session.
    #[cfg(not(target_os = "espidf"))]
    pub fn drop_link(&mut self) {
        if self.sim.connected {
            self.sim.connected = false;
            self.events.send(MqttEvent::Disconnected);
        }
    }

    /// Make subsequent connects answer with a credential refusal.
    #[cfg(not(target_os = "espidf"))]
    pub fn set_reject_auth(&mut self, reject: bool) {
        self.sim.reject_auth = reject;
    }

    /// Make subsequent connects fail before reaching the broker.
    #[cfg(not(target_os = "espidf"))]
    pub fn set_refuse_connect(&mut self, refuse: bool) {
        self.sim.refuse_connect = refuse;
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn published(&self) -> &[Published] {
        &self.sim.published
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn subscriptions(&self) -> &[String] {
        &self.sim.subscriptions
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn take_published(&mut self) -> Vec<Published> {
        core::mem::take(&mut self.sim.published)
    }

    // ── Platform-specific ─────────────────────────────────────

    #[cfg(target_os = "espidf")]
    fn platform_connect(&mut self) -> Result<(), TransportError> {
        use core::time::Duration;
        use esp_idf_svc::mqtt::client::{
            EspMqttClient, LwtConfiguration, MqttClientConfiguration, QoS,
        };

        let conf = MqttClientConfiguration {
            client_id: Some(self.client_id.as_str()),
            username: if self.username.is_empty() {
                None
            } else {
                Some(self.username.as_str())
            },
            password: if self.password.is_empty() {
                None
            } else {
                Some(self.password.as_str())
            },
            keep_alive_interval: Some(Duration::from_secs(30)),
            lwt: Some(LwtConfiguration {
                topic: self.will_topic.as_str(),
                payload: OFFLINE_WILL,
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            ..Default::default()
        };

        let (client, conn) = EspMqttClient::new(self.url.as_str(), &conf).map_err(|e| {
            warn!("MQTT: client init failed: {:?}", e);
            TransportError::ConnectFailed
        })?;
        spawn_receiver(conn, Arc::clone(&self.events))?;
        self.client = Some(client);
        Ok(())
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_connect(&mut self) -> Result<(), TransportError> {
        if self.sim.refuse_connect {
            return Err(TransportError::ConnectFailed);
        }
        if self.sim.reject_auth {
            self.events.send(MqttEvent::AuthRejected);
        } else {
            self.sim.connected = true;
            self.events.send(MqttEvent::Connected);
        }
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    fn platform_disconnect(&mut self) {
        // Dropping the client stops esp-mqtt; the receiver thread then sees
        // the connection close and exits.
        self.client = None;
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_disconnect(&mut self) {
        self.sim.connected = false;
        self.sim.subscriptions.clear();
    }

    #[cfg(target_os = "espidf")]
    fn platform_subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        use esp_idf_svc::mqtt::client::QoS;
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .subscribe(filter, QoS::AtLeastOnce)
            .map(|_| ())
            .map_err(|e| {
                warn!("MQTT: subscribe error {:?}", e);
                TransportError::SubscribeFailed
            })
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        if !self.sim.connected {
            return Err(TransportError::NotConnected);
        }
        self.sim.subscriptions.push(filter.to_owned());
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    fn platform_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        use esp_idf_svc::mqtt::client::QoS;
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .enqueue(topic, QoS::AtLeastOnce, retain, payload)
            .map(|_| ())
            .map_err(|e| {
                warn!("MQTT: publish error {:?}", e);
                TransportError::PublishFailed
            })
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.sim.connected {
            return Err(TransportError::NotConnected);
        }
        self.sim.published.push(Published {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }
}

/// Forward esp-mqtt events into the queue until the connection closes.
#[cfg(target_os = "espidf")]
fn spawn_receiver(
    mut conn: esp_idf_svc::mqtt::client::EspMqttConnection,
    events: Arc<EventQueue>,
) -> Result<(), TransportError> {
    use esp_idf_svc::mqtt::client::{Details, EventPayload};

    std::thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                let forwarded = match event.payload() {
                    EventPayload::Connected(_) => Some(MqttEvent::Connected),
                    EventPayload::Disconnected => Some(MqttEvent::Disconnected),
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        if data.len() > MAX_INBOUND_BYTES {
                            warn!(
                                "MQTT: dropping {} byte payload on {}",
                                data.len(),
                                topic
                            );
                            None
                        } else {
                            Some(MqttEvent::Message {
                                topic: topic.to_owned(),
                                payload: data.to_vec(),
                            })
                        }
                    }
                    EventPayload::Error(e) => {
                        warn!("MQTT: session error {:?}", e);
                        None
                    }
                    _ => None,
                };
                if let Some(ev) = forwarded {
                    if !events.send(ev) {
                        warn!("MQTT: event queue full");
                    }
                }
            }
            debug!("MQTT: receiver exiting");
        })
        .map(|_| ())
        .map_err(|e| {
            warn!("MQTT: receiver spawn failed: {}", e);
            TransportError::ConnectFailed
        })
}

impl MqttPort for MqttAdapter {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_open() {
            self.platform_disconnect();
        }
        // Anything still queued belongs to the previous session.
        self.events.drain(|_| {});
        info!("MQTT: connecting to {}", self.url);
        self.platform_connect()
    }

    fn disconnect(&mut self) {
        if self.is_open() {
            debug!("MQTT: closing session");
        }
        self.platform_disconnect();
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.platform_subscribe(filter)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        self.platform_publish(topic, payload, retain)
    }

    fn poll_event(&mut self) -> Option<MqttEvent> {
        let event = self.events.try_receive()?;
        if event == MqttEvent::Disconnected {
            // Reconnects are scheduled by the transport's backoff.
            self.platform_disconnect();
        }
        Some(event)
    }
}
