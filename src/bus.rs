//! Adapter over the external message-bus client.
//!
//! The event loop only ever needs three things from the bus: subscribe to
//! the one static filter, publish a record, and periodically drive the
//! client's own network I/O. [`BusClient`] captures exactly that surface;
//! [`MqttBus`] implements it over rumqttc, and the integration tests
//! substitute an in-memory bus.

use crate::config::BridgeConfig;
use crate::{RelaymqError, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One inbound message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// The message-bus surface the bridge core depends on.
pub trait BusClient: Send {
    /// Establish the static topic subscription.
    fn subscribe(&mut self, filter: &str) -> Result<()>;

    /// Best-effort publish of one record. Failures are logged by the
    /// caller, never retried inline; reconnection is the transport's job.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Drive the client's pending network I/O for at most `timeout`,
    /// returning the inbound messages that arrived. Must never block
    /// beyond the timeout: the TCP side of the bridge keeps ticking even
    /// while the bus is down.
    fn service(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<BusMessage>>> + Send;
}

/// rumqttc-backed bus client.
///
/// Publishes and subscriptions are queued through the `AsyncClient`
/// handle; the owned event loop is driven from [`BusClient::service`], one
/// bounded slice per bridge tick. After a transport error the next
/// connection attempt is deferred by a fixed backoff, checked per tick
/// rather than slept through, so the TCP side never stalls.
pub struct MqttBus {
    client: AsyncClient,
    eventloop: EventLoop,
    filter: String,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl MqttBus {
    pub fn connect(config: &BridgeConfig) -> Self {
        let client_id = format!("relaymq_{}", std::process::id());
        let mut options = MqttOptions::new(client_id, &config.bus_host, config.bus_port);
        options.set_keep_alive(config.bus_keepalive());

        let (client, eventloop) = AsyncClient::new(options, 64);
        Self {
            client,
            eventloop,
            filter: config.topic_filter.clone(),
            backoff: config.reconnect_backoff(),
            retry_at: None,
        }
    }
}

impl BusClient for MqttBus {
    fn subscribe(&mut self, filter: &str) -> Result<()> {
        self.filter = filter.to_string();
        self.client
            .try_subscribe(filter, QoS::AtMostOnce)
            .map_err(|e| RelaymqError::Bus(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| RelaymqError::Bus(e.to_string()))
    }

    async fn service(&mut self, timeout: Duration) -> Result<Vec<BusMessage>> {
        if let Some(retry_at) = self.retry_at {
            if Instant::now() < retry_at {
                // still backing off; skip this tick's servicing slice
                return Ok(Vec::new());
            }
            self.retry_at = None;
            info!("bus backoff elapsed, attempting reconnect");
        }

        let mut inbound = Vec::new();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.eventloop.poll()).await {
                Err(_) => break,
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    // the broker does not remember subscriptions across
                    // sessions; re-issue the filter on every connect
                    info!("bus connected, subscribing to {}", self.filter);
                    if let Err(e) = self.client.try_subscribe(&self.filter, QoS::AtMostOnce) {
                        warn!("bus subscribe failed: {}", e);
                    }
                }
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    // filter matching is the bus client's definition, not ours
                    if rumqttc::matches(&publish.topic, &self.filter) {
                        inbound.push(BusMessage {
                            topic: publish.topic.clone(),
                            payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                        });
                    } else {
                        debug!("ignoring bus message on unmatched topic {}", publish.topic);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.retry_at = Some(Instant::now() + self.backoff);
                    return Err(RelaymqError::Bus(e.to_string()));
                }
            }
        }
        Ok(inbound)
    }
}
