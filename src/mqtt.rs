use crate::prelude::*;
use crate::meter::RegisterValue;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    pub fn for_status(status: &Status) -> Result<Message> {
        Ok(Message {
            topic: "status".to_string(),
            retain: true,
            payload: serde_json::to_string(status)?,
        })
    }

    pub fn for_registers(values: &[RegisterValue]) -> Result<Message> {
        Ok(Message {
            topic: "registers".to_string(),
            retain: false,
            payload: serde_json::to_string(values)?,
        })
    }

    pub fn for_lwt(online: bool) -> Message {
        Message {
            topic: "LWT".to_string(),
            retain: true,
            payload: if online { "online" } else { "offline" }.to_string(),
        }
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    /// (Re)subscribe to every mapped source topic.
    Resubscribe,
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

/// Feeds source readings from MQTT into the value store and publishes the
/// meter's status.
#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    store: ValueStore,
    meter: MeterHandle,
}

impl Mqtt {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        store: ValueStore,
        meter: MeterHandle,
    ) -> Self {
        Self {
            config,
            channels,
            store,
            meter,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new(
            format!("dtsu666-emulator-{}", std::process::id()),
            c.host(),
            c.port(),
        );
        options.set_last_will(LastWill::new(
            self.lwt_topic(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.receiver(eventloop),
            self.sender(client),
            self.status_publisher()
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        info!("Stopping MQTT client...");
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    /// Asks the sender to subscribe to the current mapping's topics, e.g. after
    /// a config reload.
    pub fn resubscribe(&self) {
        let _ = self.channels.to_mqtt.send(ChannelData::Resubscribe);
    }

    // mqtt -> value store
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        let mut shutdown = self.channels.to_mqtt.subscribe();

        loop {
            tokio::select! {
                msg = shutdown.recv() => {
                    if is_shutdown(&msg) {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected");
                        // the sender subscribes; doing it here would stall the event loop
                        let _ = self.channels.to_mqtt.send(ChannelData::Resubscribe);
                        let _ = self
                            .channels
                            .to_mqtt
                            .send(ChannelData::Message(Message::for_lwt(true)));
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        self.handle_message(publish);
                    }
                    Err(e) => {
                        error!("{}", e);
                        info!("reconnecting in 5s");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                    _ => {} // keepalives etc
                },
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    fn handle_message(&self, publish: Publish) {
        let payload = String::from_utf8_lossy(&publish.payload);
        debug!("RX: {} = {}", publish.topic, payload);

        if let Err(e) = self.store.update(&publish.topic, &payload) {
            error!("failed to store reading for {}: {}", publish.topic, e);
        }
    }

    // status/subscriptions -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        use ChannelData::*;

        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            let data = match receiver.recv().await {
                Ok(data) => data,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("MQTT sender lagged, {} messages dropped", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match data {
                Shutdown => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client
                        .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "offline")
                        .await;
                    let _ = client.disconnect().await;
                    break;
                }
                Resubscribe => {
                    let topics = self.config.source_topics();
                    if topics.is_empty() {
                        warn!("no source topics to subscribe to");
                        continue;
                    }
                    info!("subscribing to {} source topics", topics.len());
                    let filters = topics
                        .into_iter()
                        .map(|topic| rumqttc::SubscribeFilter::new(topic, QoS::AtMostOnce));
                    if let Err(e) = client.subscribe_many(filters).await {
                        error!("MQTT subscribe failed: {:?}", e);
                    }
                }
                Message(message) => {
                    let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
                    debug!("publishing: {} = {}", topic, message.payload);
                    let payload = message.payload.into_bytes();
                    for attempt in 1..=3 {
                        match client
                            .publish(&topic, QoS::AtLeastOnce, message.retain, payload.clone())
                            .await
                        {
                            Ok(_) => break,
                            Err(err) => {
                                error!("MQTT publish failed: {:?} (attempt {}/3)", err, attempt);
                                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn status_publisher(&self) -> Result<()> {
        let mut shutdown = self.channels.to_mqtt.subscribe();
        let mut interval = tokio::time::interval(self.config.mqtt().status_interval());

        loop {
            tokio::select! {
                msg = shutdown.recv() => {
                    if is_shutdown(&msg) {
                        break;
                    }
                }
                _ = interval.tick() => {
                    for message in self.status_messages()? {
                        if self.channels.to_mqtt.send(ChannelData::Message(message)).is_err() {
                            bail!("send(to_mqtt) failed - channel closed?");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn status_messages(&self) -> Result<Vec<Message>> {
        let (status, values) = match (self.meter.status(), self.meter.register_values()) {
            (Ok(status), Ok(values)) => (status, values),
            (Err(MeterError::EngineStopped), _) | (_, Err(MeterError::EngineStopped)) => {
                return Ok(Vec::new())
            }
            (Err(e), _) | (_, Err(e)) => return Err(e.into()),
        };

        Ok(vec![Message::for_status(&status)?, Message::for_registers(&values)?])
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}

fn is_shutdown(msg: &Result<ChannelData, broadcast::error::RecvError>) -> bool {
    matches!(
        msg,
        Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_message_is_retained_json() -> Result<()> {
        let status = Status {
            health: HealthState::Failed,
            failing_roles: vec![Role::VoltageL1],
            last_publish: Some(chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            mapped_roles: 3,
            sequence: 7,
        };

        let message = Message::for_status(&status)?;
        assert_eq!(message.topic, "status");
        assert!(message.retain);

        let json: serde_json::Value = serde_json::from_str(&message.payload)?;
        assert_eq!(json["health"], "FAILED");
        assert_eq!(json["failing_roles"][0], "voltage_l1");
        assert_eq!(json["last_publish"], "2024-01-02T03:04:05Z");
        assert_eq!(json["mapped_roles"], 3);

        Ok(())
    }

    #[test]
    fn registers_message_lists_words_and_values() -> Result<()> {
        let values = vec![RegisterValue {
            role: Role::Frequency,
            address: 0x0866,
            words: vec![5002],
            value: 50.02,
            unit: "Hz",
        }];

        let message = Message::for_registers(&values)?;
        let json: serde_json::Value = serde_json::from_str(&message.payload)?;
        assert_eq!(json[0]["role"], "frequency");
        assert_eq!(json[0]["address"], 0x0866);
        assert_eq!(json[0]["words"][0], 5002);

        Ok(())
    }

    #[test]
    fn shutdown_or_closed_channel_ends_loops() {
        assert!(is_shutdown(&Ok(ChannelData::Shutdown)));
        assert!(is_shutdown(&Err(broadcast::error::RecvError::Closed)));
        assert!(!is_shutdown(&Ok(ChannelData::Resubscribe)));
        assert!(!is_shutdown(&Err(broadcast::error::RecvError::Lagged(3))));
    }

    #[test]
    fn lwt_messages() {
        assert_eq!(Message::for_lwt(true).payload, "online");
        assert_eq!(Message::for_lwt(false).payload, "offline");
    }
}
