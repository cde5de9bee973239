use error_stack::ResultExt;
use rand::Rng;
use regex::Regex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, Publish, QoS};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::dali_manager::DaliManager;
use crate::device_names::DeviceNames;
use crate::devices::DeviceTable;
use crate::outbox::{self, Outbox};
use crate::scanner;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("MQTT client error")]
    Client,

    #[error("MQTT connection lost")]
    Connection,
}

pub type Result<T> = error_stack::Result<T, BridgeError>;

/// Why a broker session ended without an error.
pub enum SessionEnd {
    Rescan,
}

/// Delay policy for the reconnect loop: a configured minimum plus up to a
/// second of jitter, bounded by a budget of consecutive failed attempts.
pub struct Backoff {
    min_delay: Duration,
    max_retries: u32,
    retries: u32,
}

impl Backoff {
    pub fn new(min_delay: Duration, max_retries: u32) -> Backoff {
        Backoff {
            min_delay,
            max_retries,
            retries: 0,
        }
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// None once the retry budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.retries += 1;
        if self.retries >= self.max_retries {
            None
        } else {
            let jitter = rand::thread_rng().gen_range(0..1000);
            Some(self.min_delay + Duration::from_millis(jitter))
        }
    }
}

fn topic_patterns(base: &str) -> (Regex, Regex) {
    let command = Regex::new(&format!("^{}/([^/]+)/set$", regex::escape(base)))
        .expect("command topic pattern");
    let brightness = Regex::new(&format!("^{}/([^/]+)/brightness/set$", regex::escape(base)))
        .expect("brightness topic pattern");
    (command, brightness)
}

/// One broker session. Owns the device table for its lifetime; a rescan
/// command ends the session so the outer loop rebuilds everything from a
/// fresh bus scan.
pub struct MqttBridge<'a, 'driver> {
    config: &'a Config,
    dali: &'a mut DaliManager<'driver>,
    names: &'a mut DeviceNames,
    client: AsyncClient,
    events: EventLoop,
    table: DeviceTable,
    outbox: Outbox,
    connected: bool,
    command_pattern: Regex,
    brightness_pattern: Regex,
    scan_topic: String,
    poll_topic: String,
}

impl<'a, 'driver> MqttBridge<'a, 'driver> {
    pub fn new(
        config: &'a Config,
        dali: &'a mut DaliManager<'driver>,
        names: &'a mut DeviceNames,
    ) -> MqttBridge<'a, 'driver> {
        let base = &config.mqtt_base_topic;

        let mut mqtt_options =
            MqttOptions::new("dali2mqtt", &config.mqtt_server, config.mqtt_port);
        let last_will = LastWill::new(
            outbox::bridge_status_topic(base),
            outbox::NOT_AVAILABLE.as_bytes(),
            QoS::AtLeastOnce,
            true,
        );
        mqtt_options
            .set_keep_alive(Duration::from_secs(5))
            .set_last_will(last_will);
        if !config.mqtt_username.is_empty() {
            mqtt_options.set_credentials(
                config.mqtt_username.as_str(),
                config.mqtt_password.as_str(),
            );
        }

        // The connect-time scan queues discovery and state for every
        // device before the event loop gets polled again
        let (client, events) = AsyncClient::new(mqtt_options, 1024);

        let (command_pattern, brightness_pattern) = topic_patterns(base);

        MqttBridge {
            config,
            dali,
            names,
            client,
            events,
            table: DeviceTable::new(),
            outbox: Outbox::new(),
            connected: false,
            command_pattern,
            brightness_pattern,
            scan_topic: outbox::scan_topic(base),
            poll_topic: outbox::poll_topic(base),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub async fn run(&mut self) -> Result<SessionEnd> {
        info!(
            "Connecting to MQTT broker at {}:{}",
            self.config.mqtt_server, self.config.mqtt_port
        );

        loop {
            let event = self
                .events
                .poll()
                .await
                .change_context(BridgeError::Connection)?;

            match event {
                Event::Incoming(Packet::ConnAck(_)) => self.on_connect().await?,
                Event::Incoming(Packet::Publish(publish)) => {
                    if let Some(end) = self.on_publish(publish).await? {
                        return Ok(end);
                    }
                }
                _ => {}
            }
        }
    }

    async fn on_connect(&mut self) -> Result<()> {
        info!("Connected to MQTT broker");
        self.connected = true;

        let base = &self.config.mqtt_base_topic;

        self.client
            .publish(
                outbox::bridge_status_topic(base),
                QoS::AtLeastOnce,
                true,
                outbox::AVAILABLE,
            )
            .await
            .change_context(BridgeError::Client)?;

        for topic in [
            format!("{base}/+/set"),
            format!("{base}/+/brightness/set"),
            self.scan_topic.clone(),
            self.poll_topic.clone(),
        ] {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .change_context(BridgeError::Client)?;
        }

        // Blocks command processing until the scan completes; no command
        // is meaningful before the device table exists
        self.table = scanner::build_table(self.dali, self.config, self.names, &mut self.outbox);

        self.flush_outbox().await
    }

    async fn on_publish(&mut self, publish: Publish) -> Result<Option<SessionEnd>> {
        if publish.topic == self.scan_topic {
            info!("Rescan requested, dropping the broker session");
            let _ = self.client.disconnect().await;
            return Ok(Some(SessionEnd::Rescan));
        }

        if publish.topic == self.poll_topic {
            debug!("Polling all lamps");
            self.table.poll_all(self.dali, &mut self.outbox);
            self.flush_outbox().await?;
            return Ok(None);
        }

        let Ok(payload) = std::str::from_utf8(&publish.payload) else {
            error!("Payload on {} is not valid UTF-8", publish.topic);
            return Ok(None);
        };

        if let Some(captures) = self.brightness_pattern.captures(&publish.topic) {
            let device = captures[1].to_string();
            self.on_brightness_command(&device, payload);
        } else if let Some(captures) = self.command_pattern.captures(&publish.topic) {
            let device = captures[1].to_string();
            self.on_switch_command(&device, payload);
        } else {
            error!("Got publish on unexpected topic {}", publish.topic);
        }

        self.flush_outbox().await?;
        Ok(None)
    }

    fn on_switch_command(&mut self, device: &str, payload: &str) {
        debug!("Command for {}: {}", device, payload);

        match payload {
            outbox::PAYLOAD_OFF => {
                let Some(target) = self.table.resolve(device) else {
                    error!("{} doesn't exist", device);
                    return;
                };

                if let Err(e) = self.table.set_level(self.dali, &mut self.outbox, target, 0) {
                    error!("Failed to set {} to OFF: {:?}", device, e);
                } else {
                    debug!("Set {} to OFF", device);
                }
            }
            // Home Assistant is configured with on_command_type:
            // brightness, so turn-on arrives on the brightness topic
            outbox::PAYLOAD_ON => debug!("Turn-on for {} arrives as a brightness command", device),
            _ => error!("Invalid payload '{}' on command topic for {}", payload, device),
        }
    }

    fn on_brightness_command(&mut self, device: &str, payload: &str) {
        debug!("Brightness command for {}: {}", device, payload);

        let level = match payload.trim().parse::<u16>() {
            Ok(level) if level <= 255 => level as u8,
            _ => {
                error!("Invalid brightness payload '{}' for {}", payload, device);
                return;
            }
        };

        let Some(target) = self.table.resolve(device) else {
            error!("{} doesn't exist", device);
            return;
        };

        if let Err(e) = self
            .table
            .set_level(self.dali, &mut self.outbox, target, level)
        {
            error!("Failed to set {} to {}: {:?}", device, level, e);
        } else {
            debug!("Set {} to {}", device, level);
        }
    }

    async fn flush_outbox(&mut self) -> Result<()> {
        if self.outbox.is_empty() {
            return Ok(());
        }

        for message in self.outbox.take() {
            self.client
                .publish(message.topic, QoS::AtLeastOnce, message.retain, message.payload)
                .await
                .change_context(BridgeError::Client)?;
        }
        Ok(())
    }
}
