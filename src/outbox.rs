/// MQTT payloads and topic layout shared by the bridge and the device
/// entities. Entities queue their publishes here; the bridge drains the
/// queue to the broker after each operation.

pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";
pub const AVAILABLE: &str = "online";
pub const NOT_AVAILABLE: &str = "offline";

pub fn bridge_status_topic(base: &str) -> String {
    format!("{base}/status")
}

pub fn state_topic(base: &str, device: &str) -> String {
    format!("{base}/{device}/status")
}

pub fn command_topic(base: &str, device: &str) -> String {
    format!("{base}/{device}/set")
}

pub fn brightness_state_topic(base: &str, device: &str) -> String {
    format!("{base}/{device}/brightness/status")
}

pub fn brightness_command_topic(base: &str, device: &str) -> String {
    format!("{base}/{device}/brightness/set")
}

pub fn scan_topic(base: &str) -> String {
    format!("{base}/scan")
}

pub fn poll_topic(base: &str) -> String {
    format!("{base}/poll")
}

pub fn ha_discovery_topic(prefix: &str, base: &str, device: &str) -> String {
    format!("{prefix}/light/{base}/{device}/config")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Default)]
pub struct Outbox {
    queued: Vec<OutMessage>,
}

impl Outbox {
    pub fn new() -> Outbox {
        Outbox::default()
    }

    pub fn publish(&mut self, topic: String, payload: impl Into<String>, retain: bool) {
        self.queued.push(OutMessage {
            topic,
            payload: payload.into(),
            retain,
        });
    }

    pub fn take(&mut self) -> Vec<OutMessage> {
        std::mem::take(&mut self.queued)
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}
