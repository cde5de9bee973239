use error_stack::ResultExt;
use serde_json::json;
use tracing::{debug, info};

use crate::config::Config;
use crate::dali_manager::{DaliManager, DaliManagerError, Result};
use crate::device_names::slugify;
use crate::normalize::{denormalize, normalize};
use crate::outbox::{self, Outbox};

/// One short-addressed ballast. The cached `level` is on the public 0-255
/// scale and is the bridge's belief about bus state; it is only committed
/// after a confirmed bus write and can be refreshed with `poll`.
pub struct Lamp {
    pub short_address: u8,
    pub friendly_name: String,
    pub device_name: String,
    pub min_physical_level: u8,
    pub min_level: u8,
    pub min_levels: u8,
    pub max_level: u8,
    pub groups: Vec<u8>,
    level: u8,
    state_topic: String,
    brightness_state_topic: String,
}

impl Lamp {
    pub fn new(
        dali: &mut DaliManager,
        config: &Config,
        outbox: &mut Outbox,
        friendly_name: String,
        short_address: u8,
    ) -> Result<Lamp> {
        let min_physical_level = dali.query_physical_minimum(short_address)?;
        let min_level = dali.query_min_level(short_address)?;
        let min_levels = min_physical_level.max(min_level);
        let max_level = dali.query_max_level(short_address)?;

        let device_name = slugify(&friendly_name);
        let base = &config.mqtt_base_topic;

        let actual_level = dali.query_actual_level(short_address)?;
        let level = if actual_level == 0 {
            0
        } else {
            normalize(actual_level, min_levels, max_level, 0, 255).change_context_lazy(|| {
                DaliManagerError::Context(format!(
                    "Mapping reported level {actual_level} of lamp {short_address}"
                ))
            })?
        };

        let lamp = Lamp {
            short_address,
            friendly_name,
            device_name: device_name.clone(),
            min_physical_level,
            min_level,
            min_levels,
            max_level,
            groups: Vec::new(),
            level,
            state_topic: outbox::state_topic(base, &device_name),
            brightness_state_topic: outbox::brightness_state_topic(base, &device_name),
        };

        outbox.publish(
            outbox::ha_discovery_topic(&config.ha_discovery_prefix, base, &lamp.device_name),
            lamp.ha_config(config),
            true,
        );
        outbox.publish(lamp.brightness_state_topic.clone(), lamp.level.to_string(), false);
        outbox.publish(
            lamp.state_topic.clone(),
            if lamp.level > 0 {
                outbox::PAYLOAD_ON
            } else {
                outbox::PAYLOAD_OFF
            },
            false,
        );

        info!(
            "   - short address: {}, actual brightness level: {} (minimum: {}, max: {}, physical minimum: {})",
            lamp.short_address, lamp.level, lamp.min_level, lamp.max_level, lamp.min_physical_level
        );

        Ok(lamp)
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn add_group(&mut self, group_address: u8) {
        self.groups.push(group_address);
    }

    /// Direct set path: bus write first, cache and publishes only on a
    /// confirmed write. Returns whether the cached level changed so the
    /// caller can recalculate owning groups.
    pub fn set_level(&mut self, dali: &mut DaliManager, outbox: &mut Outbox, level: u8) -> Result<bool> {
        if self.level == level {
            return Ok(false);
        }

        self.send_level_dali(dali, level)?;

        let old = std::mem::replace(&mut self.level, level);
        self.publish_level(outbox, old);

        Ok(true)
    }

    /// Group-broadcast path: the DAPC already reached this ballast, so
    /// only the cache and the published state are updated.
    pub fn set_level_cached(&mut self, outbox: &mut Outbox, level: u8) -> bool {
        if self.level == level {
            return false;
        }

        let old = std::mem::replace(&mut self.level, level);
        self.publish_level(outbox, old);
        true
    }

    /// Reconciliation for a bus with no push notifications: re-read the
    /// actual level and republish. Returns whether the cache changed.
    pub fn poll(&mut self, dali: &mut DaliManager, outbox: &mut Outbox) -> Result<bool> {
        let actual_level = dali.query_actual_level(self.short_address)?;
        let level = if actual_level == 0 {
            0
        } else {
            normalize(actual_level, self.min_levels, self.max_level, 0, 255)
                .change_context_lazy(|| {
                    DaliManagerError::Context(format!(
                        "Mapping reported level {actual_level} of lamp {}",
                        self.short_address
                    ))
                })?
        };

        debug!(
            "Get lamp {} brightness level {} ({})",
            self.friendly_name, level, actual_level
        );

        let changed = level != self.level;
        let old = std::mem::replace(&mut self.level, level);
        self.publish_level(outbox, old);

        Ok(changed)
    }

    fn send_level_dali(&self, dali: &mut DaliManager, level: u8) -> Result<()> {
        let physical = if level == 0 {
            0
        } else {
            denormalize(level, 0, 255, self.min_levels, self.max_level).change_context_lazy(
                || {
                    DaliManagerError::Context(format!(
                        "Mapping level {level} for lamp {}",
                        self.short_address
                    ))
                },
            )?
        };

        dali.set_light_brightness(self.short_address, physical)?;

        debug!(
            "Set lamp {} brightness level to {} ({})",
            self.friendly_name, level, physical
        );
        Ok(())
    }

    fn publish_level(&self, outbox: &mut Outbox, old: u8) {
        outbox.publish(self.brightness_state_topic.clone(), self.level.to_string(), false);
        if old == 0 || self.level == 0 {
            outbox.publish(
                self.state_topic.clone(),
                if self.level > 0 {
                    outbox::PAYLOAD_ON
                } else {
                    outbox::PAYLOAD_OFF
                },
                false,
            );
        }
    }

    /// Home Assistant discovery document.
    fn ha_config(&self, config: &Config) -> String {
        let base = &config.mqtt_base_topic;

        json!({
            "name": self.friendly_name,
            "unique_id": format!("DALI2MQTT_LIGHT_{}", self.device_name),
            "state_topic": self.state_topic,
            "command_topic": outbox::command_topic(base, &self.device_name),
            "payload_off": outbox::PAYLOAD_OFF,
            "brightness_state_topic": self.brightness_state_topic,
            "brightness_command_topic": outbox::brightness_command_topic(base, &self.device_name),
            "brightness_scale": 255,
            "on_command_type": "brightness",
            "availability_topic": outbox::bridge_status_topic(base),
            "payload_available": outbox::AVAILABLE,
            "payload_not_available": outbox::NOT_AVAILABLE,
            "device": {
                "identifiers": format!("{}_A{}", base, self.short_address),
                "via_device": base,
                "name": format!("DALI Light A{}", self.short_address),
                "sw_version": format!("dali2mqtt {}", crate::built_info::PKG_VERSION),
                "manufacturer": "dali2mqtt",
            },
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dali_emulator::{DaliEmulator, EmulatedGear};
    use crate::dali_manager::{DaliBusResult, DaliDriver};
    use error_stack::Report;

    fn test_config() -> Config {
        Config::default()
    }

    struct FailingDriver;

    impl DaliDriver for FailingDriver {
        fn send_2_bytes(&mut self, _b1: u8, _b2: u8) -> Result<DaliBusResult> {
            Err(Report::new(DaliManagerError::Context(
                "bus is down".to_string(),
            )))
        }
    }

    fn build_lamp(
        emulator: &mut DaliEmulator,
        friendly_name: &str,
        short_address: u8,
    ) -> (Lamp, Outbox) {
        let mut dali = DaliManager::new(emulator);
        let mut outbox = Outbox::new();
        let lamp = Lamp::new(
            &mut dali,
            &test_config(),
            &mut outbox,
            friendly_name.to_string(),
            short_address,
        )
        .unwrap();
        (lamp, outbox)
    }

    #[test]
    fn construction_queries_bounds_and_maps_the_level() {
        let mut emulator = DaliEmulator::with_gear(vec![EmulatedGear::new(3)
            .with_bounds(5, 10, 200)
            .with_level(200)]);

        let (lamp, mut outbox) = build_lamp(&mut emulator, "Kitchen Spot", 3);

        assert_eq!(lamp.min_physical_level, 5);
        assert_eq!(lamp.min_level, 10);
        assert_eq!(lamp.min_levels, 10);
        assert_eq!(lamp.max_level, 200);
        assert_eq!(lamp.level(), 255);
        assert_eq!(lamp.device_name, "kitchen_spot");

        let messages = outbox.take();
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0].topic,
            "homeassistant/light/dali2mqtt/kitchen_spot/config"
        );
        assert!(messages[0].retain);
        assert_eq!(messages[1].topic, "dali2mqtt/kitchen_spot/brightness/status");
        assert_eq!(messages[1].payload, "255");
        assert_eq!(messages[2].payload, "ON");
    }

    #[test]
    fn powered_off_lamp_is_discovered_as_off() {
        let mut emulator =
            DaliEmulator::with_gear(vec![EmulatedGear::new(0).with_level(0)]);

        let (lamp, mut outbox) = build_lamp(&mut emulator, "lamp_0", 0);

        assert_eq!(lamp.level(), 0);
        assert_eq!(outbox.take()[2].payload, "OFF");
    }

    #[test]
    fn setting_the_current_level_is_a_no_op() {
        let mut emulator = DaliEmulator::with_gear(vec![EmulatedGear::new(1)
            .with_bounds(1, 10, 200)
            .with_level(200)]);

        let (mut lamp, mut outbox) = build_lamp(&mut emulator, "lamp_1", 1);
        outbox.take();

        let mut dali = DaliManager::new(&mut emulator);
        let changed = lamp.set_level(&mut dali, &mut outbox, 255).unwrap();

        assert!(!changed);
        assert!(outbox.is_empty());
        assert_eq!(emulator.actual_level_of(1), Some(200));
    }

    #[test]
    fn set_writes_the_denormalized_level_and_publishes() {
        let mut emulator = DaliEmulator::with_gear(vec![EmulatedGear::new(1)
            .with_bounds(1, 10, 200)
            .with_level(0)]);

        let (mut lamp, mut outbox) = build_lamp(&mut emulator, "lamp_1", 1);
        outbox.take();

        let mut dali = DaliManager::new(&mut emulator);
        assert!(lamp.set_level(&mut dali, &mut outbox, 255).unwrap());

        assert_eq!(lamp.level(), 255);
        assert_eq!(emulator.actual_level_of(1), Some(200));

        let messages = outbox.take();
        assert_eq!(messages.len(), 2); // brightness + ON transition
        assert_eq!(messages[0].payload, "255");
        assert_eq!(messages[1].payload, "ON");
    }

    #[test]
    fn level_zero_bypasses_the_mapping() {
        let mut emulator = DaliEmulator::with_gear(vec![EmulatedGear::new(1)
            .with_bounds(1, 10, 200)
            .with_level(200)]);

        let (mut lamp, mut outbox) = build_lamp(&mut emulator, "lamp_1", 1);
        outbox.take();

        let mut dali = DaliManager::new(&mut emulator);
        lamp.set_level(&mut dali, &mut outbox, 0).unwrap();

        assert_eq!(emulator.actual_level_of(1), Some(0));

        let messages = outbox.take();
        assert_eq!(messages[0].payload, "0");
        assert_eq!(messages[1].payload, "OFF");
    }

    #[test]
    fn failed_bus_write_leaves_the_cache_untouched() {
        let mut emulator = DaliEmulator::with_gear(vec![EmulatedGear::new(1)
            .with_bounds(1, 10, 200)
            .with_level(200)]);

        let (mut lamp, mut outbox) = build_lamp(&mut emulator, "lamp_1", 1);
        outbox.take();

        let mut failing = FailingDriver;
        let mut dali = DaliManager::new(&mut failing);
        assert!(lamp.set_level(&mut dali, &mut outbox, 42).is_err());

        assert_eq!(lamp.level(), 255);
        assert!(outbox.is_empty());
    }

    #[test]
    fn cached_set_publishes_without_a_bus_write() {
        let mut emulator = DaliEmulator::with_gear(vec![EmulatedGear::new(1)
            .with_bounds(1, 10, 200)
            .with_level(0)]);

        let (mut lamp, mut outbox) = build_lamp(&mut emulator, "lamp_1", 1);
        outbox.take();

        assert!(lamp.set_level_cached(&mut outbox, 128));

        assert_eq!(lamp.level(), 128);
        assert_eq!(emulator.actual_level_of(1), Some(0)); // broadcast assumed already delivered
        assert_eq!(outbox.take().len(), 2);
    }

    #[test]
    fn poll_picks_up_out_of_band_changes() {
        let mut emulator = DaliEmulator::with_gear(vec![EmulatedGear::new(1)
            .with_bounds(1, 10, 200)
            .with_level(200)]);

        let (mut lamp, mut outbox) = build_lamp(&mut emulator, "lamp_1", 1);
        outbox.take();

        // Wall switch scenario: the level changes without the bridge knowing
        let mut dali = DaliManager::new(&mut emulator);
        dali.set_light_brightness(1, 105).unwrap();

        let mut dali = DaliManager::new(&mut emulator);
        let changed = lamp.poll(&mut dali, &mut outbox).unwrap();

        assert!(changed);
        assert_eq!(lamp.level(), normalize(105, 10, 200, 0, 255).unwrap());
        assert!(!outbox.is_empty());
    }
}
