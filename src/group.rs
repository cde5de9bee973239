use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{Config, GroupMode};
use crate::dali_manager::{DaliManager, DaliManagerError, Result};
use crate::device_names::slugify;
use crate::lamp::Lamp;
use crate::normalize::denormalize;
use crate::outbox::{self, Outbox};
use error_stack::ResultExt;

/// One DALI group. The level is derived from the member lamps (per the
/// configured aggregation) and is only authoritative immediately after an
/// explicit group set; membership is fixed at scan time.
pub struct Group {
    pub address: u8,
    pub lamps: Vec<u8>,
    pub friendly_name: String,
    pub device_name: String,
    pub min_levels: u8,
    pub max_level: u8,
    mode: GroupMode,
    level: u8,
    state_topic: String,
    brightness_state_topic: String,
}

fn median(levels: &[u8]) -> u8 {
    if levels.is_empty() {
        return 0;
    }

    let mut sorted = levels.to_vec();
    sorted.sort_unstable();

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        ((sorted[mid - 1] as u16 + sorted[mid] as u16) as f64 / 2.0).round() as u8
    }
}

fn aggregate(mode: GroupMode, levels: &[u8]) -> u8 {
    match mode {
        GroupMode::Max => levels.iter().copied().max().unwrap_or(0),
        GroupMode::Min => levels.iter().copied().min().unwrap_or(0),
        // A frozen group still needs an initial value
        GroupMode::Median | GroupMode::Off => median(levels),
    }
}

impl Group {
    pub fn new(
        config: &Config,
        outbox: &mut Outbox,
        friendly_name: String,
        address: u8,
        members: Vec<u8>,
        lamps: &BTreeMap<u8, Lamp>,
    ) -> Group {
        let member_lamps = || members.iter().filter_map(|a| lamps.get(a));

        let levels: Vec<u8> = member_lamps().map(|lamp| lamp.level()).collect();
        let level = aggregate(config.group_mode, &levels);
        let min_levels = member_lamps().map(|lamp| lamp.min_levels).min().unwrap_or(1);
        let max_level = member_lamps().map(|lamp| lamp.max_level).max().unwrap_or(254);

        let device_name = slugify(&friendly_name);
        let base = &config.mqtt_base_topic;

        let group = Group {
            address,
            lamps: members,
            friendly_name,
            device_name: device_name.clone(),
            min_levels,
            max_level,
            mode: config.group_mode,
            level,
            state_topic: outbox::state_topic(base, &device_name),
            brightness_state_topic: outbox::brightness_state_topic(base, &device_name),
        };

        outbox.publish(
            outbox::ha_discovery_topic(&config.ha_discovery_prefix, base, &group.device_name),
            group.ha_config(config),
            true,
        );
        outbox.publish(group.brightness_state_topic.clone(), group.level.to_string(), false);
        outbox.publish(
            group.state_topic.clone(),
            if group.level > 0 {
                outbox::PAYLOAD_ON
            } else {
                outbox::PAYLOAD_OFF
            },
            false,
        );

        info!(
            "   - group address: {}, brightness level: {}",
            group.address, group.level
        );

        group
    }

    #[allow(dead_code)]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Recompute the derived level from current member levels. Publishes
    /// only when the recomputed value differs from the cached one.
    pub fn recalc_level(&mut self, lamps: &BTreeMap<u8, Lamp>, outbox: &mut Outbox) {
        if self.mode == GroupMode::Off {
            return;
        }

        let levels: Vec<u8> = self
            .lamps
            .iter()
            .filter_map(|a| lamps.get(a))
            .map(|lamp| lamp.level())
            .collect();
        if levels.is_empty() {
            return;
        }

        let level = aggregate(self.mode, &levels);
        if level != self.level {
            let old = std::mem::replace(&mut self.level, level);
            self.publish_level(outbox, old);
        }
    }

    /// One DAPC broadcast to the whole group, mapped against the group's
    /// own bounds. The cache is not touched here so a failed write leaves
    /// the previous state intact.
    pub fn send_level_dali(&self, dali: &mut DaliManager, level: u8) -> Result<()> {
        let physical = if level == 0 {
            0
        } else {
            denormalize(level, 0, 255, self.min_levels, self.max_level).change_context_lazy(
                || {
                    DaliManagerError::Context(format!(
                        "Mapping level {level} for group {}",
                        self.address
                    ))
                },
            )?
        };

        dali.set_group_brightness(self.address, physical)?;

        debug!(
            "Set group {} brightness level to {} ({})",
            self.friendly_name, level, physical
        );
        Ok(())
    }

    pub fn commit_level(&mut self, level: u8) -> u8 {
        std::mem::replace(&mut self.level, level)
    }

    pub fn publish_level(&self, outbox: &mut Outbox, old: u8) {
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
            "unique_id": format!("DALI2MQTT_GROUP_{}", self.device_name),
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
                "identifiers": format!("{}_G{}", base, self.address),
                "via_device": base,
                "name": format!("DALI Group G{}", self.address),
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

    fn test_config(mode: GroupMode) -> Config {
        Config {
            group_mode: mode,
            ..Config::default()
        }
    }

    /// Lamps with the given cached public levels, all bounded [10, 200].
    fn lamps_with_levels(levels: &[(u8, u8)]) -> BTreeMap<u8, Lamp> {
        let gear = levels
            .iter()
            .map(|(address, _)| {
                EmulatedGear::new(*address)
                    .with_bounds(1, 10, 200)
                    .with_level(0)
            })
            .collect();
        let mut emulator = DaliEmulator::with_gear(gear);
        let mut dali = DaliManager::new(&mut emulator);
        let mut outbox = Outbox::new();

        levels
            .iter()
            .map(|(address, level)| {
                let mut lamp = Lamp::new(
                    &mut dali,
                    &Config::default(),
                    &mut outbox,
                    format!("lamp_{address}"),
                    *address,
                )
                .unwrap();
                lamp.set_level_cached(&mut outbox, *level);
                (*address, lamp)
            })
            .collect()
    }

    #[test]
    fn median_of_levels() {
        assert_eq!(median(&[10, 200, 30]), 30);
        assert_eq!(median(&[10, 20]), 15);
        assert_eq!(median(&[128]), 128);
        assert_eq!(median(&[]), 0);
    }

    #[test]
    fn initial_level_uses_the_configured_aggregation() {
        let lamps = lamps_with_levels(&[(1, 50), (2, 100), (3, 250)]);
        let mut outbox = Outbox::new();

        let group = Group::new(
            &test_config(GroupMode::Max),
            &mut outbox,
            "group_0".to_string(),
            0,
            vec![1, 2, 3],
            &lamps,
        );

        assert_eq!(group.level(), 250);
        assert_eq!(group.min_levels, 10);
        assert_eq!(group.max_level, 200);
    }

    #[test]
    fn recalc_publishes_once_and_only_on_change() {
        let mut lamps = lamps_with_levels(&[(1, 50), (2, 100)]);
        let mut outbox = Outbox::new();

        let mut group = Group::new(
            &test_config(GroupMode::Median),
            &mut outbox,
            "group_0".to_string(),
            0,
            vec![1, 2],
            &lamps,
        );
        assert_eq!(group.level(), 75);
        outbox.take();

        // No member change: no publish at all
        group.recalc_level(&lamps, &mut outbox);
        assert!(outbox.is_empty());

        // One member moved: exactly one brightness publish
        lamps
            .get_mut(&1)
            .unwrap()
            .set_level_cached(&mut Outbox::new(), 200);
        group.recalc_level(&lamps, &mut outbox);

        let messages = outbox.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, "150");
        assert_eq!(group.level(), 150);
    }

    #[test]
    fn recalc_with_mode_off_never_changes_the_level() {
        let mut lamps = lamps_with_levels(&[(1, 50), (2, 100)]);
        let mut outbox = Outbox::new();

        let mut group = Group::new(
            &test_config(GroupMode::Off),
            &mut outbox,
            "group_0".to_string(),
            0,
            vec![1, 2],
            &lamps,
        );
        let initial = group.level();
        outbox.take();

        lamps
            .get_mut(&1)
            .unwrap()
            .set_level_cached(&mut Outbox::new(), 255);
        lamps
            .get_mut(&2)
            .unwrap()
            .set_level_cached(&mut Outbox::new(), 0);
        group.recalc_level(&lamps, &mut outbox);

        assert_eq!(group.level(), initial);
        assert!(outbox.is_empty());
    }

    #[test]
    fn recalc_publishes_state_on_off_transitions() {
        let mut lamps = lamps_with_levels(&[(1, 100)]);
        let mut outbox = Outbox::new();

        let mut group = Group::new(
            &test_config(GroupMode::Median),
            &mut outbox,
            "group_0".to_string(),
            0,
            vec![1],
            &lamps,
        );
        outbox.take();

        lamps
            .get_mut(&1)
            .unwrap()
            .set_level_cached(&mut Outbox::new(), 0);
        group.recalc_level(&lamps, &mut outbox);

        let messages = outbox.take();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, "0");
        assert_eq!(messages[1].payload, "OFF");
    }
}
