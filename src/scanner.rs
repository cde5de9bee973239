use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dali_manager::DaliManager;
use crate::device_names::{slugify, DeviceNames};
use crate::devices::DeviceTable;
use crate::group::Group;
use crate::lamp::Lamp;
use crate::outbox::Outbox;

const BUS_ADDRESSES: u8 = 64;

/// Linear presence probe over the short address space. Stops early once
/// the configured number of lamps has been found; a probe error means
/// "not present" for that address only.
pub fn scan_lamps(dali: &mut DaliManager, expected_lamps: u8) -> Vec<u8> {
    let mut lamps = Vec::new();

    for short_address in 0..BUS_ADDRESSES {
        debug!("Search for lamp {}", short_address);

        match dali.is_gear_present(short_address) {
            Ok(true) => {
                debug!("Found lamp at address {}", short_address);
                lamps.push(short_address);

                if lamps.len() >= expected_lamps as usize {
                    warn!(
                        "All {} configured lamps have been found, stopping scan",
                        expected_lamps
                    );
                    return lamps;
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Lamp {} not present: {:?}", short_address, e),
        }
    }

    info!("Found {} lamps", lamps.len());
    lamps
}

/// Second discovery pass: read each lamp's two membership bitmasks and
/// invert them into a group -> members map. A bitmask failure leaves that
/// lamp in no groups.
pub fn scan_groups(dali: &mut DaliManager, lamps: &[u8]) -> BTreeMap<u8, Vec<u8>> {
    info!("Scanning for groups");
    let mut groups: BTreeMap<u8, Vec<u8>> = BTreeMap::new();

    for &lamp in lamps {
        debug!("Search for groups for lamp {}", lamp);

        match dali.query_group_mask(lamp) {
            Ok(mask) => {
                let mut lamp_groups = Vec::new();

                for group in 0..16u8 {
                    if mask & (1 << group) != 0 {
                        groups.entry(group).or_default().push(lamp);
                        lamp_groups.push(group);
                    }
                }

                debug!("Lamp {} is in groups {:?}", lamp, lamp_groups);
            }
            Err(e) => warn!("Can't get groups for lamp {}: {:?}", lamp, e),
        }
    }

    info!("Finished scanning for groups");
    groups
}

/// Slugs are topic segments and must be unique across lamps and groups;
/// a clashing hand-edited name falls back to the address-derived key.
fn unique_friendly_name(table: &DeviceTable, names: &DeviceNames, key: &str) -> Option<String> {
    let friendly_name = names.friendly_name(key);
    if !table.has_slug(&slugify(&friendly_name)) {
        return Some(friendly_name);
    }

    error!(
        "Duplicate device name '{}' for {}, falling back to the default",
        friendly_name, key
    );
    if !table.has_slug(&slugify(key)) {
        return Some(key.to_string());
    }

    error!("Default name {} is taken as well, skipping this device", key);
    None
}

/// Full discovery cycle: probe, construct lamps (self-initializing over
/// the bus), invert group bitmasks into groups, wire back-references and
/// bootstrap the persisted names on first run.
pub fn build_table(
    dali: &mut DaliManager,
    config: &Config,
    names: &mut DeviceNames,
    outbox: &mut Outbox,
) -> DeviceTable {
    let mut table = DeviceTable::new();

    for short_address in scan_lamps(dali, config.dali_lamps) {
        let Some(friendly_name) =
            unique_friendly_name(&table, names, &format!("lamp_{short_address}"))
        else {
            continue;
        };

        match Lamp::new(dali, config, outbox, friendly_name, short_address) {
            Ok(lamp) => table.insert_lamp(lamp),
            Err(e) => error!("While initializing lamp {}: {:?}", short_address, e),
        }
    }

    let discovered: Vec<u8> = table.lamps.keys().copied().collect();
    for (group_address, members) in scan_groups(dali, &discovered) {
        let Some(friendly_name) =
            unique_friendly_name(&table, names, &format!("group_{group_address}"))
        else {
            continue;
        };

        let group = Group::new(
            config,
            outbox,
            friendly_name,
            group_address,
            members,
            &table.lamps,
        );
        table.insert_group(group);
    }

    if names.is_empty() {
        let entries = table
            .lamps
            .values()
            .map(|lamp| {
                (
                    format!("lamp_{}", lamp.short_address),
                    lamp.friendly_name.clone(),
                )
            })
            .chain(table.groups.values().map(|group| {
                (
                    format!("group_{}", group.address),
                    group.friendly_name.clone(),
                )
            }))
            .collect::<Vec<_>>();

        if let Err(e) = names.save_defaults(entries) {
            error!("Could not save device names config: {:?}", e);
        }
    }

    info!(
        "Bus scan finished: {} lamps, {} groups",
        table.lamp_count(),
        table.group_count()
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dali_emulator::{DaliEmulator, EmulatedGear};
    use crate::dali_manager::{DaliBusResult, DaliDriver, DaliManagerError, Result};
    use error_stack::Report;

    struct CountingDriver {
        inner: DaliEmulator,
        sent: usize,
    }

    impl DaliDriver for CountingDriver {
        fn send_2_bytes(&mut self, b1: u8, b2: u8) -> Result<DaliBusResult> {
            self.sent += 1;
            self.inner.send_2_bytes(b1, b2)
        }
    }

    struct DeadBusDriver;

    impl DaliDriver for DeadBusDriver {
        fn send_2_bytes(&mut self, _b1: u8, _b2: u8) -> Result<DaliBusResult> {
            Err(Report::new(DaliManagerError::Context(
                "bus is down".to_string(),
            )))
        }
    }

    #[test]
    fn scan_stops_once_the_expected_count_is_reached() {
        let mut driver = CountingDriver {
            inner: DaliEmulator::with_gear(vec![
                EmulatedGear::new(5),
                EmulatedGear::new(40),
            ]),
            sent: 0,
        };

        let found = {
            let mut dali = DaliManager::new(&mut driver);
            scan_lamps(&mut dali, 2)
        };

        assert_eq!(found, vec![5, 40]);
        // Addresses 0..=40 probed, nothing past the second lamp
        assert_eq!(driver.sent, 41);
    }

    #[test]
    fn scan_covers_the_whole_bus_when_fewer_lamps_exist() {
        let mut driver = CountingDriver {
            inner: DaliEmulator::with_gear(vec![EmulatedGear::new(12)]),
            sent: 0,
        };

        let found = {
            let mut dali = DaliManager::new(&mut driver);
            scan_lamps(&mut dali, 2)
        };

        assert_eq!(found, vec![12]);
        assert_eq!(driver.sent, 64);
    }

    #[test]
    fn probe_errors_mean_not_present() {
        let mut driver = DeadBusDriver;
        let mut dali = DaliManager::new(&mut driver);

        assert!(scan_lamps(&mut dali, 2).is_empty());
    }

    #[test]
    fn group_masks_are_inverted_into_memberships() {
        let mut emulator = DaliEmulator::with_gear(vec![
            EmulatedGear::new(3).in_groups(&[2, 9]),
            EmulatedGear::new(7).in_groups(&[2]),
        ]);
        let mut dali = DaliManager::new(&mut emulator);

        let groups = scan_groups(&mut dali, &[3, 7]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&2], vec![3, 7]);
        assert_eq!(groups[&9], vec![3]);
    }

    #[test]
    fn first_run_bootstraps_the_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.yaml");
        let mut names = DeviceNames::load(&path).unwrap();

        let mut emulator =
            DaliEmulator::with_gear(vec![EmulatedGear::new(0).in_groups(&[1])]);
        let mut dali = DaliManager::new(&mut emulator);
        let config = Config {
            dali_lamps: 1,
            ..Config::default()
        };

        build_table(&mut dali, &config, &mut names, &mut Outbox::new());

        let reloaded = DeviceNames::load(&path).unwrap();
        assert!(!reloaded.is_empty());
        assert_eq!(reloaded.friendly_name("lamp_0"), "lamp_0");
        assert_eq!(reloaded.friendly_name("group_1"), "group_1");
    }

    #[test]
    fn populated_names_file_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.yaml");
        std::fs::write(&path, "lamp_0:\n  friendly_name: Kitchen\n").unwrap();
        let mut names = DeviceNames::load(&path).unwrap();

        let mut emulator = DaliEmulator::with_gear(vec![
            EmulatedGear::new(0),
            EmulatedGear::new(1),
        ]);
        let mut dali = DaliManager::new(&mut emulator);
        let config = Config {
            dali_lamps: 2,
            ..Config::default()
        };

        let table = build_table(&mut dali, &config, &mut names, &mut Outbox::new());

        assert_eq!(table.lamps[&0].friendly_name, "Kitchen");
        assert_eq!(table.lamps[&1].friendly_name, "lamp_1"); // fallback, not persisted
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("lamp_1"));
    }

    #[test]
    fn clashing_names_fall_back_to_the_address_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.yaml");
        std::fs::write(
            &path,
            "lamp_0:\n  friendly_name: Same Name\nlamp_1:\n  friendly_name: Same Name\n",
        )
        .unwrap();
        let mut names = DeviceNames::load(&path).unwrap();

        let mut emulator = DaliEmulator::with_gear(vec![
            EmulatedGear::new(0),
            EmulatedGear::new(1),
        ]);
        let mut dali = DaliManager::new(&mut emulator);
        let config = Config {
            dali_lamps: 2,
            ..Config::default()
        };

        let table = build_table(&mut dali, &config, &mut names, &mut Outbox::new());

        assert_eq!(table.lamp_count(), 2);
        assert_eq!(table.lamps[&0].device_name, "same_name");
        assert_eq!(table.lamps[&1].device_name, "lamp_1");
    }
}
