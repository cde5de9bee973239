use std::cell::RefCell;
use tracing::{debug, trace};

use crate::dali_commands;
use crate::dali_manager::{DaliBusResult, DaliDriver, Result};

/// One emulated ballast. Levels are on the physical (bus-native) scale.
#[derive(Debug, Clone)]
pub struct EmulatedGear {
    pub short_address: u8,
    pub group_mask: u16,
    pub physical_minimum: u8,
    pub min_level: u8,
    pub max_level: u8,
    pub actual_level: u8,
}

impl EmulatedGear {
    pub fn new(short_address: u8) -> EmulatedGear {
        EmulatedGear {
            short_address,
            group_mask: 0,
            physical_minimum: 1,
            min_level: 1,
            max_level: 254,
            actual_level: 254,
        }
    }

    #[allow(dead_code)]
    pub fn with_bounds(mut self, physical_minimum: u8, min_level: u8, max_level: u8) -> Self {
        self.physical_minimum = physical_minimum;
        self.min_level = min_level;
        self.max_level = max_level;
        self
    }

    #[allow(dead_code)]
    pub fn with_level(mut self, actual_level: u8) -> Self {
        self.actual_level = actual_level;
        self
    }

    #[allow(dead_code)]
    pub fn in_groups(mut self, groups: &[u8]) -> Self {
        for group in groups {
            self.group_mask |= 1 << *group;
        }
        self
    }

    fn command(&mut self, command: u16) -> Option<u8> {
        match command {
            dali_commands::DALI_QUERY_CONTROL_GEAR_PRESENT => Some(0xff),
            dali_commands::DALI_QUERY_PHYSICAL_MINIMUM => Some(self.physical_minimum),
            dali_commands::DALI_QUERY_MIN_LEVEL => Some(self.min_level),
            dali_commands::DALI_QUERY_MAX_LEVEL => Some(self.max_level),
            dali_commands::DALI_QUERY_ACTUAL_LEVEL => Some(self.actual_level),
            dali_commands::DALI_QUERY_GROUPS_0_7 => Some((self.group_mask & 0xff) as u8),
            dali_commands::DALI_QUERY_GROUPS_8_15 => Some((self.group_mask >> 8) as u8),
            _ => {
                debug!(
                    "Emulated gear {} - unsupported command {:#04x}",
                    self.short_address, command
                );
                None
            }
        }
    }

    fn is_addressed_by(&self, b1: u8) -> bool {
        if b1 & 0b10000000 == 0 {
            (b1 >> 1) == self.short_address
        } else if (b1 & 0b11100000) == 0b10000000 {
            let group_mask: u16 = 1 << ((b1 & 0b00011110) >> 1);
            (group_mask & self.group_mask) != 0
        } else {
            true // broadcast
        }
    }

    // Receive a 2-byte DALI forward frame
    pub fn receive_2_bytes(&mut self, b1: u8, b2: u8) -> Option<u8> {
        if !self.is_addressed_by(b1) {
            return None;
        }

        if (b1 & 0x01) == 0 {
            // b2 is a light level (DAPC)
            trace!(
                "Emulated gear {} level set to {}",
                self.short_address,
                b2
            );
            self.actual_level = b2;
            None
        } else {
            self.command(b2 as u16)
        }
    }
}

pub struct DaliEmulator {
    gear: RefCell<Vec<EmulatedGear>>,
    emulate_timing: bool,
}

impl DaliEmulator {
    /// Runtime `dummy` driver: `lamp_count` ballasts at addresses 0.. with
    /// default bounds and real bus pacing.
    pub fn try_new(lamp_count: usize) -> Result<Box<dyn DaliDriver>> {
        let gear = (0..lamp_count)
            .map(|address| EmulatedGear::new(address as u8))
            .collect();

        Ok(Box::new(DaliEmulator {
            gear: RefCell::new(gear),
            emulate_timing: true,
        }))
    }

    #[allow(dead_code)]
    pub fn with_gear(gear: Vec<EmulatedGear>) -> DaliEmulator {
        DaliEmulator {
            gear: RefCell::new(gear),
            emulate_timing: false,
        }
    }

    #[allow(dead_code)]
    pub fn actual_level_of(&self, short_address: u8) -> Option<u8> {
        self.gear
            .borrow()
            .iter()
            .find(|gear| gear.short_address == short_address)
            .map(|gear| gear.actual_level)
    }

    fn send(&self, b1: u8, b2: u8) -> DaliBusResult {
        trace!("Emulated bus send {:#04x},{:#04x}", b1, b2);

        let mut result = DaliBusResult::None;

        for gear in self.gear.borrow_mut().iter_mut() {
            result = match gear.receive_2_bytes(b1, b2) {
                Some(x) => match result {
                    DaliBusResult::None => DaliBusResult::Value8(x),
                    DaliBusResult::Value8(_) => DaliBusResult::ReceiveCollision,
                    DaliBusResult::ReceiveCollision => DaliBusResult::ReceiveCollision,
                },
                _ => result,
            }
        }

        if self.emulate_timing {
            // Bus speed is 1200bps; a transaction (2 byte message + 1 byte reply,
            // stop bits included) is about 30 bits, so roughly 25 milliseconds
            std::thread::sleep(std::time::Duration::from_millis(25));
        }

        result
    }
}

impl DaliDriver for DaliEmulator {
    fn send_2_bytes(&mut self, b1: u8, b2: u8) -> Result<DaliBusResult> {
        Ok(self.send(b1, b2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_address_dapc_reaches_only_its_ballast() {
        let mut emulator = DaliEmulator::with_gear(vec![
            EmulatedGear::new(1).with_level(0),
            EmulatedGear::new(2).with_level(0),
        ]);

        emulator.send_2_bytes(1 << 1, 120).unwrap();

        assert_eq!(emulator.actual_level_of(1), Some(120));
        assert_eq!(emulator.actual_level_of(2), Some(0));
    }

    #[test]
    fn group_dapc_reaches_every_member() {
        let mut emulator = DaliEmulator::with_gear(vec![
            EmulatedGear::new(3).with_level(0).in_groups(&[2]),
            EmulatedGear::new(7).with_level(0).in_groups(&[2]),
            EmulatedGear::new(9).with_level(0),
        ]);

        emulator.send_2_bytes(0x80 | (2 << 1), 99).unwrap();

        assert_eq!(emulator.actual_level_of(3), Some(99));
        assert_eq!(emulator.actual_level_of(7), Some(99));
        assert_eq!(emulator.actual_level_of(9), Some(0));
    }

    #[test]
    fn two_answers_collide() {
        let mut emulator = DaliEmulator::with_gear(vec![
            EmulatedGear::new(3).in_groups(&[1]),
            EmulatedGear::new(4).in_groups(&[1]),
        ]);

        // Group-addressed query: both members answer
        let result = emulator
            .send_2_bytes(
                0x80 | (1 << 1) | 0x01,
                dali_commands::DALI_QUERY_ACTUAL_LEVEL as u8,
            )
            .unwrap();

        assert!(matches!(result, DaliBusResult::ReceiveCollision));
    }
}
