use error_stack::{Report, ResultExt};
use thiserror::Error;
use tracing::trace;

use crate::dali_commands;

#[derive(Debug, Clone, Copy)]
pub enum DaliBusResult {
    None,
    ReceiveCollision,
    Value8(u8),
}

#[derive(Debug, Error)]
pub enum DaliManagerError {
    #[error("Invalid short address: {0}")]
    ShortAddress(u8),

    #[error("Invalid group address: {0}")]
    GroupAddress(u8),

    #[error("Invalid command: {0}")]
    Command(u16),

    #[error("Unexpected reply {0:?}")]
    UnexpectedReply(DaliBusResult),

    #[error("In context of '{0}'")]
    Context(String),
}

pub type Result<T> = error_stack::Result<T, DaliManagerError>;

/// Transport seam to the DALI bus hardware. A frame is the standard
/// forward message: address byte + opcode-or-level byte; the reply is
/// whatever backward frame the gear put on the bus, if any.
pub trait DaliDriver {
    fn send_2_bytes(&mut self, b1: u8, b2: u8) -> Result<DaliBusResult>;
}

pub struct DaliManager<'a> {
    pub driver: &'a mut dyn DaliDriver,
}

impl<'manager> DaliManager<'manager> {
    pub fn new(driver: &'manager mut dyn DaliDriver) -> DaliManager<'manager> {
        DaliManager { driver }
    }

    fn to_command_short_address(short_address: u8) -> u8 {
        DaliManager::to_light_short_address(short_address) | 0x01
    }

    fn to_light_short_address(short_address: u8) -> u8 {
        if short_address < 64 {
            short_address << 1
        } else {
            panic!("Invalid DALI short address {}", short_address)
        }
    }

    fn to_light_group_address(group_address: u8) -> u8 {
        if group_address < 16 {
            0x80 | (group_address << 1)
        } else {
            panic!("Invalid DALI group# {}", group_address)
        }
    }

    /// DAPC to one ballast: the payload byte is the raw physical level.
    pub fn set_light_brightness(&mut self, short_address: u8, level: u8) -> Result<DaliBusResult> {
        self.driver
            .send_2_bytes(DaliManager::to_light_short_address(short_address), level)
    }

    /// DAPC broadcast to every member of a DALI group.
    pub fn set_group_brightness(&mut self, group_address: u8, level: u8) -> Result<DaliBusResult> {
        self.driver
            .send_2_bytes(DaliManager::to_light_group_address(group_address), level)
    }

    fn send_command_to_address(&mut self, command: u16, short_address: u8) -> Result<DaliBusResult> {
        if command > 0xff {
            return Err(Report::new(DaliManagerError::Command(command)));
        }
        if short_address >= 64 {
            return Err(Report::new(DaliManagerError::ShortAddress(short_address)));
        }

        let b1 = DaliManager::to_command_short_address(short_address);
        let b2 = (command & 0xff) as u8;

        self.driver.send_2_bytes(b1, b2)
    }

    fn query_value8(&mut self, command: u16, short_address: u8, what: &str) -> Result<u8> {
        let into_context =
            || DaliManagerError::Context(format!("Querying {} of lamp {}", what, short_address));

        match self
            .send_command_to_address(command, short_address)
            .change_context_lazy(into_context)?
        {
            DaliBusResult::Value8(v) => Ok(v),
            bus_result => Err(DaliManagerError::UnexpectedReply(bus_result))
                .change_context_lazy(into_context),
        }
    }

    /// Presence probe. No backward frame means no gear at this address.
    pub fn is_gear_present(&mut self, short_address: u8) -> Result<bool> {
        let reply = self.send_command_to_address(
            dali_commands::DALI_QUERY_CONTROL_GEAR_PRESENT,
            short_address,
        )?;

        trace!("Presence probe {}: {:?}", short_address, reply);

        match reply {
            DaliBusResult::None => Ok(false),
            DaliBusResult::Value8(_) => Ok(true),
            bus_result => Err(Report::new(DaliManagerError::UnexpectedReply(bus_result))),
        }
    }

    pub fn query_actual_level(&mut self, short_address: u8) -> Result<u8> {
        self.query_value8(
            dali_commands::DALI_QUERY_ACTUAL_LEVEL,
            short_address,
            "actual level",
        )
    }

    pub fn query_min_level(&mut self, short_address: u8) -> Result<u8> {
        self.query_value8(
            dali_commands::DALI_QUERY_MIN_LEVEL,
            short_address,
            "min level",
        )
    }

    pub fn query_max_level(&mut self, short_address: u8) -> Result<u8> {
        self.query_value8(
            dali_commands::DALI_QUERY_MAX_LEVEL,
            short_address,
            "max level",
        )
    }

    pub fn query_physical_minimum(&mut self, short_address: u8) -> Result<u8> {
        self.query_value8(
            dali_commands::DALI_QUERY_PHYSICAL_MINIMUM,
            short_address,
            "physical minimum",
        )
    }

    /// Both membership bitmask halves: bit n set means member of group n.
    pub fn query_group_mask(&mut self, short_address: u8) -> Result<u16> {
        let low = self.query_value8(
            dali_commands::DALI_QUERY_GROUPS_0_7,
            short_address,
            "groups 0-7",
        )?;
        let high = self.query_value8(
            dali_commands::DALI_QUERY_GROUPS_8_15,
            short_address,
            "groups 8-15",
        )?;

        Ok(((high as u16) << 8) | low as u16)
    }
}
