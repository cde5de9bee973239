use error_stack::{Report, ResultExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, trace};

use crate::dali_manager::{self, DaliBusResult, DaliDriver, DaliManagerError};
use crate::get_version;

#[derive(Debug, Error)]
pub enum HassebError {
    #[error("hidraw I/O error: {0}")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),

    #[error("Short reply from interface ({0} bytes)")]
    ShortReply(usize),

    #[error("Unexpected reply status: {0:#04x}")]
    UnexpectedStatus(u8),
}

pub type Result<T> = std::result::Result<T, Report<HassebError>>;

/// hasseb DALI master: a USB HID device exposing the bus as 2-byte
/// reports on a hidraw node. One report out per forward frame; the reply
/// report carries a status byte and the backward frame, if any.
pub struct Hasseb {
    device: File,
}

const NO_ANSWER: u8 = 0x00;
const ANSWER: u8 = 0x01;
const FRAMING_ERROR: u8 = 0x02;

impl Hasseb {
    const IDLE_TIME_MILLISECONDS: u64 = 10;

    pub fn try_new(path: &Path) -> dali_manager::Result<Box<dyn DaliDriver>> {
        let into_context = || {
            DaliManagerError::Context(format!("Opening hasseb interface {}", path.display()))
        };

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .change_context_lazy(into_context)?;

        println!("{}", get_version());
        info!("hasseb DALI master on {}", path.display());

        Ok(Box::new(Hasseb { device }))
    }

    fn transact(&mut self, b1: u8, b2: u8) -> Result<DaliBusResult> {
        // The interface needs a settle period between transactions
        std::thread::sleep(Duration::from_millis(Hasseb::IDLE_TIME_MILLISECONDS));

        self.device.write_all(&[b1, b2]).map_err(HassebError::from)?;

        let mut reply = [0u8; 2];
        let bytes_read = self.device.read(&mut reply).map_err(HassebError::from)?;

        if bytes_read < reply.len() {
            return Err(HassebError::ShortReply(bytes_read).into());
        }

        trace!("hasseb reply: {:#04x} {:#04x}", reply[0], reply[1]);

        match reply[0] {
            NO_ANSWER => Ok(DaliBusResult::None),
            ANSWER => Ok(DaliBusResult::Value8(reply[1])),
            FRAMING_ERROR => Ok(DaliBusResult::ReceiveCollision),
            status => Err(HassebError::UnexpectedStatus(status).into()),
        }
    }
}

impl DaliDriver for Hasseb {
    fn send_2_bytes(&mut self, b1: u8, b2: u8) -> dali_manager::Result<DaliBusResult> {
        let into_context = || {
            DaliManagerError::Context(format!(
                "Sending 2 bytes to hasseb interface ({b1},{b2})"
            ))
        };

        self.transact(b1, b2).change_context_lazy(into_context)
    }
}
