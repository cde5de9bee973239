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
pub enum TridonicError {
    #[error("hidraw I/O error: {0}")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),

    #[error("Short reply from interface ({0} bytes)")]
    ShortReply(usize),

    #[error("Reply for unexpected sequence number (expected {0}, got {1})")]
    SequenceMismatch(u8, u8),

    #[error("Unexpected reply type: {0:#04x}")]
    UnexpectedReplyType(u8),
}

pub type Result<T> = std::result::Result<T, Report<TridonicError>>;

/// Tridonic DALI USB interface: fixed-size HID reports on a hidraw node.
/// Outgoing report: [direction, sequence, mode, address byte, opcode/level],
/// zero padded. Reply report: [sequence, type, backward frame].
pub struct Tridonic {
    device: File,
    sequence: u8,
}

const REPORT_SIZE: usize = 64;

const DIRECTION_HOST_TO_BUS: u8 = 0x12;
const MODE_SEND16: u8 = 0x03;

const REPLY_NO_ANSWER: u8 = 0x71;
const REPLY_ANSWER: u8 = 0x72;
const REPLY_FRAMING_ERROR: u8 = 0x77;

impl Tridonic {
    const IDLE_TIME_MILLISECONDS: u64 = 10;

    pub fn try_new(path: &Path) -> dali_manager::Result<Box<dyn DaliDriver>> {
        let into_context = || {
            DaliManagerError::Context(format!("Opening tridonic interface {}", path.display()))
        };

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .change_context_lazy(into_context)?;

        println!("{}", get_version());
        info!("Tridonic DALI USB on {}", path.display());

        Ok(Box::new(Tridonic {
            device,
            sequence: 0,
        }))
    }

    fn transact(&mut self, b1: u8, b2: u8) -> Result<DaliBusResult> {
        std::thread::sleep(Duration::from_millis(Tridonic::IDLE_TIME_MILLISECONDS));

        self.sequence = self.sequence.wrapping_add(1);

        let mut report = [0u8; REPORT_SIZE];
        report[0] = DIRECTION_HOST_TO_BUS;
        report[1] = self.sequence;
        report[2] = MODE_SEND16;
        report[3] = b1;
        report[4] = b2;

        self.device.write_all(&report).map_err(TridonicError::from)?;

        let mut reply = [0u8; REPORT_SIZE];
        let bytes_read = self.device.read(&mut reply).map_err(TridonicError::from)?;

        if bytes_read < 3 {
            return Err(TridonicError::ShortReply(bytes_read).into());
        }

        trace!(
            "tridonic reply: seq {:#04x} type {:#04x} value {:#04x}",
            reply[0],
            reply[1],
            reply[2]
        );

        if reply[0] != self.sequence {
            return Err(TridonicError::SequenceMismatch(self.sequence, reply[0]).into());
        }

        match reply[1] {
            REPLY_NO_ANSWER => Ok(DaliBusResult::None),
            REPLY_ANSWER => Ok(DaliBusResult::Value8(reply[2])),
            REPLY_FRAMING_ERROR => Ok(DaliBusResult::ReceiveCollision),
            reply_type => Err(TridonicError::UnexpectedReplyType(reply_type).into()),
        }
    }
}

impl DaliDriver for Tridonic {
    fn send_2_bytes(&mut self, b1: u8, b2: u8) -> dali_manager::Result<DaliBusResult> {
        let into_context = || {
            DaliManagerError::Context(format!(
                "Sending 2 bytes to tridonic interface ({b1},{b2})"
            ))
        };

        self.transact(b1, b2).change_context_lazy(into_context)
    }
}
