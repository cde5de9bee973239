use error_stack::{Report, ResultExt};
use std::io::{Read, Write};
use std::net::TcpStream;
use thiserror::Error;
use tracing::{info, trace};

use crate::dali_manager::{self, DaliBusResult, DaliDriver, DaliManagerError};
use crate::get_version;

#[derive(Debug, Error)]
pub enum DaliServerError {
    #[error("Socket I/O error: {0}")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),

    #[error("Unexpected reply status: {0:#04x}")]
    UnexpectedStatus(u8),
}

pub type Result<T> = std::result::Result<T, Report<DaliServerError>>;

/// daliserver TCP gateway. Each forward frame is one 4-byte message
/// (version, flags, address byte, opcode/level); the reply is 4 bytes
/// with the outcome in byte 1 and the backward frame in byte 3.
pub struct DaliServer {
    stream: TcpStream,
}

const PROTOCOL_VERSION: u8 = 0x02;

const STATUS_ANSWER: u8 = 0x00;
const STATUS_FRAMING_ERROR: u8 = 0x01;
const STATUS_NO_ANSWER: u8 = 0x02;

impl DaliServer {
    pub fn try_new(address: &str) -> dali_manager::Result<Box<dyn DaliDriver>> {
        let into_context =
            || DaliManagerError::Context(format!("Connecting to daliserver at {address}"));

        let stream = TcpStream::connect(address).change_context_lazy(into_context)?;

        println!("{}", get_version());
        info!("Connected to daliserver at {}", address);

        Ok(Box::new(DaliServer { stream }))
    }

    fn transact(&mut self, b1: u8, b2: u8) -> Result<DaliBusResult> {
        self.stream
            .write_all(&[PROTOCOL_VERSION, 0x00, b1, b2])
            .map_err(DaliServerError::from)?;

        let mut reply = [0u8; 4];
        self.stream
            .read_exact(&mut reply)
            .map_err(DaliServerError::from)?;

        trace!("daliserver reply: {:?}", reply);

        match reply[1] {
            STATUS_ANSWER => Ok(DaliBusResult::Value8(reply[3])),
            STATUS_FRAMING_ERROR => Ok(DaliBusResult::ReceiveCollision),
            STATUS_NO_ANSWER => Ok(DaliBusResult::None),
            status => Err(DaliServerError::UnexpectedStatus(status).into()),
        }
    }
}

impl DaliDriver for DaliServer {
    fn send_2_bytes(&mut self, b1: u8, b2: u8) -> dali_manager::Result<DaliBusResult> {
        let into_context = || {
            DaliManagerError::Context(format!(
                "Sending 2 bytes to daliserver ({b1},{b2})"
            ))
        };

        self.transact(b1, b2).change_context_lazy(into_context)
    }
}
