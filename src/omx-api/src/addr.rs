use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// 48-bit hardware address of a board, printed as `xx:xx:xx:xx:xx:xx`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoardAddr(pub u64);

impl BoardAddr {
    pub const BROADCAST: BoardAddr = BoardAddr(0xffff_ffff_ffff);
}

impl fmt::Display for BoardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            (a >> 40) as u8,
            (a >> 32) as u8,
            (a >> 24) as u8,
            (a >> 16) as u8,
            (a >> 8) as u8,
            a as u8
        )
    }
}

impl FromStr for BoardAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = 0u64;
        let mut bytes = 0;
        for part in s.split(':') {
            if bytes == 6 || part.is_empty() || part.len() > 2 {
                return Err(Error::BadInfoAddress);
            }
            let byte = u8::from_str_radix(part, 16).map_err(|_| Error::BadInfoAddress)?;
            addr = (addr << 8) | byte as u64;
            bytes += 1;
        }
        if bytes != 6 {
            return Err(Error::BadInfoAddress);
        }
        Ok(BoardAddr(addr))
    }
}

/// Name of a remote endpoint as seen by a local one.
///
/// The session id is the one the remote endpoint handed out when the connection was
/// established; every message sent to it carries that id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddr {
    pub board_addr: BoardAddr,
    pub endpoint_index: u8,
    pub session_id: u32,
}

impl EndpointAddr {
    #[inline]
    pub fn new(board_addr: BoardAddr, endpoint_index: u8, session_id: u32) -> Self {
        EndpointAddr {
            board_addr,
            endpoint_index,
            session_id,
        }
    }

    /// The (board, endpoint) pair, ignoring the session.
    #[inline]
    pub fn key(&self) -> (BoardAddr, u8) {
        (self.board_addr, self.endpoint_index)
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ep {} session {:#x}",
            self.board_addr, self.endpoint_index, self.session_id
        )
    }
}
