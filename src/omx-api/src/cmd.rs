//! Commands the engine submits to the lower layer.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::addr::{BoardAddr, EndpointAddr};
use crate::TINY_MAX;

/// Routing index used when the lower layer has not told us one yet.
pub const PEER_INDEX_UNKNOWN: u16 = u16::MAX;

pub const RNDV_DESCRIPTOR_SIZE: usize = 8;

/// Identifies one registration of a region on its owning endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub id: u8,
    pub seqnum: u8,
    pub offset: u16,
}

/// Body of a rendezvous message: what the receiver needs to pull the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RndvDescriptor {
    pub length: u32,
    pub region: RegionDescriptor,
}

impl RndvDescriptor {
    pub fn to_bytes(&self) -> [u8; RNDV_DESCRIPTOR_SIZE] {
        let mut buf = [0u8; RNDV_DESCRIPTOR_SIZE];
        buf[..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4] = self.region.id;
        buf[5] = self.region.seqnum;
        buf[6..].copy_from_slice(&self.region.offset.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RNDV_DESCRIPTOR_SIZE]) -> Self {
        RndvDescriptor {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            region: RegionDescriptor {
                id: buf[4],
                seqnum: buf[5],
                offset: u16::from_le_bytes([buf[6], buf[7]]),
            },
        }
    }
}

/// Fields every sequenced message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub dest: EndpointAddr,
    pub dest_peer_index: u16,
    pub match_info: u64,
    pub seqnum: u16,
    /// Total length of the message, not of this fragment.
    pub length: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SendTiny {
    pub hdr: MsgHeader,
    pub data: [u8; TINY_MAX],
}

#[derive(Debug, Clone, Copy)]
pub struct SendSmall<'a> {
    pub hdr: MsgHeader,
    pub data: &'a [u8],
}

/// One fragment of a medium message, staged in a send queue page.
#[derive(Debug, Clone, Copy)]
pub struct SendMediumFrag {
    pub hdr: MsgHeader,
    pub frag_seqnum: u8,
    pub frag_length: u16,
    pub sendq_page: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct SendRndv {
    pub hdr: MsgHeader,
    pub data: [u8; RNDV_DESCRIPTOR_SIZE],
}

/// Asks the lower layer to copy `length` bytes of a remote region into a local one.
#[derive(Debug, Clone, Copy)]
pub struct Pull {
    pub dest: EndpointAddr,
    pub dest_peer_index: u16,
    pub length: u32,
    pub remote: RegionDescriptor,
    pub local: RegionDescriptor,
    pub lib_cookie: u32,
}

/// Tells the owner of a pulled region that the transfer is over.
#[derive(Debug, Clone, Copy)]
pub struct Notify {
    pub dest: EndpointAddr,
    pub dest_peer_index: u16,
    pub total_length: u32,
    pub puller_region: RegionDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectStatus {
    Success = 0,
    BadKey = 1,
}

#[derive(Debug, Clone, Copy)]
pub struct Connect {
    pub dest_board: BoardAddr,
    pub dest_endpoint: u8,
    pub dest_peer_index: u16,
    pub app_key: u32,
    pub connect_seqnum: u8,
    pub lib_cookie: u32,
    /// Sequence number the requester expects on the first message from the target.
    pub recv_seqnum_start: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectReply {
    pub dest_board: BoardAddr,
    pub dest_endpoint: u8,
    pub dest_peer_index: u16,
    pub connect_seqnum: u8,
    pub lib_cookie: u32,
    pub recv_seqnum_start: u16,
    pub status: ConnectStatus,
}

#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    SendTiny(SendTiny),
    SendSmall(SendSmall<'a>),
    SendMediumFrag(SendMediumFrag),
    SendRndv(SendRndv),
    Pull(Pull),
    Notify(Notify),
    Connect(Connect),
    ConnectReply(ConnectReply),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    SendTiny,
    SendSmall,
    SendMediumFrag,
    SendRndv,
    Pull,
    Notify,
    Connect,
    ConnectReply,
}

impl Command<'_> {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SendTiny(_) => CommandKind::SendTiny,
            Command::SendSmall(_) => CommandKind::SendSmall,
            Command::SendMediumFrag(_) => CommandKind::SendMediumFrag,
            Command::SendRndv(_) => CommandKind::SendRndv,
            Command::Pull(_) => CommandKind::Pull,
            Command::Notify(_) => CommandKind::Notify,
            Command::Connect(_) => CommandKind::Connect,
            Command::ConnectReply(_) => CommandKind::ConnectReply,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandKind::SendTiny => "send tiny",
            CommandKind::SendSmall => "send small",
            CommandKind::SendMediumFrag => "send medium frag",
            CommandKind::SendRndv => "send rndv",
            CommandKind::Pull => "pull",
            CommandKind::Notify => "send notify",
            CommandKind::Connect => "send connect request",
            CommandKind::ConnectReply => "send connect reply",
        };
        f.write_str(s)
    }
}
