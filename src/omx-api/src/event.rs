//! Events the lower layer reports through the expected and unexpected rings.
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::addr::EndpointAddr;
use crate::cmd::{ConnectStatus, RegionDescriptor, RNDV_DESCRIPTOR_SIZE};
use crate::{Error, EVENTQ_ENTRY_SIZE, TINY_MAX};

/// Tag of an event slot. `None` marks a slot the producer may fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    None = 0,
    SendMediumFragDone = 1,
    PullDone = 2,
    RecvConnectRequest = 3,
    RecvConnectReply = 4,
    RecvTiny = 5,
    RecvSmall = 6,
    RecvMedium = 7,
    RecvRndv = 8,
    RecvNotify = 9,
}

impl EventType {
    /// Decodes a slot tag. Anything out of range means the ring is corrupted.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => EventType::None,
            1 => EventType::SendMediumFragDone,
            2 => EventType::PullDone,
            3 => EventType::RecvConnectRequest,
            4 => EventType::RecvConnectReply,
            5 => EventType::RecvTiny,
            6 => EventType::RecvSmall,
            7 => EventType::RecvMedium,
            8 => EventType::RecvRndv,
            9 => EventType::RecvNotify,
            _ => panic!("unknown event type {}", tag),
        }
    }
}

/// Header of every sequenced message, as seen by its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMsgHeader {
    pub src: EndpointAddr,
    pub peer_index: u16,
    pub match_info: u64,
    pub seqnum: u16,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullDone {
    pub lib_cookie: u32,
    pub status: Result<(), Error>,
    pub pulled_length: u32,
    pub local_region: RegionDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvConnect {
    pub src: EndpointAddr,
    pub peer_index: u16,
    pub app_key: u32,
    pub connect_seqnum: u8,
    pub lib_cookie: u32,
    pub recv_seqnum_start: u16,
    pub status: ConnectStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvTiny {
    pub hdr: RecvMsgHeader,
    pub data: [u8; TINY_MAX],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvSmall {
    pub hdr: RecvMsgHeader,
    pub recvq_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMedium {
    pub hdr: RecvMsgHeader,
    pub frag_seqnum: u8,
    pub frag_length: u16,
    pub recvq_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRndv {
    pub hdr: RecvMsgHeader,
    pub data: [u8; RNDV_DESCRIPTOR_SIZE],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvNotify {
    pub src: EndpointAddr,
    pub peer_index: u16,
    pub total_length: u32,
    pub puller_region: RegionDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    None,
    SendMediumFragDone { sendq_page: u16 },
    PullDone(PullDone),
    RecvConnectRequest(RecvConnect),
    RecvConnectReply(RecvConnect),
    RecvTiny(RecvTiny),
    RecvSmall(RecvSmall),
    RecvMedium(RecvMedium),
    RecvRndv(RecvRndv),
    RecvNotify(RecvNotify),
}

impl Default for Event {
    fn default() -> Self {
        Event::None
    }
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::None => EventType::None,
            Event::SendMediumFragDone { .. } => EventType::SendMediumFragDone,
            Event::PullDone(_) => EventType::PullDone,
            Event::RecvConnectRequest(_) => EventType::RecvConnectRequest,
            Event::RecvConnectReply(_) => EventType::RecvConnectReply,
            Event::RecvTiny(_) => EventType::RecvTiny,
            Event::RecvSmall(_) => EventType::RecvSmall,
            Event::RecvMedium(_) => EventType::RecvMedium,
            Event::RecvRndv(_) => EventType::RecvRndv,
            Event::RecvNotify(_) => EventType::RecvNotify,
        }
    }

    /// Whether the event carries a payload in the receive data queue.
    pub fn uses_recvq(&self) -> bool {
        matches!(self, Event::RecvSmall(_) | Event::RecvMedium(_))
    }
}

/// Outcome of a blocking wait. The numeric values are shared with the lower layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WaitStatus {
    None = 0x00,
    Event = 0x01,
    Intr = 0x02,
    Timeout = 0x03,
    Race = 0x04,
    Progress = 0x05,
}

/// Arguments of a blocking wait: the ring positions the caller has already consumed
/// up to, and an optional deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitParam {
    pub next_exp_index: u64,
    pub next_unexp_index: u64,
    pub deadline: Option<Instant>,
}

mod sa {
    use super::*;
    use static_assertions::const_assert;
    use std::mem::size_of;

    const_assert!(size_of::<Event>() <= EVENTQ_ENTRY_SIZE);
    const_assert!(size_of::<WaitStatus>() == 1);
    const_assert!(size_of::<EventType>() == 1);
}
