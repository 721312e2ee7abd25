//! Remote endpoints known to an endpoint and their sequence state.
use std::collections::VecDeque;

use fnv::FnvHashMap;

use omx_api::addr::{BoardAddr, EndpointAddr};
use omx_api::cmd::{RndvDescriptor, PEER_INDEX_UNKNOWN};
use omx_api::event::RecvMsgHeader;
use omx_api::SEQNUM_MASK;

#[inline]
pub fn seqnum_next(seqnum: u16) -> u16 {
    seqnum.wrapping_add(1) & SEQNUM_MASK
}

#[inline]
pub fn seqnum_prev(seqnum: u16) -> u16 {
    seqnum.wrapping_sub(1) & SEQNUM_MASK
}

/// Distance from `from` forward to `to`, modulo the sequence space.
#[inline]
pub fn seqnum_delta(to: u16, from: u16) -> u16 {
    to.wrapping_sub(from) & SEQNUM_MASK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    InOrder,
    /// Ahead of what we expect, kept until the gap is filled.
    Early,
    /// Behind what we expect, already delivered.
    Duplicate,
}

/// Stable index of a partner in its endpoint's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartnerIndex(pub(crate) u32);

/// Payload of a message received ahead of its turn.
#[derive(Debug, Clone)]
pub(crate) enum EarlyPayload {
    Data(Vec<u8>),
    MediumFrag { frag_seqnum: u8, data: Vec<u8> },
    Rndv(RndvDescriptor),
}

#[derive(Debug, Clone)]
pub(crate) struct EarlyPacket {
    pub(crate) hdr: RecvMsgHeader,
    pub(crate) payload: EarlyPayload,
}

#[derive(Debug)]
pub struct Partner {
    /// The session is the remote endpoint's, it is stamped on every message we send.
    pub addr: EndpointAddr,
    /// Routing index cached from the lower layer.
    pub peer_index: u16,
    pub next_send_seq: u16,
    pub next_match_recv_seq: u16,
    pub connect_seqnum: u8,
    pub(crate) early: VecDeque<EarlyPacket>,
}

impl Partner {
    fn new(addr: EndpointAddr, peer_index: u16) -> Self {
        Partner {
            addr,
            peer_index,
            next_send_seq: 0,
            next_match_recv_seq: 0,
            connect_seqnum: 0,
            early: VecDeque::new(),
        }
    }

    pub fn check_recv_seq(&self, seqnum: u16) -> SeqCheck {
        let delta = seqnum_delta(seqnum, self.next_match_recv_seq);
        if delta == 0 {
            SeqCheck::InOrder
        } else if delta <= SEQNUM_MASK / 2 {
            SeqCheck::Early
        } else {
            SeqCheck::Duplicate
        }
    }

    pub(crate) fn stash_early(&mut self, packet: EarlyPacket) {
        tracing::debug!(
            "stashing early packet seqnum {} from {} (expecting {})",
            packet.hdr.seqnum,
            self.addr,
            self.next_match_recv_seq
        );
        self.early.push_back(packet);
    }

    /// Takes a stashed packet that can be processed now: the next message in order,
    /// or another fragment of the message that was just matched.
    pub(crate) fn take_early(&mut self) -> Option<EarlyPacket> {
        let next = self.next_match_recv_seq;
        let prev = seqnum_prev(next);
        let pos = self.early.iter().position(|p| {
            p.hdr.seqnum == next
                || (p.hdr.seqnum == prev && matches!(p.payload, EarlyPayload::MediumFrag { .. }))
        })?;
        self.early.remove(pos)
    }

    /// Adopts the session announced during a connect handshake.
    ///
    /// `send_seq_start` is where the remote endpoint expects our next message. It is
    /// only applied on a session change, an established session keeps its counters.
    /// Returns whether the session changed.
    pub(crate) fn update_session(&mut self, addr: EndpointAddr, send_seq_start: u16) -> bool {
        if self.addr.session_id == addr.session_id {
            return false;
        }
        if self.addr.session_id != 0 {
            self.reset(addr);
        }
        self.addr = addr;
        self.next_send_seq = send_seq_start;
        true
    }

    /// Forgets everything about a previous incarnation of the remote endpoint.
    pub(crate) fn reset(&mut self, addr: EndpointAddr) {
        tracing::info!("partner {} replaced by new session {:#x}", self.addr, addr.session_id);
        self.addr = addr;
        self.next_send_seq = 0;
        self.next_match_recv_seq = 0;
        self.early.clear();
    }
}

#[derive(Debug, Default)]
pub struct PartnerTable {
    partners: Vec<Partner>,
    index: FnvHashMap<(BoardAddr, u8), PartnerIndex>,
}

impl PartnerTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn lookup(&self, board_addr: BoardAddr, endpoint_index: u8) -> Option<PartnerIndex> {
        self.index.get(&(board_addr, endpoint_index)).copied()
    }

    /// Finds the partner for `addr`, creating it on first contact.
    pub fn get_or_insert(&mut self, addr: EndpointAddr, peer_index: u16) -> PartnerIndex {
        if let Some(pidx) = self.lookup(addr.board_addr, addr.endpoint_index) {
            let partner = &mut self.partners[pidx.0 as usize];
            if partner.peer_index == PEER_INDEX_UNKNOWN {
                partner.peer_index = peer_index;
            }
            return pidx;
        }
        let pidx = PartnerIndex(self.partners.len() as u32);
        tracing::debug!("new partner {} at index {}", addr, pidx.0);
        self.partners.push(Partner::new(addr, peer_index));
        self.index.insert(addr.key(), pidx);
        pidx
    }

    #[inline]
    pub fn get(&self, pidx: PartnerIndex) -> &Partner {
        &self.partners[pidx.0 as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, pidx: PartnerIndex) -> &mut Partner {
        &mut self.partners[pidx.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.partners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partners.is_empty()
    }
}
