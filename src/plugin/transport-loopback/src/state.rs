//! Boards and the endpoints open on them.
use std::sync::Arc;

use fnv::FnvHashMap as HashMap;

use ipc::{EventQueues, SendQueue};
use omx::RegionMemory;
use omx_api::addr::{BoardAddr, EndpointAddr};
use omx_api::cmd::RegionDescriptor;
use omx_api::Handle;

use crate::config::LoopbackConfig;
use crate::Error;

pub(crate) struct EndpointSlot {
    pub(crate) addr: EndpointAddr,
    pub(crate) queues: Arc<EventQueues>,
    pub(crate) sendq: Arc<SendQueue>,
    pub(crate) regions: HashMap<u8, (RegionDescriptor, RegionMemory)>,
}

impl EndpointSlot {
    /// The memory registered under `desc`, if `desc` is still current.
    pub(crate) fn region(&self, desc: &RegionDescriptor) -> Result<&RegionMemory, Error> {
        match self.regions.get(&desc.id) {
            Some((current, memory)) if current.seqnum == desc.seqnum => Ok(memory),
            _ => Err(Error::BadRegion(desc.id)),
        }
    }
}

pub(crate) struct Board {
    pub(crate) addr: BoardAddr,
    pub(crate) endpoints: Vec<Option<EndpointSlot>>,
}

pub(crate) struct State {
    pub(crate) boards: Vec<Board>,
    index: HashMap<BoardAddr, u8>,
}

impl State {
    pub(crate) fn new(config: &LoopbackConfig) -> Self {
        let boards: Vec<_> = (0..config.boards)
            .map(|i| Board {
                addr: BoardAddr(config.board_addr_base + i as u64),
                endpoints: (0..config.endpoints_per_board).map(|_| None).collect(),
            })
            .collect();
        let index = boards
            .iter()
            .enumerate()
            .map(|(i, b)| (b.addr, i as u8))
            .collect();
        State { boards, index }
    }

    pub(crate) fn board(&self, board_index: u8) -> Result<&Board, Error> {
        self.boards
            .get(board_index as usize)
            .ok_or(Error::NoSuchBoard(board_index))
    }

    pub(crate) fn board_mut(&mut self, board_index: u8) -> Result<&mut Board, Error> {
        self.boards
            .get_mut(board_index as usize)
            .ok_or(Error::NoSuchBoard(board_index))
    }

    /// The open endpoint named by `ep`.
    pub(crate) fn endpoint(&self, ep: Handle) -> Result<&EndpointSlot, Error> {
        self.board(ep.board_index())?
            .endpoints
            .get(ep.endpoint_index() as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::NotOpen)
    }

    pub(crate) fn endpoint_mut(&mut self, ep: Handle) -> Result<&mut EndpointSlot, Error> {
        self.board_mut(ep.board_index())?
            .endpoints
            .get_mut(ep.endpoint_index() as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::NotOpen)
    }

    /// Where packets for `board_addr`/`endpoint_index` go.
    pub(crate) fn lookup(
        &self,
        board_addr: BoardAddr,
        endpoint_index: u8,
    ) -> Result<&EndpointSlot, Error> {
        let closed = || Error::Closed(board_addr, endpoint_index);
        let board_index = *self.index.get(&board_addr).ok_or_else(closed)?;
        self.boards[board_index as usize]
            .endpoints
            .get(endpoint_index as usize)
            .and_then(Option::as_ref)
            .ok_or_else(closed)
    }

    /// Like `lookup`, also requiring the session the sender believes in.
    pub(crate) fn destination(&self, dest: &EndpointAddr) -> Result<&EndpointSlot, Error> {
        let slot = self.lookup(dest.board_addr, dest.endpoint_index)?;
        if slot.addr.session_id != dest.session_id {
            return Err(Error::BadSession(dest.session_id));
        }
        Ok(slot)
    }
}
