use std::sync::Arc;

use fnv::FnvHashMap as HashMap;

use ipc::{EventQueues, SendQueue};
use omx::{Driver, EndpointInfo, RegionMemory};
use omx_api::addr::{BoardAddr, EndpointAddr};
use omx_api::cmd::{Command, ConnectStatus, MsgHeader, RegionDescriptor};
use omx_api::event::{
    Event, PullDone, RecvConnect, RecvMedium, RecvMsgHeader, RecvNotify, RecvRndv, RecvSmall,
    RecvTiny, WaitParam, WaitStatus,
};
use omx_api::{Handle, Result};

use crate::config::LoopbackConfig;
use crate::state::{EndpointSlot, State};
use crate::Error;

/// Boards living in this process. Every submitted command is carried out before
/// `submit` returns.
pub struct LoopbackFabric {
    config: LoopbackConfig,
    state: spin::Mutex<State>,
}

impl LoopbackFabric {
    pub fn new(config: LoopbackConfig) -> Self {
        let state = State::new(&config);
        LoopbackFabric {
            config,
            state: spin::Mutex::new(state),
        }
    }

    #[inline]
    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    pub fn board_addr(&self, board_index: u8) -> Option<BoardAddr> {
        self.state
            .lock()
            .board(board_index)
            .ok()
            .map(|board| board.addr)
    }

    pub fn open_endpoints(&self) -> usize {
        self.state
            .lock()
            .boards
            .iter()
            .flat_map(|b| b.endpoints.iter())
            .filter(|slot| slot.is_some())
            .count()
    }

    fn queues(&self, ep: Handle) -> std::result::Result<Arc<EventQueues>, Error> {
        Ok(Arc::clone(&self.state.lock().endpoint(ep)?.queues))
    }
}

fn recv_header(src: &EndpointSlot, peer_index: u16, hdr: &MsgHeader) -> RecvMsgHeader {
    RecvMsgHeader {
        src: src.addr,
        peer_index,
        match_info: hdr.match_info,
        seqnum: hdr.seqnum,
        length: hdr.length,
    }
}

/// Copies up to `length` bytes from a region of `remote` into a region of `local`.
fn pull(
    remote: &EndpointSlot,
    remote_region: &RegionDescriptor,
    local: &EndpointSlot,
    local_region: &RegionDescriptor,
    length: u32,
) -> std::result::Result<u32, Error> {
    let src = remote.region(remote_region)?;
    let dst = local.region(local_region)?;
    // one region lock at a time
    let data = {
        let segs = src.lock();
        let offset = remote_region.offset as usize;
        let len = (length as usize).min(segs.total_length().saturating_sub(offset));
        let mut data = vec![0u8; len];
        segs.copy_from_segments_at(offset, &mut data);
        data
    };
    let mut segs = dst.lock();
    let offset = local_region.offset as usize;
    let len = data.len().min(segs.total_length().saturating_sub(offset));
    segs.copy_to_segments_at(offset, &data[..len]);
    Ok(len as u32)
}

impl LoopbackFabric {
    fn do_open(
        &self,
        board_index: u8,
        endpoint_index: u8,
        queues: Arc<EventQueues>,
        sendq: Arc<SendQueue>,
    ) -> std::result::Result<EndpointInfo, Error> {
        let mut state = self.state.lock();
        let board = state.board_mut(board_index)?;
        let board_addr = board.addr;
        let slot = board
            .endpoints
            .get_mut(endpoint_index as usize)
            .ok_or(Error::BadEndpointIndex(endpoint_index))?;
        if slot.is_some() {
            return Err(Error::EndpointBusy(endpoint_index));
        }
        let session_id = fastrand::u32(1..);
        *slot = Some(EndpointSlot {
            addr: EndpointAddr::new(board_addr, endpoint_index, session_id),
            queues,
            sendq,
            regions: HashMap::default(),
        });
        tracing::debug!(
            "loopback endpoint {} open on board {} (session {:#x})",
            endpoint_index,
            board_addr,
            session_id
        );
        Ok(EndpointInfo {
            board_addr,
            session_id,
        })
    }

    fn do_close(&self, ep: Handle) -> std::result::Result<(), Error> {
        let mut state = self.state.lock();
        let board = state.board_mut(ep.board_index())?;
        let slot = board
            .endpoints
            .get_mut(ep.endpoint_index() as usize)
            .and_then(Option::take)
            .ok_or(Error::NotOpen)?;
        if !slot.regions.is_empty() {
            tracing::debug!(
                "endpoint {} closed with {} regions registered",
                slot.addr,
                slot.regions.len()
            );
        }
        slot.queues.interrupt();
        Ok(())
    }

    fn do_submit(&self, ep: Handle, cmd: &Command<'_>) -> std::result::Result<(), Error> {
        let state = self.state.lock();
        let src = state.endpoint(ep)?;
        let peer_index = ep.board_index() as u16;

        match *cmd {
            Command::SendTiny(c) => {
                let dst = state.destination(&c.hdr.dest)?;
                dst.queues.notify_unexp(Event::RecvTiny(RecvTiny {
                    hdr: recv_header(src, peer_index, &c.hdr),
                    data: c.data,
                }))?;
            }
            Command::SendSmall(c) => {
                let dst = state.destination(&c.hdr.dest)?;
                let recvq_index = dst.queues.prepare_unexp_with_recvq()?;
                dst.queues.write_recvq(recvq_index, c.data);
                dst.queues.commit_unexp_with_recvq(Event::RecvSmall(RecvSmall {
                    hdr: recv_header(src, peer_index, &c.hdr),
                    recvq_index,
                }));
            }
            Command::SendMediumFrag(c) => {
                let dst = state.destination(&c.hdr.dest)?;
                let recvq_index = dst.queues.prepare_unexp_with_recvq()?;
                src.sendq
                    .with_page(c.sendq_page as usize, c.frag_length as usize, |data| {
                        dst.queues.write_recvq(recvq_index, data)
                    });
                dst.queues.commit_unexp_with_recvq(Event::RecvMedium(RecvMedium {
                    hdr: recv_header(src, peer_index, &c.hdr),
                    frag_seqnum: c.frag_seqnum,
                    frag_length: c.frag_length,
                    recvq_index,
                }));
                // the page is free again as soon as it was copied
                if let Err(e) = src.queues.notify_exp(Event::SendMediumFragDone {
                    sendq_page: c.sendq_page,
                }) {
                    tracing::error!("losing completion of sendq page {}: {}", c.sendq_page, e);
                }
            }
            Command::SendRndv(c) => {
                let dst = state.destination(&c.hdr.dest)?;
                dst.queues.notify_unexp(Event::RecvRndv(RecvRndv {
                    hdr: recv_header(src, peer_index, &c.hdr),
                    data: c.data,
                }))?;
            }
            Command::Pull(c) => {
                let remote = state.destination(&c.dest)?;
                let (status, pulled_length): (Result<()>, u32) =
                    match pull(remote, &c.remote, src, &c.local, c.length) {
                        Ok(len) => (Ok(()), len),
                        Err(e) => {
                            tracing::debug!("pull from {} failed: {}", c.dest, e);
                            (Err(e.into()), 0)
                        }
                    };
                src.queues.notify_exp(Event::PullDone(PullDone {
                    lib_cookie: c.lib_cookie,
                    status,
                    pulled_length,
                    local_region: c.local,
                }))?;
            }
            Command::Notify(c) => {
                let dst = state.destination(&c.dest)?;
                dst.queues.notify_unexp(Event::RecvNotify(RecvNotify {
                    src: src.addr,
                    peer_index,
                    total_length: c.total_length,
                    puller_region: c.puller_region,
                }))?;
            }
            Command::Connect(c) => {
                let dst = state.lookup(c.dest_board, c.dest_endpoint)?;
                dst.queues
                    .notify_unexp(Event::RecvConnectRequest(RecvConnect {
                        src: src.addr,
                        peer_index,
                        app_key: c.app_key,
                        connect_seqnum: c.connect_seqnum,
                        lib_cookie: c.lib_cookie,
                        recv_seqnum_start: c.recv_seqnum_start,
                        status: ConnectStatus::Success,
                    }))?;
            }
            Command::ConnectReply(c) => {
                let dst = state.lookup(c.dest_board, c.dest_endpoint)?;
                dst.queues.notify_unexp(Event::RecvConnectReply(RecvConnect {
                    src: src.addr,
                    peer_index,
                    app_key: 0,
                    connect_seqnum: c.connect_seqnum,
                    lib_cookie: c.lib_cookie,
                    recv_seqnum_start: c.recv_seqnum_start,
                    status: c.status,
                }))?;
            }
        }
        Ok(())
    }

    fn do_register(
        &self,
        ep: Handle,
        region: RegionDescriptor,
        memory: RegionMemory,
    ) -> std::result::Result<(), Error> {
        let mut state = self.state.lock();
        let slot = state.endpoint_mut(ep)?;
        if slot.regions.contains_key(&region.id) {
            return Err(Error::RegionBusy(region.id));
        }
        slot.regions.insert(region.id, (region, memory));
        Ok(())
    }

    fn do_deregister(&self, ep: Handle, region: RegionDescriptor) -> std::result::Result<(), Error> {
        let mut state = self.state.lock();
        let slot = state.endpoint_mut(ep)?;
        slot.region(&region)?;
        slot.regions.remove(&region.id);
        Ok(())
    }
}

impl Driver for LoopbackFabric {
    fn open_endpoint(
        &self,
        board_index: u8,
        endpoint_index: u8,
        queues: Arc<EventQueues>,
        sendq: Arc<SendQueue>,
    ) -> Result<EndpointInfo> {
        Ok(self.do_open(board_index, endpoint_index, queues, sendq)?)
    }

    fn close_endpoint(&self, ep: Handle) -> Result<()> {
        Ok(self.do_close(ep)?)
    }

    fn submit(&self, ep: Handle, cmd: &Command<'_>) -> Result<()> {
        self.do_submit(ep, cmd).map_err(|e| {
            tracing::debug!("{} from {:?} failed: {}", cmd.kind(), ep, e);
            e.into()
        })
    }

    fn register_region(
        &self,
        ep: Handle,
        region: RegionDescriptor,
        memory: RegionMemory,
    ) -> Result<()> {
        Ok(self.do_register(ep, region, memory)?)
    }

    fn deregister_region(&self, ep: Handle, region: RegionDescriptor) -> Result<()> {
        Ok(self.do_deregister(ep, region)?)
    }

    fn wait_event(&self, ep: Handle, param: &WaitParam) -> Result<WaitStatus> {
        // never sleep with the fabric locked
        let queues = self.queues(ep)?;
        Ok(queues.wait_event(param))
    }

    fn wakeup(&self, ep: Handle) -> Result<()> {
        self.queues(ep)?.interrupt();
        Ok(())
    }
}
