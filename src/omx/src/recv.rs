//! Receive paths: posting, matching, ordering and reassembly of incoming messages.
use std::mem;
use std::sync::Arc;

use omx_api::addr::EndpointAddr;
use omx_api::cmd::{Command, Notify, Pull, RegionDescriptor, RndvDescriptor};
use omx_api::event::{PullDone, RecvMsgHeader};
use omx_api::{medium_frags_nr, Error, Result, Status, MEDIUM_FRAG_LENGTH_MAX, SEGMENTS_MAX};

use crate::endpoint::EndpointInner;
use crate::partner::{seqnum_next, EarlyPacket, EarlyPayload, PartnerIndex, SeqCheck};
use crate::region::{Region, RegionMemory};
use crate::request::{QueueKind, RecvState, Request, RequestKey, RequestState, RequestType, Specific};
use crate::segments::Segments;

/// An incoming message as seen by the matching logic.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Payload<'a> {
    /// A whole tiny or small message.
    Data(&'a [u8]),
    MediumFrag { frag_seqnum: u8, data: &'a [u8] },
    Rndv(RndvDescriptor),
}

impl Payload<'_> {
    fn to_early(self) -> EarlyPayload {
        match self {
            Payload::Data(data) => EarlyPayload::Data(data.to_vec()),
            Payload::MediumFrag { frag_seqnum, data } => EarlyPayload::MediumFrag {
                frag_seqnum,
                data: data.to_vec(),
            },
            Payload::Rndv(rndv) => EarlyPayload::Rndv(rndv),
        }
    }
}

impl EarlyPayload {
    fn as_payload(&self) -> Payload<'_> {
        match self {
            EarlyPayload::Data(data) => Payload::Data(data),
            EarlyPayload::MediumFrag { frag_seqnum, data } => Payload::MediumFrag {
                frag_seqnum: *frag_seqnum,
                data,
            },
            EarlyPayload::Rndv(rndv) => Payload::Rndv(*rndv),
        }
    }
}

impl EndpointInner {
    pub(crate) fn irecv(
        &mut self,
        segments: Segments,
        match_info: u64,
        match_mask: u64,
        context: u64,
    ) -> Result<RequestKey> {
        if match_info & !match_mask != 0 {
            return Err(Error::BadMatchMask);
        }
        if segments.nseg() > SEGMENTS_MAX {
            return Err(Error::SegmentsBadCount);
        }
        self.progress();

        let key = self.requests.alloc(RequestType::Recv, context)?;
        let req = &mut self.requests[key];
        req.segments = segments;
        req.status.match_info = match_info;
        req.match_mask = match_mask;
        req.specific = Specific::Recv(RecvState::default());

        match self.match_unexpected(match_info, match_mask) {
            Some(unexp) => self.take_unexpected(key, unexp),
            None => {
                self.requests[key].state.insert(RequestState::NEED_MATCHING);
                self.enqueue(QueueKind::Recv, key);
            }
        }

        self.progress();
        Ok(key)
    }

    /// Oldest unexpected message passing the mask.
    pub(crate) fn match_unexpected(&self, match_info: u64, match_mask: u64) -> Option<RequestKey> {
        self.reqq
            .queue(QueueKind::Unexp)
            .iter()
            .copied()
            .find(|&k| self.requests[k].status.match_info & match_mask == match_info)
    }

    /// Oldest posted receive accepting `match_info`.
    pub(crate) fn match_posted_recv(&self, match_info: u64) -> Option<RequestKey> {
        self.reqq.queue(QueueKind::Recv).iter().copied().find(|&k| {
            let req = &self.requests[k];
            match_info & req.match_mask == req.status.match_info
        })
    }

    pub(crate) fn probe_unexpected(&self, match_info: u64, match_mask: u64) -> Option<Status> {
        self.match_unexpected(match_info, match_mask)
            .map(|k| self.requests[k].status)
    }

    /// Records which message `key` is receiving.
    pub(crate) fn matched(
        &mut self,
        key: RequestKey,
        pidx: Option<PartnerIndex>,
        src: EndpointAddr,
        match_info: u64,
        msg_length: u32,
        seqnum: u16,
    ) {
        let req = &mut self.requests[key];
        req.state.remove(RequestState::NEED_MATCHING);
        req.partner = pidx;
        req.seqnum = seqnum;
        req.status.addr = Some(src);
        req.status.match_info = match_info;
        req.status.msg_length = msg_length;
        req.status.xfer_length = 0;
    }

    /// Copies a whole message into an unqueued receive and completes it.
    pub(crate) fn finish_recv_copy(&mut self, key: RequestKey, data: &[u8]) -> u32 {
        let req = &mut self.requests[key];
        let xfer = data.len().min(req.segments.total_length());
        req.segments.copy_to_segments(&data[..xfer]);
        req.status.xfer_length = xfer as u32;
        if xfer < req.status.msg_length as usize {
            req.complete_with(Err(Error::MessageTruncated));
        }
        self.mark_done(key);
        xfer as u32
    }

    /// Hands the unexpected message `unexp` to the freshly posted receive `recv`.
    fn take_unexpected(&mut self, recv: RequestKey, unexp: RequestKey) {
        self.dequeue(unexp);
        let msg = self.requests.free(unexp);
        let addr = msg.status.addr.unwrap_or(self.addr);
        self.matched(
            recv,
            msg.partner,
            addr,
            msg.status.match_info,
            msg.status.msg_length,
            msg.seqnum,
        );

        match msg.ty {
            RequestType::RecvSelfUnexpected => {
                let send = match msg.specific {
                    Specific::RecvSelfUnexpected { send } => send,
                    other => panic!("self unexpected message holding {:?}", other),
                };
                let data = msg.segments.into_contiguous();
                let xfer = self.finish_recv_copy(recv, &data);
                self.requests[send].status.xfer_length = xfer;
                self.dequeue(send);
                self.mark_done(send);
            }
            RequestType::Recv => {
                let mut state = match msg.specific {
                    Specific::Recv(state) => state,
                    other => panic!("unexpected message holding {:?}", other),
                };
                if let Some(rndv) = state.rndv.take() {
                    self.start_large_recv(recv, rndv);
                } else if msg.state.contains(RequestState::RECV_PARTIAL) {
                    // the remaining fragments land in the buffer the first ones went to
                    state.scratch = Some(msg.segments.into_contiguous());
                    let req = &mut self.requests[recv];
                    req.state.insert(RequestState::RECV_PARTIAL);
                    req.specific = Specific::Recv(state);
                    self.enqueue(QueueKind::MultifragMediumRecv, recv);
                } else {
                    let data = msg.segments.into_contiguous();
                    self.finish_recv_copy(recv, &data);
                }
            }
            other => panic!("{} request on the unexpected queue", other),
        }
    }

    /// Entry point of every incoming message.
    pub(crate) fn process_msg(&mut self, hdr: &RecvMsgHeader, payload: Payload<'_>) {
        let pidx = self.partners.get_or_insert(hdr.src, hdr.peer_index);
        self.handle_msg(pidx, hdr, payload);
        while let Some(early) = self.partners.get_mut(pidx).take_early() {
            self.handle_msg(pidx, &early.hdr, early.payload.as_payload());
        }
    }

    fn handle_msg(&mut self, pidx: PartnerIndex, hdr: &RecvMsgHeader, payload: Payload<'_>) {
        if let Payload::MediumFrag { frag_seqnum, data } = payload {
            if let Some(key) = self.find_partial(pidx, hdr.seqnum) {
                self.recv_medium_frag(key, frag_seqnum, data);
                return;
            }
        }

        let partner = self.partners.get_mut(pidx);
        match partner.check_recv_seq(hdr.seqnum) {
            SeqCheck::Duplicate => {
                tracing::debug!(
                    "dropping duplicate seqnum {} from {} (expecting {})",
                    hdr.seqnum,
                    partner.addr,
                    partner.next_match_recv_seq
                );
                return;
            }
            SeqCheck::Early => {
                partner.stash_early(EarlyPacket {
                    hdr: *hdr,
                    payload: payload.to_early(),
                });
                return;
            }
            SeqCheck::InOrder => partner.next_match_recv_seq = seqnum_next(hdr.seqnum),
        }
        self.new_msg(pidx, hdr, payload);
    }

    /// The medium message `seqnum` of `pidx` still missing fragments.
    fn find_partial(&self, pidx: PartnerIndex, seqnum: u16) -> Option<RequestKey> {
        let is_it = |k: &RequestKey| {
            let req = &self.requests[*k];
            req.state.contains(RequestState::RECV_PARTIAL)
                && req.partner == Some(pidx)
                && req.seqnum == seqnum
        };
        let queue = |kind| self.reqq.queue(kind).iter().copied().find(is_it);
        queue(QueueKind::MultifragMediumRecv).or_else(|| queue(QueueKind::Unexp))
    }

    /// A message in sequence: match it or keep it as unexpected.
    fn new_msg(&mut self, pidx: PartnerIndex, hdr: &RecvMsgHeader, payload: Payload<'_>) {
        let src = self.partners.get(pidx).addr;
        match self.match_posted_recv(hdr.match_info) {
            Some(key) => {
                self.dequeue(key);
                self.matched(key, Some(pidx), src, hdr.match_info, hdr.length, hdr.seqnum);
                match payload {
                    Payload::Data(data) => {
                        self.finish_recv_copy(key, data);
                    }
                    Payload::MediumFrag { frag_seqnum, data } => {
                        self.start_medium_recv(key);
                        self.enqueue(QueueKind::MultifragMediumRecv, key);
                        self.recv_medium_frag(key, frag_seqnum, data);
                    }
                    Payload::Rndv(rndv) => self.start_large_recv(key, rndv),
                }
            }
            None => {
                let key = self.requests.alloc_internal(RequestType::Recv);
                self.matched(key, Some(pidx), src, hdr.match_info, hdr.length, hdr.seqnum);
                let req = &mut self.requests[key];
                req.state.insert(RequestState::RECV_UNEXPECTED);
                req.specific = Specific::Recv(RecvState::default());
                match payload {
                    Payload::Data(data) => {
                        req.segments = Segments::single(data.to_vec());
                        req.status.xfer_length = data.len() as u32;
                        self.enqueue(QueueKind::Unexp, key);
                    }
                    Payload::MediumFrag { frag_seqnum, data } => {
                        req.segments = Segments::with_length(hdr.length as usize);
                        self.start_medium_recv(key);
                        self.enqueue(QueueKind::Unexp, key);
                        self.recv_medium_frag(key, frag_seqnum, data);
                    }
                    Payload::Rndv(rndv) => {
                        req.recv_state().rndv = Some(rndv);
                        self.enqueue(QueueKind::Unexp, key);
                    }
                }
            }
        }
    }

    fn start_medium_recv(&mut self, key: RequestKey) {
        let req = &mut self.requests[key];
        req.state.insert(RequestState::RECV_PARTIAL);
        let frags_nr = medium_frags_nr(req.status.msg_length as usize) as u8;
        *req.recv_state() = RecvState {
            frags_nr,
            ..Default::default()
        };
    }

    fn recv_medium_frag(&mut self, key: RequestKey, frag_seqnum: u8, data: &[u8]) {
        let Request {
            state,
            status,
            segments,
            specific,
            ..
        } = &mut self.requests[key];
        let rs = match specific {
            Specific::Recv(rs) => rs,
            other => panic!("medium fragment for a request holding {:?}", other),
        };
        if frag_seqnum >= rs.frags_nr {
            tracing::warn!(
                "fragment {} of a {} fragment message from {:?}",
                frag_seqnum,
                rs.frags_nr,
                status.addr
            );
            return;
        }
        let bit = 1u8 << frag_seqnum;
        if rs.frags_received_mask & bit != 0 {
            tracing::debug!("duplicate fragment {} from {:?}", frag_seqnum, status.addr);
            return;
        }
        rs.frags_received_mask |= bit;
        rs.accumulated += data.len();

        let offset = frag_seqnum as usize * MEDIUM_FRAG_LENGTH_MAX;
        if let Some(scratch) = rs.scratch.as_mut() {
            scratch[offset..offset + data.len()].copy_from_slice(data);
        } else if offset < segments.total_length() {
            let len = data.len().min(segments.total_length() - offset);
            if rs.cursor.position() != offset {
                rs.cursor = segments.seek(offset);
            }
            segments.partial_copy_to_segments(&data[..len], &mut rs.cursor);
        }

        if rs.frags_received_mask.count_ones() < rs.frags_nr as u32 {
            return;
        }
        state.remove(RequestState::RECV_PARTIAL);
        if state.contains(RequestState::RECV_UNEXPECTED) {
            // whole, but still waiting for a receive
            return;
        }
        let scratch = rs.scratch.take();
        let msg_length = status.msg_length;
        self.dequeue(key);
        match scratch {
            Some(buf) => {
                self.finish_recv_copy(key, &buf);
            }
            None => {
                let req = &mut self.requests[key];
                let xfer = (msg_length as usize).min(req.segments.total_length());
                req.status.xfer_length = xfer as u32;
                if xfer < msg_length as usize {
                    req.complete_with(Err(Error::MessageTruncated));
                }
                self.mark_done(key);
            }
        }
    }

    /// Registers the receive buffers of `key` and pulls the rendezvous payload.
    fn start_large_recv(&mut self, key: RequestKey, rndv: RndvDescriptor) {
        let req = &mut self.requests[key];
        req.ty = RequestType::RecvLarge;
        req.status.msg_length = rndv.length;
        let pidx = match req.partner {
            Some(pidx) => pidx,
            None => panic!("rendezvous without a partner"),
        };
        let length = (rndv.length as usize).min(req.segments.total_length());
        let memory: RegionMemory = Arc::new(spin::Mutex::new(mem::take(&mut req.segments)));

        let local = match self.register_region(Arc::clone(&memory)) {
            Ok(desc) => desc,
            Err(e) => {
                tracing::debug!("no region to pull {} bytes into: {}", length, e);
                self.fail_large_recv(key, pidx, &memory, rndv.region, e);
                return;
            }
        };
        let partner = self.partners.get(pidx);
        let cmd = Command::Pull(Pull {
            dest: partner.addr,
            dest_peer_index: partner.peer_index,
            length: length as u32,
            remote: rndv.region,
            local,
            lib_cookie: key as u32,
        });
        if let Err(e) = self.driver.submit(self.handle, &cmd) {
            tracing::debug!("pull from {} failed: {}", partner.addr, e);
            self.deregister_region(local);
            self.fail_large_recv(key, pidx, &memory, rndv.region, e);
            return;
        }

        let req = &mut self.requests[key];
        req.state.insert(RequestState::IN_DRIVER);
        req.specific = Specific::RecvLarge {
            region: Region {
                desc: local,
                memory,
            },
            remote: rndv,
        };
        self.enqueue(QueueKind::LargeRecv, key);
    }

    fn fail_large_recv(
        &mut self,
        key: RequestKey,
        pidx: PartnerIndex,
        memory: &RegionMemory,
        remote: RegionDescriptor,
        e: Error,
    ) {
        let req = &mut self.requests[key];
        req.segments = mem::take(&mut *memory.lock());
        req.status.xfer_length = 0;
        req.complete_with(Err(e));
        // let the sender release its region anyway
        self.notify_sender(pidx, 0, remote);
        self.mark_done(key);
    }

    fn notify_sender(&mut self, pidx: PartnerIndex, total_length: u32, puller_region: RegionDescriptor) {
        let partner = self.partners.get(pidx);
        let cmd = Command::Notify(Notify {
            dest: partner.addr,
            dest_peer_index: partner.peer_index,
            total_length,
            puller_region,
        });
        if let Err(e) = self.driver.submit(self.handle, &cmd) {
            tracing::warn!("notifying {} of region {:?}: {}", partner.addr, puller_region, e);
        }
    }

    /// The lower layer finished a pull.
    pub(crate) fn pull_done(&mut self, done: &PullDone) {
        let key = done.lib_cookie as usize;
        let ours = match self.requests.get(key) {
            Some(req) => {
                req.queue == Some(QueueKind::LargeRecv)
                    && matches!(&req.specific,
                        Specific::RecvLarge { region, .. } if region.desc == done.local_region)
            }
            None => false,
        };
        if !ours {
            tracing::warn!("pull done for unknown request {}", key);
            return;
        }

        self.dequeue(key);
        let (region, remote) = match mem::replace(&mut self.requests[key].specific, Specific::None) {
            Specific::RecvLarge { region, remote } => (region, remote),
            other => panic!("large receive holding {:?}", other),
        };
        self.deregister_region(region.desc);
        let segments = mem::take(&mut *region.memory.lock());

        let req = &mut self.requests[key];
        let pidx = match req.partner {
            Some(pidx) => pidx,
            None => panic!("large receive without a partner"),
        };
        req.segments = segments;
        req.status.xfer_length = done.pulled_length;
        req.complete_with(done.status);
        if done.pulled_length < req.status.msg_length {
            req.complete_with(Err(Error::MessageTruncated));
        }
        self.notify_sender(pidx, done.pulled_length, remote.region);
        self.mark_done(key);
    }
}
