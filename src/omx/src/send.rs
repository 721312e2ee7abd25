//! Send paths: tiny, small, medium, rendezvous and sends to ourselves.
use std::mem;
use std::sync::Arc;

use smallvec::SmallVec;
use static_assertions::const_assert;

use omx_api::addr::EndpointAddr;
use omx_api::cmd::{
    Command, MsgHeader, RndvDescriptor, SendMediumFrag, SendRndv, SendSmall, SendTiny,
    PEER_INDEX_UNKNOWN,
};
use omx_api::event::RecvNotify;
use omx_api::{
    medium_frags_nr, Error, Result, SizeClass, MEDIUM_FRAGS_MAX, MEDIUM_FRAG_LENGTH_MAX,
    SEGMENTS_MAX, SENDQ_ENTRY_SIZE, TINY_MAX,
};

use crate::endpoint::EndpointInner;
use crate::partner::{seqnum_next, PartnerIndex};
use crate::region::{Region, RegionMemory};
use crate::request::{QueueKind, RequestKey, RequestState, RequestType, Specific};
use crate::segments::{SegmentCursor, Segments};

// a fragment is staged whole in one page and its length travels as a u16
const_assert!(MEDIUM_FRAG_LENGTH_MAX <= SENDQ_ENTRY_SIZE);
const_assert!(MEDIUM_FRAG_LENGTH_MAX <= u16::MAX as usize);

pub(crate) type SendqPages = SmallVec<[u16; MEDIUM_FRAGS_MAX]>;

/// Ownership of the send queue pages medium fragments are staged in.
#[derive(Debug)]
pub(crate) struct SendqMap {
    owners: Vec<Option<RequestKey>>,
    free: Vec<u16>,
}

impl SendqMap {
    pub(crate) fn new(nr: usize) -> Self {
        SendqMap {
            owners: vec![None; nr],
            free: (0..nr).rev().map(|page| page as u16).collect(),
        }
    }

    /// Takes `nr` pages for `owner`, all or nothing.
    pub(crate) fn alloc(&mut self, nr: usize, owner: RequestKey) -> Option<SendqPages> {
        if self.free.len() < nr {
            return None;
        }
        let mut pages = SendqPages::new();
        for _ in 0..nr {
            let page = self.free.pop()?;
            self.owners[page as usize] = Some(owner);
            pages.push(page);
        }
        Some(pages)
    }

    /// Returns `page` to the pool and tells who held it.
    pub(crate) fn release(&mut self, page: u16) -> RequestKey {
        let owner = self.owners[page as usize]
            .take()
            .unwrap_or_else(|| panic!("sendq page {} released while free", page));
        self.free.push(page);
        owner
    }

    /// Hands a page in flight to another owner.
    pub(crate) fn transfer(&mut self, page: u16, owner: RequestKey) {
        match self.owners[page as usize].as_mut() {
            Some(held) => *held = owner,
            None => panic!("sendq page {} transferred while free", page),
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }
}

impl EndpointInner {
    pub(crate) fn isend(
        &mut self,
        segments: Segments,
        dest: &EndpointAddr,
        match_info: u64,
        context: u64,
    ) -> Result<RequestKey> {
        if segments.nseg() > SEGMENTS_MAX {
            return Err(Error::SegmentsBadCount);
        }
        if segments.total_length() > u32::MAX as usize {
            return Err(Error::BadInfoLength);
        }
        self.progress();

        let key = if dest.key() == self.addr.key() {
            self.send_self(segments, match_info, context)?
        } else {
            let pidx = self.partners.get_or_insert(*dest, PEER_INDEX_UNKNOWN);
            match SizeClass::of(segments.total_length()) {
                SizeClass::Tiny => self.send_tiny(pidx, segments, match_info, context)?,
                SizeClass::Small => self.send_small(pidx, segments, match_info, context)?,
                SizeClass::Medium => self.send_medium(pidx, segments, match_info, context)?,
                SizeClass::Large => self.send_large(pidx, segments, match_info, context)?,
            }
        };

        self.progress();
        Ok(key)
    }

    /// Allocates a send to partner `pidx` stamped with its next sequence number.
    fn new_send(
        &mut self,
        ty: RequestType,
        pidx: PartnerIndex,
        match_info: u64,
        length: usize,
        context: u64,
    ) -> Result<RequestKey> {
        let key = self.requests.alloc(ty, context)?;
        let partner = self.partners.get(pidx);
        let req = &mut self.requests[key];
        req.partner = Some(pidx);
        req.seqnum = partner.next_send_seq;
        req.status.addr = Some(partner.addr);
        req.status.match_info = match_info;
        req.status.msg_length = length as u32;
        req.status.xfer_length = length as u32;
        Ok(key)
    }

    fn msg_header(&self, key: RequestKey) -> MsgHeader {
        let req = &self.requests[key];
        let partner = match req.partner {
            Some(pidx) => self.partners.get(pidx),
            None => panic!("{} request without a partner", req.ty),
        };
        MsgHeader {
            dest: partner.addr,
            dest_peer_index: partner.peer_index,
            match_info: req.status.match_info,
            seqnum: req.seqnum,
            length: req.status.msg_length,
        }
    }

    /// The message of `key` left, its sequence number is consumed.
    fn send_submitted(&mut self, key: RequestKey) {
        let req = &self.requests[key];
        if let Some(pidx) = req.partner {
            let partner = self.partners.get_mut(pidx);
            debug_assert_eq!(partner.next_send_seq, req.seqnum);
            partner.next_send_seq = seqnum_next(req.seqnum);
        }
    }

    fn send_tiny(
        &mut self,
        pidx: PartnerIndex,
        segments: Segments,
        match_info: u64,
        context: u64,
    ) -> Result<RequestKey> {
        let length = segments.total_length();
        let key = self.new_send(RequestType::SendTiny, pidx, match_info, length, context)?;
        let mut data = [0u8; TINY_MAX];
        segments.copy_from_segments(&mut data[..length]);
        let cmd = Command::SendTiny(SendTiny {
            hdr: self.msg_header(key),
            data,
        });
        if let Err(e) = self.driver.submit(self.handle, &cmd) {
            tracing::debug!("tiny send to {} failed: {}", self.partners.get(pidx).addr, e);
            self.requests.free(key);
            return Err(e);
        }
        self.send_submitted(key);
        self.requests[key].segments = segments;
        self.mark_done(key);
        Ok(key)
    }

    fn send_small(
        &mut self,
        pidx: PartnerIndex,
        segments: Segments,
        match_info: u64,
        context: u64,
    ) -> Result<RequestKey> {
        let length = segments.total_length();
        let key = self.new_send(RequestType::SendSmall, pidx, match_info, length, context)?;
        let copy;
        let data = match segments.as_contiguous() {
            Some(data) => data,
            None => {
                let mut buf = vec![0u8; length];
                segments.copy_from_segments(&mut buf);
                copy = buf;
                &copy[..]
            }
        };
        let cmd = Command::SendSmall(SendSmall {
            hdr: self.msg_header(key),
            data,
        });
        if let Err(e) = self.driver.submit(self.handle, &cmd) {
            tracing::debug!("small send to {} failed: {}", self.partners.get(pidx).addr, e);
            self.requests.free(key);
            return Err(e);
        }
        self.send_submitted(key);
        self.requests[key].segments = segments;
        self.mark_done(key);
        Ok(key)
    }

    fn send_medium(
        &mut self,
        pidx: PartnerIndex,
        segments: Segments,
        match_info: u64,
        context: u64,
    ) -> Result<RequestKey> {
        let length = segments.total_length();
        let frags_nr = medium_frags_nr(length);
        assert!(frags_nr <= MEDIUM_FRAGS_MAX);
        let key = self.new_send(RequestType::SendMedium, pidx, match_info, length, context)?;
        let pages = match self.sendq_map.alloc(frags_nr, key) {
            Some(pages) => pages,
            None => {
                tracing::debug!(
                    "{} sendq pages left, {} needed",
                    self.sendq_map.available(),
                    frags_nr
                );
                self.requests.free(key);
                return Err(Error::NoResources);
            }
        };

        let hdr = self.msg_header(key);
        let sendq = Arc::clone(&self.sendq);
        let mut cursor = SegmentCursor::default();
        let mut submitted = 0;
        let mut failure = None;
        for (i, &page) in pages.iter().enumerate() {
            let frag_length = MEDIUM_FRAG_LENGTH_MAX.min(length - i * MEDIUM_FRAG_LENGTH_MAX);
            sendq.with_page_mut(page as usize, frag_length, |buf| {
                segments.partial_copy_from_segments(buf, &mut cursor)
            });
            let cmd = Command::SendMediumFrag(SendMediumFrag {
                hdr,
                frag_seqnum: i as u8,
                frag_length: frag_length as u16,
                sendq_page: page,
            });
            if let Err(e) = self.driver.submit(self.handle, &cmd) {
                failure = Some(e);
                break;
            }
            submitted += 1;
        }

        if let Some(e) = failure {
            for &page in &pages[submitted..] {
                self.sendq_map.release(page);
            }
            if submitted > 0 {
                // the receiver keeps what arrived, a retry under the same seqnum completes it
                tracing::debug!(
                    "medium send to {} failed after {} of {} fragments: {}",
                    hdr.dest,
                    submitted,
                    frags_nr,
                    e
                );
                self.hold_sendq_pages(&pages[..submitted]);
            } else {
                tracing::debug!("medium send to {} failed: {}", hdr.dest, e);
            }
            self.requests.free(key);
            return Err(e);
        }

        self.send_submitted(key);
        let req = &mut self.requests[key];
        req.segments = segments;
        req.state.insert(RequestState::IN_DRIVER);
        req.specific = Specific::SendMedium {
            frags_pending: pages.len(),
            sendq_pages: pages,
        };
        self.enqueue(QueueKind::Sent, key);
        Ok(key)
    }

    /// Keeps fragments already handed to the lower layer accounted for after their
    /// send was abandoned, until every page comes back.
    fn hold_sendq_pages(&mut self, pages: &[u16]) {
        let holder = self.requests.alloc_internal(RequestType::SendMedium);
        for &page in pages {
            self.sendq_map.transfer(page, holder);
        }
        let req = &mut self.requests[holder];
        req.state.insert(RequestState::IN_DRIVER | RequestState::ZOMBIE);
        req.forgotten = true;
        req.specific = Specific::SendMedium {
            frags_pending: pages.len(),
            sendq_pages: pages.into(),
        };
        self.enqueue(QueueKind::Sent, holder);
    }

    /// One staged fragment left the send queue.
    pub(crate) fn medium_frag_done(&mut self, page: u16) {
        let key = self.sendq_map.release(page);
        let req = &mut self.requests[key];
        match &mut req.specific {
            Specific::SendMedium { frags_pending, .. } => {
                *frags_pending -= 1;
                if *frags_pending > 0 {
                    return;
                }
            }
            other => panic!("sendq page {} owned by {} request {:?}", page, req.ty, other),
        }
        self.dequeue(key);
        self.mark_done(key);
    }

    fn send_large(
        &mut self,
        pidx: PartnerIndex,
        segments: Segments,
        match_info: u64,
        context: u64,
    ) -> Result<RequestKey> {
        let length = segments.total_length();
        let key = self.new_send(RequestType::SendLarge, pidx, match_info, length, context)?;
        let memory: RegionMemory = Arc::new(spin::Mutex::new(segments));
        let desc = match self.register_region(Arc::clone(&memory)) {
            Ok(desc) => desc,
            Err(e) => {
                tracing::debug!("no region for a {} byte send: {}", length, e);
                self.requests.free(key);
                return Err(e);
            }
        };
        let rndv = RndvDescriptor {
            length: length as u32,
            region: desc,
        };
        let cmd = Command::SendRndv(SendRndv {
            hdr: self.msg_header(key),
            data: rndv.to_bytes(),
        });
        if let Err(e) = self.driver.submit(self.handle, &cmd) {
            tracing::debug!("rendezvous to {} failed: {}", self.partners.get(pidx).addr, e);
            self.deregister_region(desc);
            self.requests.free(key);
            return Err(e);
        }
        self.send_submitted(key);
        let req = &mut self.requests[key];
        req.state.insert(RequestState::NEED_REPLY);
        req.specific = Specific::SendLarge {
            region: Region { desc, memory },
        };
        self.enqueue(QueueKind::LargeSend, key);
        Ok(key)
    }

    /// The receiver finished pulling from one of our regions.
    pub(crate) fn recv_notify(&mut self, ev: &RecvNotify) {
        let requests = &self.requests;
        let found = self
            .reqq
            .queue(QueueKind::LargeSend)
            .iter()
            .copied()
            .find(|&k| {
                matches!(&requests[k].specific,
                    Specific::SendLarge { region } if region.desc == ev.puller_region)
            });
        let key = match found {
            Some(key) => key,
            None => {
                tracing::debug!(
                    "notify from {} for unknown region {:?}",
                    ev.src,
                    ev.puller_region
                );
                return;
            }
        };
        self.dequeue(key);
        let region = match mem::replace(&mut self.requests[key].specific, Specific::None) {
            Specific::SendLarge { region } => region,
            other => panic!("large send holding {:?}", other),
        };
        self.deregister_region(region.desc);
        let segments = mem::take(&mut *region.memory.lock());
        let req = &mut self.requests[key];
        req.segments = segments;
        req.status.xfer_length = ev.total_length;
        self.mark_done(key);
    }

    /// Delivers to a receive of this very endpoint without the lower layer.
    fn send_self(
        &mut self,
        segments: Segments,
        match_info: u64,
        context: u64,
    ) -> Result<RequestKey> {
        let length = segments.total_length();
        let send = self.requests.alloc(RequestType::SendSelf, context)?;
        let req = &mut self.requests[send];
        req.status.addr = Some(self.addr);
        req.status.match_info = match_info;
        req.status.msg_length = length as u32;

        let data = match segments.as_contiguous() {
            Some(data) => data.to_vec(),
            None => {
                let mut buf = vec![0u8; length];
                segments.copy_from_segments(&mut buf);
                buf
            }
        };

        match self.match_posted_recv(match_info) {
            Some(recv) => {
                self.dequeue(recv);
                self.matched(recv, None, self.addr, match_info, length as u32, 0);
                let xfer = self.finish_recv_copy(recv, &data);
                let req = &mut self.requests[send];
                req.status.xfer_length = xfer;
                req.segments = segments;
                self.mark_done(send);
            }
            None => {
                let unexp = self.requests.alloc_internal(RequestType::RecvSelfUnexpected);
                self.matched(unexp, None, self.addr, match_info, length as u32, 0);
                let req = &mut self.requests[unexp];
                req.state.insert(RequestState::RECV_UNEXPECTED);
                req.segments = Segments::single(data);
                req.specific = Specific::RecvSelfUnexpected { send };
                self.enqueue(QueueKind::Unexp, unexp);

                let req = &mut self.requests[send];
                req.state.insert(RequestState::SEND_SELF_UNEXPECTED);
                req.segments = segments;
                self.enqueue(QueueKind::Sent, send);
            }
        }
        Ok(send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sendq_pages_are_all_or_nothing() {
        let mut map = SendqMap::new(4);
        let pages = map.alloc(3, 7).unwrap();
        assert_eq!(pages.as_slice(), &[0, 1, 2]);
        assert!(map.alloc(2, 8).is_none());
        assert_eq!(map.available(), 1);
        assert_eq!(map.release(1), 7);
        assert_eq!(map.alloc(2, 8).unwrap().as_slice(), &[1, 3]);
    }

    #[test]
    fn transferred_pages_come_back_to_the_new_owner() {
        let mut map = SendqMap::new(2);
        let pages = map.alloc(2, 3).unwrap();
        map.transfer(pages[1], 9);
        assert_eq!(map.release(pages[0]), 3);
        assert_eq!(map.release(pages[1]), 9);
        assert_eq!(map.available(), 2);
    }

    #[test]
    #[should_panic(expected = "released while free")]
    fn double_release_is_fatal() {
        let mut map = SendqMap::new(2);
        let pages = map.alloc(1, 0).unwrap();
        map.release(pages[0]);
        map.release(pages[0]);
    }
}
