//! Requests, their pool and the queues they move through.
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use bitflags::bitflags;
use slab::Slab;
use smallvec::SmallVec;
use static_assertions::const_assert;

use omx_api::cmd::RndvDescriptor;
use omx_api::{Error, Status, MEDIUM_FRAGS_MAX};

use crate::partner::PartnerIndex;
use crate::region::Region;
use crate::segments::{SegmentCursor, Segments};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Connect,
    SendTiny,
    SendSmall,
    SendMedium,
    SendLarge,
    Recv,
    RecvLarge,
    SendSelf,
    RecvSelfUnexpected,
}

impl RequestType {
    #[inline]
    pub fn is_send(&self) -> bool {
        matches!(
            self,
            RequestType::SendTiny
                | RequestType::SendSmall
                | RequestType::SendMedium
                | RequestType::SendLarge
                | RequestType::SendSelf
        )
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestType::Connect => "Connect",
            RequestType::SendTiny => "Send Tiny",
            RequestType::SendSmall => "Send Small",
            RequestType::SendMedium => "Send Medium",
            RequestType::SendLarge => "Send Large",
            RequestType::Recv => "Receive",
            RequestType::RecvLarge => "Receive Large",
            RequestType::SendSelf => "Send Self",
            RequestType::RecvSelfUnexpected => "Receive Self Unexpected",
        };
        f.write_str(s)
    }
}

bitflags! {
    pub struct RequestState: u32 {
        const DELAYED = 1 << 0;
        const IN_DRIVER = 1 << 1;
        const NEED_MATCHING = 1 << 2;
        const RECV_PARTIAL = 1 << 3;
        const RECV_UNEXPECTED = 1 << 4;
        const NEED_REPLY = 1 << 5;
        const NEED_ACK = 1 << 6;
        const DONE = 1 << 7;
        const ZOMBIE = 1 << 8;
        const INTERNAL = 1 << 9;
        const SEND_SELF_UNEXPECTED = 1 << 10;
        const NEED_SEQNUM = 1 << 11;
    }
}

const STATE_NAMES: [(RequestState, &str); 12] = [
    (RequestState::DELAYED, "Delayed"),
    (RequestState::IN_DRIVER, "InDriver"),
    (RequestState::NEED_MATCHING, "NeedMatch"),
    (RequestState::RECV_PARTIAL, "RecvPartial"),
    (RequestState::RECV_UNEXPECTED, "RecvUnexp"),
    (RequestState::NEED_REPLY, "NeedReply"),
    (RequestState::NEED_ACK, "NeedAck"),
    (RequestState::DONE, "Done"),
    (RequestState::ZOMBIE, "Zombie"),
    (RequestState::INTERNAL, "Internal"),
    (RequestState::SEND_SELF_UNEXPECTED, "SendSelfUnexp"),
    (RequestState::NEED_SEQNUM, "NeedSeqnum"),
];

impl fmt::Display for RequestState {
    /// Every set flag followed by a space, in bit order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, name) in STATE_NAMES.iter() {
            if self.contains(*flag) {
                write!(f, "{} ", name)?;
            }
        }
        Ok(())
    }
}

/// The request lists of an endpoint. A request is on at most one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Posted receives waiting for a matching message.
    Recv,
    /// Arrived messages no receive has matched yet.
    Unexp,
    /// Matched medium receives still missing fragments.
    MultifragMediumRecv,
    /// Receives pulling a rendezvous payload.
    LargeRecv,
    /// Sends waiting for the lower layer to report completion.
    Sent,
    /// Rendezvous sends waiting for the receiver's notify.
    LargeSend,
    /// Completed requests the application has not retrieved.
    Done,
    /// Connects waiting for a reply.
    Connect,
}

pub(crate) type RequestKey = usize;

/// Names a request to the application. Stale handles are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    pub(crate) key: u32,
    pub(crate) generation: u32,
}

/// What a finished request hands back: its status and the buffers it was given.
#[derive(Debug)]
pub struct Completion {
    pub status: Status,
    pub segments: Segments,
}

/// Read-only view of a request, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestInfo {
    pub ty: RequestType,
    pub state: RequestState,
    pub queue: Option<QueueKind>,
    pub seqnum: u16,
}

// one bit per fragment in `frags_received_mask`
const_assert!(MEDIUM_FRAGS_MAX <= u8::BITS as usize);

/// Reception progress of a receive.
#[derive(Debug, Default)]
pub(crate) struct RecvState {
    pub(crate) frags_nr: u8,
    pub(crate) frags_received_mask: u8,
    pub(crate) accumulated: usize,
    pub(crate) cursor: SegmentCursor,
    /// Set when fragments land in a private buffer rather than the receive's own.
    pub(crate) scratch: Option<Vec<u8>>,
    /// Set on an unexpected rendezvous until a receive matches it.
    pub(crate) rndv: Option<RndvDescriptor>,
}

#[derive(Debug)]
pub(crate) enum Specific {
    None,
    SendMedium {
        frags_pending: usize,
        sendq_pages: SmallVec<[u16; MEDIUM_FRAGS_MAX]>,
    },
    SendLarge {
        region: Region,
    },
    Recv(RecvState),
    RecvLarge {
        region: Region,
        remote: RndvDescriptor,
    },
    RecvSelfUnexpected {
        send: RequestKey,
    },
    Connect {
        connect_seqnum: u8,
        deadline: Instant,
    },
}

#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) ty: RequestType,
    pub(crate) state: RequestState,
    pub(crate) queue: Option<QueueKind>,
    pub(crate) generation: u32,
    pub(crate) status: Status,
    pub(crate) match_mask: u64,
    pub(crate) seqnum: u16,
    pub(crate) partner: Option<PartnerIndex>,
    pub(crate) segments: Segments,
    pub(crate) forgotten: bool,
    pub(crate) specific: Specific,
}

impl Request {
    pub(crate) fn recv_state(&mut self) -> &mut RecvState {
        match &mut self.specific {
            Specific::Recv(state) => state,
            other => panic!("{} request has no receive state: {:?}", self.ty, other),
        }
    }

    pub(crate) fn complete_with(&mut self, code: Result<(), Error>) {
        if self.status.code.is_ok() {
            self.status.code = code;
        }
    }
}

/// Fixed-capacity request pool.
///
/// Application submissions are limited to `capacity`; requests the engine creates
/// for unexpected arrivals are not, an arrival is never dropped for lack of one.
pub(crate) struct RequestPool {
    slab: Slab<Request>,
    capacity: usize,
    user: usize,
    next_generation: u32,
}

impl RequestPool {
    pub(crate) fn new(capacity: usize) -> Self {
        RequestPool {
            slab: Slab::with_capacity(capacity),
            capacity,
            user: 0,
            next_generation: 0,
        }
    }

    fn insert(&mut self, ty: RequestType, context: u64, state: RequestState) -> RequestKey {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        self.slab.insert(Request {
            ty,
            state,
            queue: None,
            generation,
            status: Status::new(context),
            match_mask: !0,
            seqnum: 0,
            partner: None,
            segments: Segments::default(),
            forgotten: false,
            specific: Specific::None,
        })
    }

    pub(crate) fn alloc(&mut self, ty: RequestType, context: u64) -> Result<RequestKey, Error> {
        if self.user >= self.capacity {
            tracing::debug!("request pool exhausted ({} in use)", self.user);
            return Err(Error::NoResources);
        }
        self.user += 1;
        Ok(self.insert(ty, context, RequestState::empty()))
    }

    pub(crate) fn alloc_internal(&mut self, ty: RequestType) -> RequestKey {
        self.insert(ty, 0, RequestState::INTERNAL)
    }

    pub(crate) fn free(&mut self, key: RequestKey) -> Request {
        let req = self.slab.remove(key);
        assert!(
            req.queue.is_none(),
            "freeing {} request still queued on {:?}",
            req.ty,
            req.queue
        );
        if !req.state.contains(RequestState::INTERNAL) {
            self.user -= 1;
        }
        req
    }

    pub(crate) fn handle(&self, key: RequestKey) -> RequestHandle {
        RequestHandle {
            key: key as u32,
            generation: self.slab[key].generation,
        }
    }

    /// Resolves an application handle, rejecting freed and zombie requests.
    pub(crate) fn resolve(&self, handle: RequestHandle) -> Result<RequestKey, Error> {
        let key = handle.key as usize;
        match self.slab.get(key) {
            Some(req)
                if req.generation == handle.generation
                    && !req
                        .state
                        .intersects(RequestState::ZOMBIE | RequestState::INTERNAL) =>
            {
                Ok(key)
            }
            _ => Err(Error::BadRequest),
        }
    }

    #[inline]
    pub(crate) fn get(&self, key: RequestKey) -> Option<&Request> {
        self.slab.get(key)
    }

    pub(crate) fn in_use(&self) -> usize {
        self.user
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (RequestKey, &Request)> {
        self.slab.iter()
    }
}

impl std::ops::Index<RequestKey> for RequestPool {
    type Output = Request;

    fn index(&self, key: RequestKey) -> &Request {
        &self.slab[key]
    }
}

impl std::ops::IndexMut<RequestKey> for RequestPool {
    fn index_mut(&mut self, key: RequestKey) -> &mut Request {
        &mut self.slab[key]
    }
}

#[derive(Debug, Default)]
pub(crate) struct RequestQueues {
    recv: VecDeque<RequestKey>,
    unexp: VecDeque<RequestKey>,
    multifrag_medium_recv: VecDeque<RequestKey>,
    large_recv: VecDeque<RequestKey>,
    sent: VecDeque<RequestKey>,
    large_send: VecDeque<RequestKey>,
    done: VecDeque<RequestKey>,
    connect: VecDeque<RequestKey>,
}

impl RequestQueues {
    pub(crate) fn queue(&self, kind: QueueKind) -> &VecDeque<RequestKey> {
        match kind {
            QueueKind::Recv => &self.recv,
            QueueKind::Unexp => &self.unexp,
            QueueKind::MultifragMediumRecv => &self.multifrag_medium_recv,
            QueueKind::LargeRecv => &self.large_recv,
            QueueKind::Sent => &self.sent,
            QueueKind::LargeSend => &self.large_send,
            QueueKind::Done => &self.done,
            QueueKind::Connect => &self.connect,
        }
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut VecDeque<RequestKey> {
        match kind {
            QueueKind::Recv => &mut self.recv,
            QueueKind::Unexp => &mut self.unexp,
            QueueKind::MultifragMediumRecv => &mut self.multifrag_medium_recv,
            QueueKind::LargeRecv => &mut self.large_recv,
            QueueKind::Sent => &mut self.sent,
            QueueKind::LargeSend => &mut self.large_send,
            QueueKind::Done => &mut self.done,
            QueueKind::Connect => &mut self.connect,
        }
    }

    pub(crate) fn enqueue(&mut self, pool: &mut RequestPool, kind: QueueKind, key: RequestKey) {
        let req = &mut pool[key];
        assert!(
            req.queue.is_none(),
            "{} request enqueued on {:?} while on {:?}",
            req.ty,
            kind,
            req.queue
        );
        req.queue = Some(kind);
        self.queue_mut(kind).push_back(key);
    }

    pub(crate) fn dequeue(&mut self, pool: &mut RequestPool, key: RequestKey) -> QueueKind {
        let req = &mut pool[key];
        let kind = match req.queue.take() {
            Some(kind) => kind,
            None => panic!("{} request dequeued while on no queue", req.ty),
        };
        let queue = self.queue_mut(kind);
        let pos = queue
            .iter()
            .position(|&k| k == key)
            .unwrap_or_else(|| panic!("request missing from {:?} queue", kind));
        queue.remove(pos);
        kind
    }

    pub(crate) fn len(&self, kind: QueueKind) -> usize {
        self.queue(kind).len()
    }
}
