//! An open endpoint: the request engine and the application entry points.
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipc::{DescStatus, EventQueues, SendQueue};
use omx_api::addr::{BoardAddr, EndpointAddr};
use omx_api::cmd::{RegionDescriptor, RndvDescriptor};
use omx_api::event::{Event, WaitParam, WaitStatus};
use omx_api::{Error, Handle, Result, Status, REGION_MAX, SENDQ_ENTRY_SIZE, TINY_MAX};

use crate::config::EndpointConfig;
use crate::driver::Driver;
use crate::partner::PartnerTable;
use crate::recv::Payload;
use crate::region::{RegionMemory, RegionRegistry};
use crate::request::{
    Completion, QueueKind, RequestHandle, RequestInfo, RequestKey, RequestPool, RequestQueues,
    RequestState,
};
use crate::segments::Segments;
use crate::send::SendqMap;

/// Sequence state of a remote endpoint, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartnerInfo {
    pub addr: EndpointAddr,
    pub peer_index: u16,
    pub next_send_seq: u16,
    pub next_match_recv_seq: u16,
    pub early_packets: usize,
}

/// Engine state, only ever touched with the endpoint lock held.
pub(crate) struct EndpointInner {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) queues: Arc<EventQueues>,
    pub(crate) sendq: Arc<SendQueue>,
    pub(crate) handle: Handle,
    pub(crate) addr: EndpointAddr,
    pub(crate) key: u32,
    pub(crate) config: EndpointConfig,

    pub(crate) requests: RequestPool,
    pub(crate) reqq: RequestQueues,
    pub(crate) partners: PartnerTable,
    pub(crate) regions: RegionRegistry,
    pub(crate) sendq_map: SendqMap,
    /// Cancelled connects kept until their reply or deadline.
    pub(crate) zombies: Vec<RequestKey>,
    pub(crate) progress_deadline: Option<Instant>,

    next_exp: u64,
    next_unexp: u64,
    desc_status: DescStatus,
    closed: bool,
}

pub struct Endpoint {
    /// Held across `Driver::submit` and the region calls, which never block. Never
    /// held across `Driver::wait_event`.
    inner: spin::Mutex<EndpointInner>,
    queues: Arc<EventQueues>,
    driver: Arc<dyn Driver>,
    handle: Handle,
    addr: EndpointAddr,
}

impl Endpoint {
    /// Opens endpoint `endpoint_index` on board `board_index`.
    ///
    /// `key` is what remote endpoints must present to connect to this one.
    pub fn open(
        driver: Arc<dyn Driver>,
        board_index: u8,
        endpoint_index: u8,
        key: u32,
        config: &EndpointConfig,
    ) -> Result<Self> {
        config.validate()?;
        let queues = Arc::new(EventQueues::new(
            config.exp_eventq_entries,
            config.unexp_eventq_entries,
        ));
        let sendq = Arc::new(SendQueue::new(config.sendq_entries, SENDQ_ENTRY_SIZE));
        let info = driver.open_endpoint(
            board_index,
            endpoint_index,
            Arc::clone(&queues),
            Arc::clone(&sendq),
        )?;
        let handle = Handle::new(board_index, endpoint_index);
        let addr = EndpointAddr::new(info.board_addr, endpoint_index, info.session_id);
        tracing::info!(
            "opened endpoint {} on board {} (session {:#x})",
            endpoint_index,
            info.board_addr,
            info.session_id
        );

        let inner = EndpointInner {
            driver: Arc::clone(&driver),
            queues: Arc::clone(&queues),
            sendq,
            handle,
            addr,
            key,
            config: config.clone(),
            requests: RequestPool::new(config.request_pool_capacity),
            reqq: RequestQueues::default(),
            partners: PartnerTable::new(),
            regions: RegionRegistry::new(REGION_MAX),
            sendq_map: SendqMap::new(config.sendq_entries),
            zombies: Vec::new(),
            progress_deadline: None,
            next_exp: 0,
            next_unexp: 0,
            desc_status: DescStatus::empty(),
            closed: false,
        };
        Ok(Endpoint {
            inner: spin::Mutex::new(inner),
            queues,
            driver,
            handle,
            addr,
        })
    }

    #[inline]
    fn lock(&self) -> spin::MutexGuard<'_, EndpointInner> {
        self.inner.lock()
    }

    #[inline]
    pub fn addr(&self) -> EndpointAddr {
        self.addr
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The event rings the lower layer fills for this endpoint.
    #[inline]
    pub fn queues(&self) -> &Arc<EventQueues> {
        &self.queues
    }

    /// Posts a send of `segments` to `dest`.
    pub fn isend(
        &self,
        segments: impl Into<Segments>,
        dest: &EndpointAddr,
        match_info: u64,
        context: u64,
    ) -> Result<RequestHandle> {
        let mut inner = self.lock();
        let key = inner.isend(segments.into(), dest, match_info, context)?;
        Ok(inner.requests.handle(key))
    }

    /// Posts a receive into `segments` for messages with
    /// `msg_match_info & match_mask == match_info`.
    pub fn irecv(
        &self,
        segments: impl Into<Segments>,
        match_info: u64,
        match_mask: u64,
        context: u64,
    ) -> Result<RequestHandle> {
        let mut inner = self.lock();
        let key = inner.irecv(segments.into(), match_info, match_mask, context)?;
        Ok(inner.requests.handle(key))
    }

    pub fn iconnect(
        &self,
        board_addr: BoardAddr,
        endpoint_index: u8,
        key: u32,
        context: u64,
    ) -> Result<RequestHandle> {
        let mut inner = self.lock();
        let rkey = inner.iconnect(board_addr, endpoint_index, key, context)?;
        Ok(inner.requests.handle(rkey))
    }

    /// Connects and waits for the answer, giving up after `timeout`.
    pub fn connect(
        &self,
        board_addr: BoardAddr,
        endpoint_index: u8,
        key: u32,
        timeout: Option<Duration>,
    ) -> Result<EndpointAddr> {
        let handle = self.iconnect(board_addr, endpoint_index, key, 0)?;
        let completion = match self.wait(handle, timeout)? {
            Some(completion) => completion,
            None => match self.give_up_connect(handle)? {
                Some(completion) => completion,
                None => {
                    tracing::debug!(
                        "connect to {} endpoint {} timed out",
                        board_addr,
                        endpoint_index
                    );
                    return Err(Error::Timeout);
                }
            },
        };
        completion.status.code?;
        completion.status.addr.ok_or(Error::BadRequest)
    }

    /// Cancels a connect nobody waits for anymore. A reply that got in first is
    /// still handed back.
    pub(crate) fn give_up_connect(&self, handle: RequestHandle) -> Result<Option<Completion>> {
        let mut inner = self.lock();
        if inner.cancel(handle)? {
            return Ok(None);
        }
        let completion = inner.test_done(handle)?;
        if completion.is_none() {
            inner.forget(handle)?;
        }
        Ok(completion)
    }

    /// Drains both event rings.
    pub fn progress(&self) {
        self.lock().progress();
    }

    /// Retrieves `handle` if it is done.
    pub fn test(&self, handle: RequestHandle) -> Result<Option<Completion>> {
        self.lock().test(handle)
    }

    /// Blocks until `handle` is done. `Ok(None)` means the timeout passed or the
    /// endpoint was woken up first.
    pub fn wait(
        &self,
        handle: RequestHandle,
        timeout: Option<Duration>,
    ) -> Result<Option<Completion>> {
        self.block_on(timeout, |inner| inner.test_done(handle))
    }

    /// Retrieves any done request whose match information passes the mask.
    pub fn test_any(&self, match_info: u64, match_mask: u64) -> Result<Option<Completion>> {
        self.lock().test_any(match_info, match_mask)
    }

    pub fn wait_any(
        &self,
        match_info: u64,
        match_mask: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<Completion>> {
        self.block_on(timeout, |inner| inner.test_any_done(match_info, match_mask))
    }

    /// Names the oldest done request without retrieving it.
    pub fn ipeek(&self) -> Option<RequestHandle> {
        self.lock().ipeek()
    }

    pub fn peek(&self, timeout: Option<Duration>) -> Result<Option<RequestHandle>> {
        self.block_on(timeout, |inner| Ok(inner.peek_done()))
    }

    /// Looks for an unexpected message without receiving it.
    pub fn iprobe(&self, match_info: u64, match_mask: u64) -> Result<Option<Status>> {
        self.lock().iprobe(match_info, match_mask)
    }

    pub fn probe(
        &self,
        match_info: u64,
        match_mask: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<Status>> {
        if match_info & !match_mask != 0 {
            return Err(Error::BadMatchMask);
        }
        self.block_on(timeout, |inner| Ok(inner.probe_unexpected(match_info, match_mask)))
    }

    /// The application gives up on retrieving `handle`, it is freed once done.
    pub fn forget(&self, handle: RequestHandle) -> Result<()> {
        self.lock().forget(handle)
    }

    /// Withdraws a request that has not started. Returns whether it was withdrawn.
    pub fn cancel(&self, handle: RequestHandle) -> Result<bool> {
        self.lock().cancel(handle)
    }

    pub fn context(&self, handle: RequestHandle) -> Result<u64> {
        let inner = self.lock();
        let key = inner.requests.resolve(handle)?;
        Ok(inner.requests[key].status.context)
    }

    pub fn request_info(&self, handle: RequestHandle) -> Result<RequestInfo> {
        let inner = self.lock();
        let key = inner.requests.resolve(handle)?;
        let req = &inner.requests[key];
        Ok(RequestInfo {
            ty: req.ty,
            state: req.state,
            queue: req.queue,
            seqnum: req.seqnum,
        })
    }

    pub fn partner_info(&self, board_addr: BoardAddr, endpoint_index: u8) -> Option<PartnerInfo> {
        let inner = self.lock();
        let pidx = inner.partners.lookup(board_addr, endpoint_index)?;
        let partner = inner.partners.get(pidx);
        Some(PartnerInfo {
            addr: partner.addr,
            peer_index: partner.peer_index,
            next_send_seq: partner.next_send_seq,
            next_match_recv_seq: partner.next_match_recv_seq,
            early_packets: partner.early.len(),
        })
    }

    pub fn queue_len(&self, kind: QueueKind) -> usize {
        self.lock().reqq.len(kind)
    }

    /// Requests held on behalf of the application.
    pub fn requests_in_use(&self) -> usize {
        self.lock().requests.in_use()
    }

    pub fn regions_in_use(&self) -> usize {
        self.lock().regions.in_use()
    }

    /// Overflow conditions reported since the last call.
    pub fn take_queue_status(&self) -> DescStatus {
        let mut inner = self.lock();
        inner.progress();
        mem::take(&mut inner.desc_status)
    }

    /// Interrupts every thread blocked on this endpoint.
    pub fn wakeup(&self) -> Result<()> {
        self.driver.wakeup(self.handle)
    }

    /// Logs every live request.
    pub fn dump_requests(&self) {
        self.lock().dump_requests();
    }

    pub fn close(self) -> Result<()> {
        let res = self.lock().close();
        res
    }

    /// Runs `check` with progress until it yields, the timeout passes or the
    /// endpoint is woken up. The lock is released while sleeping.
    fn block_on<T>(
        &self,
        timeout: Option<Duration>,
        mut check: impl FnMut(&mut EndpointInner) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let param = {
                let mut inner = self.lock();
                inner.progress();
                if let Some(value) = check(&mut inner)? {
                    return Ok(Some(value));
                }
                if deadline.map_or(false, |d| Instant::now() >= d) {
                    return Ok(None);
                }
                WaitParam {
                    next_exp_index: inner.next_exp,
                    next_unexp_index: inner.next_unexp,
                    deadline,
                }
            };
            match self.driver.wait_event(self.handle, &param)? {
                WaitStatus::Intr => {
                    tracing::debug!("wait on endpoint {} interrupted", self.addr);
                    let mut inner = self.lock();
                    inner.progress();
                    return check(&mut inner);
                }
                status => tracing::trace!("woke up with {:?}", status),
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(e) = self.inner.get_mut().close() {
            tracing::warn!("closing endpoint {}: {}", self.addr, e);
        }
    }
}

impl EndpointInner {
    #[inline]
    pub(crate) fn enqueue(&mut self, kind: QueueKind, key: RequestKey) {
        self.reqq.enqueue(&mut self.requests, kind, key);
    }

    #[inline]
    pub(crate) fn dequeue(&mut self, key: RequestKey) -> QueueKind {
        self.reqq.dequeue(&mut self.requests, key)
    }

    /// Completes an unqueued request. Forgotten requests are freed right away.
    pub(crate) fn mark_done(&mut self, key: RequestKey) {
        let req = &mut self.requests[key];
        req.state.remove(
            RequestState::IN_DRIVER
                | RequestState::NEED_MATCHING
                | RequestState::RECV_PARTIAL
                | RequestState::NEED_REPLY
                | RequestState::SEND_SELF_UNEXPECTED
                | RequestState::DELAYED,
        );
        req.state.insert(RequestState::DONE);
        if req.forgotten {
            self.requests.free(key);
        } else {
            self.enqueue(QueueKind::Done, key);
        }
    }

    /// Registers `memory` under a fresh region id.
    pub(crate) fn register_region(&mut self, memory: RegionMemory) -> Result<RegionDescriptor> {
        let desc = self.regions.acquire()?;
        if let Err(e) = self.driver.register_region(self.handle, desc, memory) {
            self.regions.release(desc);
            return Err(e);
        }
        Ok(desc)
    }

    pub(crate) fn deregister_region(&mut self, desc: RegionDescriptor) {
        if let Err(e) = self.driver.deregister_region(self.handle, desc) {
            tracing::warn!("deregistering region {:?}: {}", desc, e);
        }
        self.regions.release(desc);
    }

    /// Processes every pending event of both rings.
    pub(crate) fn progress(&mut self) {
        while let Some(event) = self.queues.peek_exp(self.next_exp) {
            self.process_exp_event(event);
            self.queues.release_exp(self.next_exp);
            self.next_exp += 1;
        }
        while let Some(event) = self.queues.peek_unexp(self.next_unexp) {
            // recvq data is read before the slot goes back to the writer
            self.process_unexp_event(event);
            self.queues.release_unexp(self.next_unexp);
            self.next_unexp += 1;
        }

        if self
            .progress_deadline
            .map_or(false, |d| d <= Instant::now())
        {
            self.expire_connects(Instant::now());
        }

        let status = self.queues.take_status();
        if !status.is_empty() {
            tracing::warn!("endpoint {} event queue overflow: {:?}", self.addr, status);
            self.desc_status |= status;
        }
    }

    fn process_exp_event(&mut self, event: Event) {
        match event {
            Event::SendMediumFragDone { sendq_page } => self.medium_frag_done(sendq_page),
            Event::PullDone(done) => self.pull_done(&done),
            other => panic!(
                "{:?} event in the expected queue of endpoint {}",
                other.event_type(),
                self.addr
            ),
        }
    }

    fn process_unexp_event(&mut self, event: Event) {
        let queues = Arc::clone(&self.queues);
        match event {
            Event::RecvTiny(ev) => {
                let length = ev.hdr.length as usize;
                assert!(length <= TINY_MAX, "tiny message of {} bytes", length);
                self.process_msg(&ev.hdr, Payload::Data(&ev.data[..length]));
            }
            Event::RecvSmall(ev) => {
                queues
                    .recvq()
                    .with_page(ev.recvq_index as usize, ev.hdr.length as usize, |data| {
                        self.process_msg(&ev.hdr, Payload::Data(data))
                    });
            }
            Event::RecvMedium(ev) => {
                queues
                    .recvq()
                    .with_page(ev.recvq_index as usize, ev.frag_length as usize, |data| {
                        self.process_msg(
                            &ev.hdr,
                            Payload::MediumFrag {
                                frag_seqnum: ev.frag_seqnum,
                                data,
                            },
                        )
                    });
            }
            Event::RecvRndv(ev) => {
                let rndv = RndvDescriptor::from_bytes(&ev.data);
                self.process_msg(&ev.hdr, Payload::Rndv(rndv));
            }
            Event::RecvNotify(ev) => self.recv_notify(&ev),
            Event::RecvConnectRequest(ev) => self.recv_connect_request(&ev),
            Event::RecvConnectReply(ev) => self.recv_connect_reply(&ev),
            other => panic!(
                "{:?} event in the unexpected queue of endpoint {}",
                other.event_type(),
                self.addr
            ),
        }
    }

    pub(crate) fn dump_requests(&self) {
        tracing::info!(
            "endpoint {}: {} requests ({} for the application)",
            self.addr,
            self.requests.len(),
            self.requests.in_use()
        );
        for (key, req) in self.requests.iter() {
            tracing::info!(
                "  request {} type {} state {}queue {:?} seqnum {}",
                key,
                req.ty,
                req.state,
                req.queue,
                req.seqnum
            );
        }
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let registered: Vec<_> = self
            .requests
            .iter()
            .filter_map(|(_, req)| match &req.specific {
                crate::request::Specific::SendLarge { region }
                | crate::request::Specific::RecvLarge { region, .. } => Some(region.desc),
                _ => None,
            })
            .collect();
        for desc in registered {
            self.deregister_region(desc);
        }
        if self.requests.len() > 0 {
            tracing::debug!(
                "endpoint {} closed with {} requests outstanding",
                self.addr,
                self.requests.len()
            );
        }
        tracing::info!("closing endpoint {}", self.addr);
        self.driver.close_endpoint(self.handle)
    }
}
