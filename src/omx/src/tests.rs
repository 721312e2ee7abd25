//! Engine tests against a lower layer that records commands and lets the test
//! feed the event rings by hand.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fnv::FnvHashMap;

use ipc::{DescStatus, EventQueues, SendQueue};
use omx_api::cmd::{
    Command, Connect, ConnectReply, ConnectStatus, MsgHeader, Notify, Pull, RegionDescriptor,
    RndvDescriptor, SendMediumFrag, SendTiny,
};
use omx_api::event::{
    Event, PullDone, RecvConnect, RecvMedium, RecvMsgHeader, RecvNotify, RecvRndv, RecvSmall,
    RecvTiny, WaitParam, WaitStatus,
};
use omx_api::{Error, Handle, Result, MEDIUM_FRAG_LENGTH_MAX};

use crate::*;

const LOCAL_BOARD: BoardAddr = BoardAddr(0x1);
const REMOTE_BOARD: BoardAddr = BoardAddr(0x2);
const KEY: u32 = 0x1234;

#[derive(Debug, Clone)]
enum Sent {
    Tiny(SendTiny),
    Small(MsgHeader, Vec<u8>),
    Medium(SendMediumFrag, Vec<u8>),
    Rndv(MsgHeader, RndvDescriptor),
    Pull(Pull),
    Notify(Notify),
    Connect(Connect),
    ConnectReply(ConnectReply),
}

#[derive(Default)]
struct FakeState {
    queues: Option<Arc<EventQueues>>,
    sendq: Option<Arc<SendQueue>>,
    sent: Vec<Sent>,
    /// Submissions start failing once this many were accepted.
    fail_after: Option<usize>,
    regions: FnvHashMap<u8, RegionMemory>,
}

#[derive(Default)]
struct FakeDriver {
    state: Mutex<FakeState>,
}

impl FakeDriver {
    fn sent(&self) -> Vec<Sent> {
        self.state.lock().unwrap().sent.clone()
    }

    fn last(&self) -> Sent {
        self.state.lock().unwrap().sent.last().cloned().unwrap()
    }

    fn fail_after(&self, n: Option<usize>) {
        self.state.lock().unwrap().fail_after = n;
    }

    fn region(&self, id: u8) -> Option<RegionMemory> {
        self.state.lock().unwrap().regions.get(&id).cloned()
    }

    fn queues(&self) -> Arc<EventQueues> {
        self.state.lock().unwrap().queues.clone().unwrap()
    }
}

impl Driver for FakeDriver {
    fn open_endpoint(
        &self,
        _board_index: u8,
        _endpoint_index: u8,
        queues: Arc<EventQueues>,
        sendq: Arc<SendQueue>,
    ) -> Result<EndpointInfo> {
        let mut state = self.state.lock().unwrap();
        state.queues = Some(queues);
        state.sendq = Some(sendq);
        Ok(EndpointInfo {
            board_addr: LOCAL_BOARD,
            session_id: 7,
        })
    }

    fn close_endpoint(&self, _ep: Handle) -> Result<()> {
        Ok(())
    }

    fn submit(&self, _ep: Handle, cmd: &Command<'_>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_after.map_or(false, |n| state.sent.len() >= n) {
            return Err(Error::Busy);
        }
        let sent = match *cmd {
            Command::SendTiny(c) => Sent::Tiny(c),
            Command::SendSmall(c) => Sent::Small(c.hdr, c.data.to_vec()),
            Command::SendMediumFrag(c) => {
                let sendq = state.sendq.as_ref().unwrap();
                let data = sendq.with_page(c.sendq_page as usize, c.frag_length as usize, |d| {
                    d.to_vec()
                });
                Sent::Medium(c, data)
            }
            Command::SendRndv(c) => Sent::Rndv(c.hdr, RndvDescriptor::from_bytes(&c.data)),
            Command::Pull(c) => Sent::Pull(c),
            Command::Notify(c) => Sent::Notify(c),
            Command::Connect(c) => Sent::Connect(c),
            Command::ConnectReply(c) => Sent::ConnectReply(c),
        };
        state.sent.push(sent);
        Ok(())
    }

    fn register_region(
        &self,
        _ep: Handle,
        region: RegionDescriptor,
        memory: RegionMemory,
    ) -> Result<()> {
        let prev = self.state.lock().unwrap().regions.insert(region.id, memory);
        assert!(prev.is_none());
        Ok(())
    }

    fn deregister_region(&self, _ep: Handle, region: RegionDescriptor) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .regions
            .remove(&region.id)
            .map(|_| ())
            .ok_or(Error::BadRequest)
    }

    fn wait_event(&self, _ep: Handle, param: &WaitParam) -> Result<WaitStatus> {
        Ok(self.queues().wait_event(param))
    }

    fn wakeup(&self, _ep: Handle) -> Result<()> {
        self.queues().interrupt();
        Ok(())
    }
}

fn open_with(config: EndpointConfig) -> (Arc<FakeDriver>, Endpoint) {
    let fake = Arc::new(FakeDriver::default());
    let ep = Endpoint::open(fake.clone(), 0, 0, KEY, &config).unwrap();
    (fake, ep)
}

fn open() -> (Arc<FakeDriver>, Endpoint) {
    open_with(EndpointConfig::default())
}

fn remote(endpoint_index: u8) -> EndpointAddr {
    EndpointAddr::new(REMOTE_BOARD, endpoint_index, 9)
}

fn hdr(seqnum: u16, match_info: u64, length: usize) -> RecvMsgHeader {
    RecvMsgHeader {
        src: remote(0),
        peer_index: 3,
        match_info,
        seqnum,
        length: length as u32,
    }
}

fn deliver_tiny(ep: &Endpoint, seqnum: u16, match_info: u64, data: &[u8]) {
    let mut buf = [0u8; 32];
    buf[..data.len()].copy_from_slice(data);
    ep.queues()
        .notify_unexp(Event::RecvTiny(RecvTiny {
            hdr: hdr(seqnum, match_info, data.len()),
            data: buf,
        }))
        .unwrap();
}

fn deliver_small(ep: &Endpoint, seqnum: u16, match_info: u64, data: &[u8]) {
    let queues = ep.queues();
    let recvq_index = queues.prepare_unexp_with_recvq().unwrap();
    queues.write_recvq(recvq_index, data);
    queues.commit_unexp_with_recvq(Event::RecvSmall(RecvSmall {
        hdr: hdr(seqnum, match_info, data.len()),
        recvq_index,
    }));
}

fn deliver_frag(ep: &Endpoint, seqnum: u16, match_info: u64, msg: &[u8], frag_seqnum: u8) {
    let start = frag_seqnum as usize * MEDIUM_FRAG_LENGTH_MAX;
    let end = msg.len().min(start + MEDIUM_FRAG_LENGTH_MAX);
    let queues = ep.queues();
    let recvq_index = queues.prepare_unexp_with_recvq().unwrap();
    queues.write_recvq(recvq_index, &msg[start..end]);
    queues.commit_unexp_with_recvq(Event::RecvMedium(RecvMedium {
        hdr: hdr(seqnum, match_info, msg.len()),
        frag_seqnum,
        frag_length: (end - start) as u16,
        recvq_index,
    }));
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn sent_seqnums(fake: &FakeDriver) -> Vec<u16> {
    fake.sent()
        .iter()
        .filter_map(|s| match s {
            Sent::Tiny(c) => Some(c.hdr.seqnum),
            Sent::Small(hdr, _) | Sent::Rndv(hdr, _) => Some(hdr.seqnum),
            Sent::Medium(c, _) if c.frag_seqnum == 0 => Some(c.hdr.seqnum),
            _ => None,
        })
        .collect()
}

#[test]
fn tiny_send_to_a_fresh_partner() {
    let (fake, ep) = open();
    let data = pattern(16);
    let h = ep.isend(data.clone(), &remote(0), 0x42, 5).unwrap();

    let done = ep.test(h).unwrap().expect("tiny sends complete immediately");
    assert!(done.status.is_success());
    assert_eq!(done.status.context, 5);
    assert_eq!(done.status.xfer_length, 16);
    assert_eq!(done.segments.into_contiguous(), data);

    match fake.last() {
        Sent::Tiny(c) => {
            assert_eq!(c.hdr.seqnum, 0);
            assert_eq!(c.hdr.length, 16);
            assert_eq!(c.hdr.dest, remote(0));
            assert_eq!(&c.data[..16], &data[..]);
        }
        other => panic!("expected a tiny send, got {:?}", other),
    }
    let partner = ep.partner_info(REMOTE_BOARD, 0).unwrap();
    assert_eq!(partner.next_send_seq, 1);
}

#[test]
fn failed_submissions_do_not_consume_seqnums() {
    let (fake, ep) = open();
    ep.isend(pattern(8), &remote(0), 0, 0).unwrap();
    fake.fail_after(Some(1));
    assert_eq!(ep.isend(pattern(100), &remote(0), 0, 0).unwrap_err(), Error::Busy);
    assert_eq!(ep.isend(pattern(50_000), &remote(0), 0, 0).unwrap_err(), Error::Busy);
    assert_eq!(ep.regions_in_use(), 0);
    fake.fail_after(None);
    ep.isend(pattern(100), &remote(0), 0, 0).unwrap();
    ep.isend(pattern(5000), &remote(0), 0, 0).unwrap();
    ep.isend(pattern(50_000), &remote(0), 0, 0).unwrap();
    assert_eq!(sent_seqnums(&fake), vec![0, 1, 2, 3]);
    assert_eq!(ep.partner_info(REMOTE_BOARD, 0).unwrap().next_send_seq, 4);
}

#[test]
fn small_send_from_scattered_buffers() {
    let (fake, ep) = open();
    let data = pattern(100);
    let segs = vec![data[..30].to_vec(), data[30..].to_vec()];
    let h = ep.isend(segs, &remote(0), 1, 0).unwrap();
    assert!(ep.test(h).unwrap().unwrap().status.is_success());
    match fake.last() {
        Sent::Small(hdr, payload) => {
            assert_eq!(hdr.length, 100);
            assert_eq!(payload, data);
        }
        other => panic!("expected a small send, got {:?}", other),
    }
}

#[test]
fn medium_send_completes_when_every_fragment_left() {
    let (fake, ep) = open();
    let data = pattern(10_000);
    let h = ep.isend(data.clone(), &remote(0), 1, 0).unwrap();

    let frags: Vec<_> = fake
        .sent()
        .into_iter()
        .filter_map(|s| match s {
            Sent::Medium(c, payload) => Some((c, payload)),
            _ => None,
        })
        .collect();
    assert_eq!(frags.len(), 3);
    let joined: Vec<u8> = frags.iter().flat_map(|(_, p)| p.iter().copied()).collect();
    assert_eq!(joined, data);
    for (i, (c, _)) in frags.iter().enumerate() {
        assert_eq!(c.frag_seqnum as usize, i);
        assert_eq!(c.hdr.length, 10_000);
    }

    assert!(ep.test(h).unwrap().is_none());
    assert_eq!(ep.queue_len(QueueKind::Sent), 1);
    for (c, _) in &frags {
        ep.queues()
            .notify_exp(Event::SendMediumFragDone {
                sendq_page: c.sendq_page,
            })
            .unwrap();
    }
    let done = ep.test(h).unwrap().unwrap();
    assert!(done.status.is_success());
    assert_eq!(done.segments.into_contiguous(), data);
    assert_eq!(ep.queue_len(QueueKind::Sent), 0);
}

#[test]
fn medium_send_without_sendq_pages() {
    let config = EndpointConfig {
        sendq_entries: 2,
        ..Default::default()
    };
    let (fake, ep) = open_with(config);
    assert_eq!(
        ep.isend(pattern(10_000), &remote(0), 0, 0).unwrap_err(),
        Error::NoResources
    );
    assert!(fake.sent().is_empty());
    assert_eq!(ep.requests_in_use(), 0);
    ep.isend(pattern(8000), &remote(0), 0, 0).unwrap();
    assert_eq!(sent_seqnums(&fake), vec![0]);
}

#[test]
fn medium_send_failing_midway_keeps_its_seqnum() {
    let (fake, ep) = open();
    fake.fail_after(Some(2));
    assert_eq!(
        ep.isend(pattern(10_000), &remote(0), 0, 0).unwrap_err(),
        Error::Busy
    );
    assert_eq!(ep.partner_info(REMOTE_BOARD, 0).unwrap().next_send_seq, 0);
    assert_eq!(ep.requests_in_use(), 0);

    // the two fragments that left still hold their pages
    let pages: Vec<_> = fake
        .sent()
        .into_iter()
        .filter_map(|s| match s {
            Sent::Medium(c, _) => Some(c.sendq_page),
            _ => None,
        })
        .collect();
    assert_eq!(pages.len(), 2);
    assert_eq!(ep.queue_len(QueueKind::Sent), 1);
    for page in pages {
        ep.queues()
            .notify_exp(Event::SendMediumFragDone { sendq_page: page })
            .unwrap();
    }
    ep.progress();
    assert_eq!(ep.queue_len(QueueKind::Sent), 0);
    assert!(ep.ipeek().is_none());

    fake.fail_after(None);
    ep.isend(pattern(10_000), &remote(0), 0, 0).unwrap();
    assert_eq!(sent_seqnums(&fake), vec![0, 0]);
    assert_eq!(ep.partner_info(REMOTE_BOARD, 0).unwrap().next_send_seq, 1);
}

#[test]
fn resent_medium_fills_in_the_missing_fragments() {
    let (_fake, ep) = open();
    let msg = pattern(10_000);
    let h = ep.irecv(vec![0u8; 10_000], 0, 0, 0).unwrap();
    deliver_frag(&ep, 0, 0x5, &msg, 0);
    deliver_frag(&ep, 0, 0x5, &msg, 1);
    assert!(ep.test(h).unwrap().is_none());
    assert_eq!(ep.queue_len(QueueKind::MultifragMediumRecv), 1);

    for frag in 0..3 {
        deliver_frag(&ep, 0, 0x5, &msg, frag);
    }
    let done = ep.test(h).unwrap().unwrap();
    assert!(done.status.is_success());
    assert_eq!(done.segments.into_contiguous(), msg);
    assert_eq!(ep.queue_len(QueueKind::MultifragMediumRecv), 0);
    assert_eq!(ep.queue_len(QueueKind::Unexp), 0);

    deliver_tiny(&ep, 1, 0x6, b"next");
    ep.progress();
    assert_eq!(ep.queue_len(QueueKind::Unexp), 1);
    assert_eq!(ep.partner_info(REMOTE_BOARD, 0).unwrap().next_match_recv_seq, 2);
}

#[test]
fn posted_receive_takes_the_arrival() {
    let (_fake, ep) = open();
    let h = ep.irecv(vec![0u8; 16], 0x42, 0xff, 0).unwrap();
    assert_eq!(ep.queue_len(QueueKind::Recv), 1);
    deliver_tiny(&ep, 0, 0x42, b"hello");

    let done = ep.test(h).unwrap().unwrap();
    assert!(done.status.is_success());
    assert_eq!(done.status.match_info, 0x42);
    assert_eq!(done.status.msg_length, 5);
    assert_eq!(done.status.xfer_length, 5);
    assert_eq!(done.status.addr, Some(remote(0)));
    assert_eq!(&done.segments.into_contiguous()[..5], b"hello");
    assert_eq!(ep.queue_len(QueueKind::Unexp), 0);
    assert_eq!(ep.queue_len(QueueKind::Recv), 0);
}

#[test]
fn unexpected_message_waits_for_a_receive() {
    let (_fake, ep) = open();
    let data = pattern(100);
    deliver_small(&ep, 0, 0x1_0007, &data);

    assert!(ep.iprobe(0x2_0000, 0xffff_0000).unwrap().is_none());
    let status = ep.iprobe(0x1_0000, 0xffff_0000).unwrap().unwrap();
    assert_eq!(status.msg_length, 100);
    assert_eq!(status.match_info, 0x1_0007);
    assert_eq!(ep.requests_in_use(), 0);

    let h = ep.irecv(vec![0u8; 128], 0x1_0000, 0xffff_0000, 3).unwrap();
    let done = ep.test(h).unwrap().unwrap();
    assert_eq!(done.status.context, 3);
    assert_eq!(done.status.xfer_length, 100);
    assert_eq!(&done.segments.into_contiguous()[..100], &data[..]);
    assert_eq!(ep.queue_len(QueueKind::Unexp), 0);
}

#[test]
fn short_receive_buffer_truncates() {
    let (_fake, ep) = open();
    let h = ep.irecv(vec![0u8; 4], 0, 0, 0).unwrap();
    deliver_tiny(&ep, 0, 9, b"0123456789");
    let done = ep.test(h).unwrap().unwrap();
    assert_eq!(done.status.code, Err(Error::MessageTruncated));
    assert_eq!(done.status.msg_length, 10);
    assert_eq!(done.status.xfer_length, 4);
    assert_eq!(done.segments.into_contiguous(), b"0123");
}

#[test]
fn early_messages_are_matched_in_order() {
    let (_fake, ep) = open();
    let first = ep.irecv(vec![0u8; 8], 0, 0, 1).unwrap();
    let second = ep.irecv(vec![0u8; 8], 0, 0, 2).unwrap();
    deliver_tiny(&ep, 1, 0, b"second");
    ep.progress();
    assert!(ep.test(first).unwrap().is_none());
    assert_eq!(ep.partner_info(REMOTE_BOARD, 0).unwrap().early_packets, 1);

    deliver_tiny(&ep, 0, 0, b"first");
    let a = ep.test(first).unwrap().unwrap();
    let b = ep.test(second).unwrap().unwrap();
    assert_eq!(&a.segments.into_contiguous()[..5], b"first");
    assert_eq!(&b.segments.into_contiguous()[..6], b"second");

    // already delivered
    deliver_tiny(&ep, 0, 0, b"again");
    ep.progress();
    assert!(ep.iprobe(0, 0).unwrap().is_none());
    let partner = ep.partner_info(REMOTE_BOARD, 0).unwrap();
    assert_eq!(partner.next_match_recv_seq, 2);
    assert_eq!(partner.early_packets, 0);
}

#[test]
fn medium_fragments_in_any_order() {
    let (_fake, ep) = open();
    let msg = pattern(3 * MEDIUM_FRAG_LENGTH_MAX + 10);
    let h = ep.irecv(vec![vec![0u8; 5000], vec![0u8; 10_000]], 4, !0, 0).unwrap();
    for frag in [2u8, 0, 3, 1] {
        deliver_frag(&ep, 0, 4, &msg, frag);
    }
    let done = ep.test(h).unwrap().unwrap();
    assert!(done.status.is_success());
    assert_eq!(done.status.xfer_length as usize, msg.len());
    assert_eq!(&done.segments.into_contiguous()[..msg.len()], &msg[..]);
    assert_eq!(ep.queue_len(QueueKind::MultifragMediumRecv), 0);
}

#[test]
fn partial_unexpected_medium_finishes_after_the_receive() {
    let (_fake, ep) = open();
    let msg = pattern(6000);
    deliver_frag(&ep, 0, 8, &msg, 1);
    ep.progress();
    assert_eq!(ep.queue_len(QueueKind::Unexp), 1);

    let h = ep.irecv(vec![0u8; 6000], 8, !0, 0).unwrap();
    assert!(ep.test(h).unwrap().is_none());
    assert_eq!(ep.queue_len(QueueKind::MultifragMediumRecv), 1);
    let info = ep.request_info(h).unwrap();
    assert!(info.state.contains(RequestState::RECV_PARTIAL));

    deliver_frag(&ep, 0, 8, &msg, 0);
    let done = ep.test(h).unwrap().unwrap();
    assert!(done.status.is_success());
    assert_eq!(done.segments.into_contiguous(), msg);
}

#[test]
fn fragments_of_an_early_medium_are_replayed() {
    let (_fake, ep) = open();
    let msg = pattern(5000);
    let a = ep.irecv(vec![0u8; 8], 0, 0, 0).unwrap();
    let b = ep.irecv(vec![0u8; 5000], 0, 0, 0).unwrap();
    deliver_frag(&ep, 1, 0, &msg, 0);
    deliver_frag(&ep, 1, 0, &msg, 1);
    ep.progress();
    assert_eq!(ep.partner_info(REMOTE_BOARD, 0).unwrap().early_packets, 2);

    deliver_tiny(&ep, 0, 0, b"tiny");
    assert!(ep.test(a).unwrap().is_some());
    let done = ep.test(b).unwrap().unwrap();
    assert_eq!(done.segments.into_contiguous(), msg);
}

#[test]
fn cancel_semantics() {
    let (_fake, ep) = open();

    let recv = ep.irecv(vec![0u8; 8], 1, !0, 0).unwrap();
    assert_eq!(ep.requests_in_use(), 1);
    assert!(ep.cancel(recv).unwrap());
    assert_eq!(ep.requests_in_use(), 0);
    assert_eq!(ep.queue_len(QueueKind::Recv), 0);
    assert_eq!(ep.cancel(recv).unwrap_err(), Error::BadRequest);

    let send = ep.isend(pattern(5000), &remote(0), 0, 0).unwrap();
    assert_eq!(ep.cancel(send).unwrap_err(), Error::BadRequest);
    assert_eq!(ep.queue_len(QueueKind::Sent), 1);

    let large = ep.irecv(vec![0u8; 100_000], 2, !0, 0).unwrap();
    let rndv = RndvDescriptor {
        length: 90_000,
        region: RegionDescriptor {
            id: 4,
            seqnum: 1,
            offset: 0,
        },
    };
    ep.queues()
        .notify_unexp(Event::RecvRndv(RecvRndv {
            hdr: hdr(0, 2, 90_000),
            data: rndv.to_bytes(),
        }))
        .unwrap();
    ep.progress();
    assert!(!ep.cancel(large).unwrap());
    let info = ep.request_info(large).unwrap();
    assert_eq!(info.ty, RequestType::RecvLarge);
    assert_eq!(info.queue, Some(QueueKind::LargeRecv));
}

#[test]
fn large_send_completes_on_notify() {
    let (fake, ep) = open();
    let data = pattern(100_000);
    let h = ep.isend(data.clone(), &remote(0), 6, 0).unwrap();
    let rndv = match fake.last() {
        Sent::Rndv(hdr, rndv) => {
            assert_eq!(hdr.length, 100_000);
            rndv
        }
        other => panic!("expected a rendezvous, got {:?}", other),
    };
    assert_eq!(rndv.length, 100_000);
    assert_eq!(ep.regions_in_use(), 1);
    assert_eq!(ep.queue_len(QueueKind::LargeSend), 1);
    assert!(ep.test(h).unwrap().is_none());

    // notify for another region is ignored
    let mut other = rndv.region;
    other.seqnum = other.seqnum.wrapping_add(1);
    let notify = |region| {
        Event::RecvNotify(RecvNotify {
            src: remote(0),
            peer_index: 3,
            total_length: 100_000,
            puller_region: region,
        })
    };
    ep.queues().notify_unexp(notify(other)).unwrap();
    assert!(ep.test(h).unwrap().is_none());

    ep.queues().notify_unexp(notify(rndv.region)).unwrap();
    let done = ep.test(h).unwrap().unwrap();
    assert!(done.status.is_success());
    assert_eq!(done.status.xfer_length, 100_000);
    assert_eq!(done.segments.into_contiguous(), data);
    assert_eq!(ep.regions_in_use(), 0);
    assert!(fake.region(rndv.region.id).is_none());
}

#[test]
fn large_receive_pulls_then_notifies() {
    let (fake, ep) = open();
    let payload = pattern(40_000);
    let h = ep.irecv(vec![0u8; 50_000], 7, !0, 0).unwrap();
    let remote_region = RegionDescriptor {
        id: 5,
        seqnum: 1,
        offset: 0,
    };
    let rndv = RndvDescriptor {
        length: 40_000,
        region: remote_region,
    };
    ep.queues()
        .notify_unexp(Event::RecvRndv(RecvRndv {
            hdr: hdr(0, 7, 40_000),
            data: rndv.to_bytes(),
        }))
        .unwrap();
    ep.progress();

    let pull = match fake.last() {
        Sent::Pull(pull) => pull,
        other => panic!("expected a pull, got {:?}", other),
    };
    assert_eq!(pull.length, 40_000);
    assert_eq!(pull.remote, remote_region);
    assert_eq!(pull.dest, remote(0));

    let memory = fake.region(pull.local.id).unwrap();
    memory.lock().copy_to_segments(&payload);
    let pull_done = |local_region| {
        Event::PullDone(PullDone {
            lib_cookie: pull.lib_cookie,
            status: Ok(()),
            pulled_length: 40_000,
            local_region,
        })
    };
    // same slot, earlier registration
    let stale = RegionDescriptor {
        seqnum: pull.local.seqnum.wrapping_sub(1),
        ..pull.local
    };
    ep.queues().notify_exp(pull_done(stale)).unwrap();
    assert!(ep.test(h).unwrap().is_none());
    assert_eq!(ep.queue_len(QueueKind::LargeRecv), 1);
    ep.queues().notify_exp(pull_done(pull.local)).unwrap();

    let done = ep.test(h).unwrap().unwrap();
    assert!(done.status.is_success());
    assert_eq!(done.status.msg_length, 40_000);
    assert_eq!(done.status.xfer_length, 40_000);
    assert_eq!(&done.segments.into_contiguous()[..40_000], &payload[..]);
    assert_eq!(ep.regions_in_use(), 0);
    match fake.last() {
        Sent::Notify(n) => {
            assert_eq!(n.total_length, 40_000);
            assert_eq!(n.puller_region, remote_region);
        }
        other => panic!("expected a notify, got {:?}", other),
    }
}

#[test]
fn connect_handshake() {
    let (fake, ep) = open();
    let h = ep.iconnect(REMOTE_BOARD, 0, 0xabc, 11).unwrap();
    let c = match fake.last() {
        Sent::Connect(c) => c,
        other => panic!("expected a connect, got {:?}", other),
    };
    assert_eq!(c.app_key, 0xabc);
    assert_eq!(c.connect_seqnum, 1);
    assert_eq!(c.recv_seqnum_start, 0);
    assert_eq!(ep.queue_len(QueueKind::Connect), 1);

    let reply = |connect_seqnum| {
        Event::RecvConnectReply(RecvConnect {
            src: remote(0),
            peer_index: 4,
            app_key: 0,
            connect_seqnum,
            lib_cookie: c.lib_cookie,
            recv_seqnum_start: 5,
            status: ConnectStatus::Success,
        })
    };
    // a reply to an older attempt
    ep.queues().notify_unexp(reply(0)).unwrap();
    assert!(ep.test(h).unwrap().is_none());

    ep.queues().notify_unexp(reply(1)).unwrap();
    let done = ep.test(h).unwrap().unwrap();
    assert!(done.status.is_success());
    assert_eq!(done.status.context, 11);
    assert_eq!(done.status.addr, Some(remote(0)));
    let partner = ep.partner_info(REMOTE_BOARD, 0).unwrap();
    assert_eq!(partner.next_send_seq, 5);
    assert_eq!(partner.peer_index, 4);
    assert_eq!(partner.addr.session_id, 9);
}

#[test]
fn connect_with_a_wrong_key() {
    let (fake, ep) = open();
    let h = ep.iconnect(REMOTE_BOARD, 0, 1, 0).unwrap();
    let c = match fake.last() {
        Sent::Connect(c) => c,
        other => panic!("expected a connect, got {:?}", other),
    };
    ep.queues()
        .notify_unexp(Event::RecvConnectReply(RecvConnect {
            src: remote(0),
            peer_index: 4,
            app_key: 0,
            connect_seqnum: c.connect_seqnum,
            lib_cookie: c.lib_cookie,
            recv_seqnum_start: 0,
            status: ConnectStatus::BadKey,
        }))
        .unwrap();
    let done = ep.test(h).unwrap().unwrap();
    assert_eq!(done.status.code, Err(Error::RemoteEndpointBadConnectionKey));
}

#[test]
fn answering_connect_requests() {
    let (fake, ep) = open();
    let request = |app_key| {
        Event::RecvConnectRequest(RecvConnect {
            src: remote(1),
            peer_index: 2,
            app_key,
            connect_seqnum: 3,
            lib_cookie: 77,
            recv_seqnum_start: 12,
            status: ConnectStatus::Success,
        })
    };

    ep.queues().notify_unexp(request(KEY + 1)).unwrap();
    ep.progress();
    match fake.last() {
        Sent::ConnectReply(r) => assert_eq!(r.status, ConnectStatus::BadKey),
        other => panic!("expected a reply, got {:?}", other),
    }
    assert!(ep.partner_info(REMOTE_BOARD, 1).is_none());

    ep.queues().notify_unexp(request(KEY)).unwrap();
    ep.progress();
    match fake.last() {
        Sent::ConnectReply(r) => {
            assert_eq!(r.status, ConnectStatus::Success);
            assert_eq!((r.dest_board, r.dest_endpoint), (REMOTE_BOARD, 1));
            assert_eq!(r.connect_seqnum, 3);
            assert_eq!(r.lib_cookie, 77);
            assert_eq!(r.recv_seqnum_start, 0);
        }
        other => panic!("expected a reply, got {:?}", other),
    }
    let partner = ep.partner_info(REMOTE_BOARD, 1).unwrap();
    assert_eq!(partner.peer_index, 2);
    assert_eq!(partner.addr, remote(1));
}

#[test]
fn connect_times_out() {
    let config = EndpointConfig {
        connect_timeout_ms: 20,
        ..Default::default()
    };
    let (_fake, ep) = open_with(config);
    let res = ep.connect(REMOTE_BOARD, 0, 1, Some(Duration::from_secs(5)));
    assert_eq!(res.unwrap_err(), Error::Timeout);
    assert_eq!(ep.requests_in_use(), 0);
}

#[test]
fn cancelled_connect_lingers_until_its_reply() {
    let (fake, ep) = open();
    let res = ep.connect(REMOTE_BOARD, 0, 1, Some(Duration::from_millis(10)));
    assert_eq!(res.unwrap_err(), Error::Timeout);
    assert_eq!(ep.requests_in_use(), 1);
    assert_eq!(ep.queue_len(QueueKind::Connect), 0);

    let c = match fake.last() {
        Sent::Connect(c) => c,
        other => panic!("expected a connect, got {:?}", other),
    };
    ep.queues()
        .notify_unexp(Event::RecvConnectReply(RecvConnect {
            src: remote(0),
            peer_index: 4,
            app_key: 0,
            connect_seqnum: c.connect_seqnum,
            lib_cookie: c.lib_cookie,
            recv_seqnum_start: 0,
            status: ConnectStatus::Success,
        }))
        .unwrap();
    ep.progress();
    assert_eq!(ep.requests_in_use(), 0);
    assert!(ep.ipeek().is_none());
}

#[test]
fn connect_answered_while_giving_up() {
    let (fake, ep) = open();
    let h = ep.iconnect(REMOTE_BOARD, 0, 1, 0).unwrap();
    let c = match fake.last() {
        Sent::Connect(c) => c,
        other => panic!("expected a connect, got {:?}", other),
    };
    // the reply lands after the wait stopped looking
    ep.queues()
        .notify_unexp(Event::RecvConnectReply(RecvConnect {
            src: remote(0),
            peer_index: 4,
            app_key: 0,
            connect_seqnum: c.connect_seqnum,
            lib_cookie: c.lib_cookie,
            recv_seqnum_start: 0,
            status: ConnectStatus::Success,
        }))
        .unwrap();
    let done = ep.give_up_connect(h).unwrap().unwrap();
    assert!(done.status.is_success());
    assert_eq!(done.status.addr, Some(remote(0)));
    assert_eq!(ep.requests_in_use(), 0);
    assert!(ep.ipeek().is_none());

    // no reply: the connect lingers as a zombie
    ep.iconnect(REMOTE_BOARD, 0, 1, 0).unwrap();
    let h = ep.iconnect(REMOTE_BOARD, 1, 1, 0).unwrap();
    assert!(ep.give_up_connect(h).unwrap().is_none());
    assert_eq!(ep.test(h).unwrap_err(), Error::BadRequest);
    assert_eq!(ep.queue_len(QueueKind::Connect), 1);
}

#[test]
fn send_to_self() {
    let (fake, ep) = open();
    let send = ep.isend(b"hello".to_vec(), &ep.addr(), 9, 0).unwrap();
    assert!(ep.test(send).unwrap().is_none());
    let info = ep.request_info(send).unwrap();
    assert!(info.state.contains(RequestState::SEND_SELF_UNEXPECTED));
    assert_eq!(ep.iprobe(9, !0).unwrap().unwrap().msg_length, 5);

    let recv = ep.irecv(vec![0u8; 8], 9, !0, 0).unwrap();
    let r = ep.test(recv).unwrap().unwrap();
    assert_eq!(r.status.xfer_length, 5);
    assert_eq!(r.status.addr, Some(ep.addr()));
    assert_eq!(&r.segments.into_contiguous()[..5], b"hello");
    let s = ep.test(send).unwrap().unwrap();
    assert_eq!(s.status.xfer_length, 5);

    let recv = ep.irecv(vec![0u8; 2], 10, !0, 0).unwrap();
    let send = ep.isend(b"abc".to_vec(), &ep.addr(), 10, 0).unwrap();
    assert!(ep.test(send).unwrap().is_some());
    let r = ep.test(recv).unwrap().unwrap();
    assert_eq!(r.status.code, Err(Error::MessageTruncated));
    assert!(fake.sent().is_empty());
}

#[test]
fn argument_checks() {
    let (_fake, ep) = open();
    assert_eq!(
        ep.irecv(vec![0u8; 1], 0x100, 0xff, 0).unwrap_err(),
        Error::BadMatchMask
    );
    assert_eq!(ep.test_any(0x100, 0xff).unwrap_err(), Error::BadMatchMask);
    assert_eq!(
        ep.isend(vec![vec![0u8; 1]; 257], &remote(0), 0, 0).unwrap_err(),
        Error::SegmentsBadCount
    );
    assert!(ep.partner_info(REMOTE_BOARD, 0).is_none());
}

#[test]
fn request_pool_is_bounded() {
    let config = EndpointConfig {
        request_pool_capacity: 2,
        ..Default::default()
    };
    let (_fake, ep) = open_with(config);
    ep.irecv(vec![0u8; 1], 0, 0, 0).unwrap();
    ep.irecv(vec![0u8; 1], 0, 0, 0).unwrap();
    assert_eq!(ep.irecv(vec![0u8; 1], 0, 0, 0).unwrap_err(), Error::NoResources);
    // arrivals still find room
    deliver_tiny(&ep, 0, 0, b"a");
    deliver_tiny(&ep, 1, 0, b"b");
    deliver_tiny(&ep, 2, 0, b"c");
    ep.progress();
    assert_eq!(ep.queue_len(QueueKind::Done), 2);
    assert_eq!(ep.queue_len(QueueKind::Unexp), 1);
}

#[test]
fn forget_and_any() {
    let (_fake, ep) = open();
    let a = ep.isend(b"a".to_vec(), &remote(0), 1, 0).unwrap();
    let b = ep.isend(b"b".to_vec(), &remote(0), 2, 0).unwrap();
    let done = ep.test_any(2, !0).unwrap().unwrap();
    assert_eq!(done.status.match_info, 2);
    assert_eq!(ep.test(b).unwrap_err(), Error::BadRequest);
    assert_eq!(ep.ipeek(), Some(a));
    ep.forget(a).unwrap();
    assert_eq!(ep.requests_in_use(), 0);
    assert!(ep.ipeek().is_none());

    let r = ep.irecv(vec![0u8; 4], 0, 0, 0).unwrap();
    ep.forget(r).unwrap();
    assert_eq!(ep.requests_in_use(), 1);
    deliver_tiny(&ep, 0, 0, b"x");
    ep.progress();
    assert_eq!(ep.requests_in_use(), 0);
    assert_eq!(ep.queue_len(QueueKind::Done), 0);
}

#[test]
fn full_unexpected_queue_is_reported() {
    let config = EndpointConfig {
        unexp_eventq_entries: 2,
        ..Default::default()
    };
    let (_fake, ep) = open_with(config);
    deliver_tiny(&ep, 0, 0, b"a");
    deliver_tiny(&ep, 1, 0, b"b");
    let extra = ep.queues().notify_unexp(Event::RecvTiny(RecvTiny {
        hdr: hdr(2, 0, 1),
        data: [0u8; 32],
    }));
    assert_eq!(extra.unwrap_err(), Error::Busy);
    assert!(ep
        .take_queue_status()
        .contains(DescStatus::UNEXP_EVENTQ_FULL));
    assert!(ep.take_queue_status().is_empty());
    assert_eq!(ep.queue_len(QueueKind::Unexp), 2);
}

#[test]
fn blocking_wait_returns_on_arrival_timeout_or_wakeup() {
    let (_fake, ep) = open();
    let h = ep.irecv(vec![0u8; 8], 1, !0, 0).unwrap();
    assert!(ep.wait(h, Some(Duration::from_millis(20))).unwrap().is_none());

    let woken = AtomicBool::new(false);
    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            assert!(ep.wait(h, None).unwrap().is_none());
            woken.store(true, Ordering::Release);
        });
        while !woken.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
            ep.wakeup().unwrap();
        }
    })
    .unwrap();

    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            thread::sleep(Duration::from_millis(20));
            deliver_tiny(&ep, 0, 1, b"late");
        });
        let done = ep.wait(h, Some(Duration::from_secs(10))).unwrap().unwrap();
        assert_eq!(done.status.xfer_length, 4);
    })
    .unwrap();
}
