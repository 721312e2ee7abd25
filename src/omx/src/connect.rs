//! Connection handshake with remote endpoints.
use std::time::{Duration, Instant};

use omx_api::addr::{BoardAddr, EndpointAddr};
use omx_api::cmd::{Command, Connect, ConnectReply, ConnectStatus, PEER_INDEX_UNKNOWN};
use omx_api::event::RecvConnect;
use omx_api::{Error, Result};

use crate::endpoint::EndpointInner;
use crate::request::{QueueKind, RequestKey, RequestState, RequestType, Specific};

impl EndpointInner {
    pub(crate) fn iconnect(
        &mut self,
        board_addr: BoardAddr,
        endpoint_index: u8,
        key: u32,
        context: u64,
    ) -> Result<RequestKey> {
        self.progress();

        let rkey = self.requests.alloc(RequestType::Connect, context)?;
        // the session is learnt from the reply
        let pidx = self.partners.get_or_insert(
            EndpointAddr::new(board_addr, endpoint_index, 0),
            PEER_INDEX_UNKNOWN,
        );
        let partner = self.partners.get_mut(pidx);
        partner.connect_seqnum = partner.connect_seqnum.wrapping_add(1);
        let connect_seqnum = partner.connect_seqnum;
        let cmd = Command::Connect(Connect {
            dest_board: board_addr,
            dest_endpoint: endpoint_index,
            dest_peer_index: partner.peer_index,
            app_key: key,
            connect_seqnum,
            lib_cookie: rkey as u32,
            recv_seqnum_start: partner.next_match_recv_seq,
        });
        if let Err(e) = self.driver.submit(self.handle, &cmd) {
            tracing::debug!(
                "connect to {} endpoint {} failed: {}",
                board_addr,
                endpoint_index,
                e
            );
            self.requests.free(rkey);
            return Err(e);
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.connect_timeout_ms);
        let req = &mut self.requests[rkey];
        req.state.insert(RequestState::NEED_REPLY);
        req.partner = Some(pidx);
        req.specific = Specific::Connect {
            connect_seqnum,
            deadline,
        };
        self.enqueue(QueueKind::Connect, rkey);
        self.update_progress_deadline();

        self.progress();
        Ok(rkey)
    }

    /// A remote endpoint wants to talk to us.
    pub(crate) fn recv_connect_request(&mut self, ev: &RecvConnect) {
        let (status, recv_seqnum_start) = if ev.app_key == self.key {
            let pidx = self.partners.get_or_insert(ev.src, ev.peer_index);
            let partner = self.partners.get_mut(pidx);
            partner.peer_index = ev.peer_index;
            partner.update_session(ev.src, ev.recv_seqnum_start);
            (ConnectStatus::Success, partner.next_match_recv_seq)
        } else {
            tracing::info!(
                "rejecting connect from {} with key {:#x}",
                ev.src,
                ev.app_key
            );
            (ConnectStatus::BadKey, 0)
        };

        let cmd = Command::ConnectReply(ConnectReply {
            dest_board: ev.src.board_addr,
            dest_endpoint: ev.src.endpoint_index,
            dest_peer_index: ev.peer_index,
            connect_seqnum: ev.connect_seqnum,
            lib_cookie: ev.lib_cookie,
            recv_seqnum_start,
            status,
        });
        if let Err(e) = self.driver.submit(self.handle, &cmd) {
            tracing::warn!("connect reply to {} failed: {}", ev.src, e);
        }
    }

    /// The answer to one of our connects.
    pub(crate) fn recv_connect_reply(&mut self, ev: &RecvConnect) {
        let key = ev.lib_cookie as usize;
        let ours = match self.requests.get(key) {
            Some(req) => {
                req.ty == RequestType::Connect
                    && req.state.contains(RequestState::NEED_REPLY)
                    && matches!(req.specific,
                        Specific::Connect { connect_seqnum, .. } if connect_seqnum == ev.connect_seqnum)
                    && req
                        .partner
                        .map_or(false, |p| self.partners.get(p).addr.key() == ev.src.key())
            }
            None => false,
        };
        if !ours {
            tracing::debug!(
                "stale connect reply from {} (cookie {}, seqnum {})",
                ev.src,
                ev.lib_cookie,
                ev.connect_seqnum
            );
            return;
        }

        if self.requests[key].state.contains(RequestState::ZOMBIE) {
            self.zombies.retain(|&k| k != key);
            self.requests.free(key);
            self.update_progress_deadline();
            return;
        }

        self.dequeue(key);
        let pidx = match self.requests[key].partner {
            Some(pidx) => pidx,
            None => panic!("connect request without a partner"),
        };
        match ev.status {
            ConnectStatus::Success => {
                let partner = self.partners.get_mut(pidx);
                partner.peer_index = ev.peer_index;
                partner.update_session(ev.src, ev.recv_seqnum_start);
                let addr = partner.addr;
                tracing::debug!("connected to {}", addr);
                self.requests[key].status.addr = Some(addr);
            }
            ConnectStatus::BadKey => {
                self.requests[key].complete_with(Err(Error::RemoteEndpointBadConnectionKey));
            }
        }
        self.mark_done(key);
        self.update_progress_deadline();
    }

    /// Fails connects and frees zombies whose deadline passed.
    pub(crate) fn expire_connects(&mut self, now: Instant) {
        let expired = |inner: &Self, k: RequestKey| {
            matches!(inner.requests[k].specific, Specific::Connect { deadline, .. } if deadline <= now)
        };

        let this = &*self;
        let timed_out: Vec<_> = this
            .reqq
            .queue(QueueKind::Connect)
            .iter()
            .copied()
            .filter(|&k| expired(this, k))
            .collect();
        let dead: Vec<_> = this
            .zombies
            .iter()
            .copied()
            .filter(|&k| expired(this, k))
            .collect();

        for key in timed_out {
            tracing::debug!("connect request {} timed out", key);
            self.dequeue(key);
            self.requests[key].complete_with(Err(Error::Timeout));
            self.mark_done(key);
        }

        for key in dead {
            self.zombies.retain(|&k| k != key);
            self.requests.free(key);
        }

        self.update_progress_deadline();
    }

    /// Arms the wakeup for the earliest pending connect deadline.
    pub(crate) fn update_progress_deadline(&mut self) {
        let deadline = self
            .reqq
            .queue(QueueKind::Connect)
            .iter()
            .chain(self.zombies.iter())
            .filter_map(|&k| match self.requests[k].specific {
                Specific::Connect { deadline, .. } => Some(deadline),
                _ => None,
            })
            .min();
        if deadline != self.progress_deadline {
            self.progress_deadline = deadline;
            self.queues.set_progress_deadline(deadline);
        }
    }
}
