//! Retrieving, forgetting and cancelling requests.
use omx_api::{Error, Result, Status};

use crate::endpoint::EndpointInner;
use crate::request::{
    Completion, QueueKind, RequestHandle, RequestKey, RequestState, RequestType,
};

impl EndpointInner {
    pub(crate) fn test(&mut self, handle: RequestHandle) -> Result<Option<Completion>> {
        self.progress();
        self.test_done(handle)
    }

    pub(crate) fn test_done(&mut self, handle: RequestHandle) -> Result<Option<Completion>> {
        let key = self.requests.resolve(handle)?;
        if !self.requests[key].state.contains(RequestState::DONE) {
            return Ok(None);
        }
        Ok(Some(self.retrieve(key)))
    }

    pub(crate) fn test_any(
        &mut self,
        match_info: u64,
        match_mask: u64,
    ) -> Result<Option<Completion>> {
        if match_info & !match_mask != 0 {
            return Err(Error::BadMatchMask);
        }
        self.progress();
        self.test_any_done(match_info, match_mask)
    }

    pub(crate) fn test_any_done(
        &mut self,
        match_info: u64,
        match_mask: u64,
    ) -> Result<Option<Completion>> {
        if match_info & !match_mask != 0 {
            return Err(Error::BadMatchMask);
        }
        let found = self
            .reqq
            .queue(QueueKind::Done)
            .iter()
            .copied()
            .find(|&k| self.requests[k].status.match_info & match_mask == match_info);
        Ok(found.map(|key| self.retrieve(key)))
    }

    pub(crate) fn ipeek(&mut self) -> Option<RequestHandle> {
        self.progress();
        self.peek_done()
    }

    pub(crate) fn peek_done(&self) -> Option<RequestHandle> {
        self.reqq
            .queue(QueueKind::Done)
            .front()
            .map(|&key| self.requests.handle(key))
    }

    pub(crate) fn iprobe(&mut self, match_info: u64, match_mask: u64) -> Result<Option<Status>> {
        if match_info & !match_mask != 0 {
            return Err(Error::BadMatchMask);
        }
        self.progress();
        Ok(self.probe_unexpected(match_info, match_mask))
    }

    /// Hands a done request back to the application and frees it.
    fn retrieve(&mut self, key: RequestKey) -> Completion {
        self.dequeue(key);
        let req = self.requests.free(key);
        Completion {
            status: req.status,
            segments: req.segments,
        }
    }

    pub(crate) fn forget(&mut self, handle: RequestHandle) -> Result<()> {
        let key = self.requests.resolve(handle)?;
        let req = &mut self.requests[key];
        if req.state.contains(RequestState::DONE) {
            self.retrieve(key);
        } else {
            req.forgotten = true;
        }
        Ok(())
    }

    pub(crate) fn cancel(&mut self, handle: RequestHandle) -> Result<bool> {
        self.progress();
        let key = self.requests.resolve(handle)?;
        let req = &mut self.requests[key];
        match req.ty {
            RequestType::Recv => {
                if !req.state.contains(RequestState::NEED_MATCHING) {
                    return Ok(false);
                }
                self.dequeue(key);
                self.requests.free(key);
                Ok(true)
            }
            RequestType::RecvLarge => Ok(false),
            RequestType::Connect => {
                if !req.state.contains(RequestState::NEED_REPLY) {
                    return Ok(false);
                }
                // the reply may still come, the slot stays taken until then
                req.state.insert(RequestState::ZOMBIE);
                self.dequeue(key);
                self.zombies.push(key);
                Ok(true)
            }
            ty => {
                tracing::debug!("cannot cancel a {} request", ty);
                Err(Error::BadRequest)
            }
        }
    }
}
