//! The command channel to the lower layer that moves bytes between endpoints.
use std::sync::Arc;

use ipc::{EventQueues, SendQueue};
use omx_api::addr::BoardAddr;
use omx_api::cmd::{Command, RegionDescriptor};
use omx_api::event::{WaitParam, WaitStatus};
use omx_api::{Handle, Result};

use crate::region::RegionMemory;

/// What the lower layer tells an endpoint about itself when opening it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub board_addr: BoardAddr,
    pub session_id: u32,
}

/// Everything the engine needs from the layer below it.
///
/// `submit` never blocks. Tiny, small and rendezvous announcements are done when it
/// returns; medium fragments and pulls complete later through the expected ring.
/// Arrivals are reported through the unexpected ring of the destination.
pub trait Driver: Send + Sync {
    fn open_endpoint(
        &self,
        board_index: u8,
        endpoint_index: u8,
        queues: Arc<EventQueues>,
        sendq: Arc<SendQueue>,
    ) -> Result<EndpointInfo>;

    fn close_endpoint(&self, ep: Handle) -> Result<()>;

    fn submit(&self, ep: Handle, cmd: &Command<'_>) -> Result<()>;

    fn register_region(
        &self,
        ep: Handle,
        region: RegionDescriptor,
        memory: RegionMemory,
    ) -> Result<()>;

    fn deregister_region(&self, ep: Handle, region: RegionDescriptor) -> Result<()>;

    /// Blocks until an event arrives past the positions in `param`, a deadline
    /// passes or the endpoint is woken up.
    fn wait_event(&self, ep: Handle, param: &WaitParam) -> Result<WaitStatus>;

    /// Interrupts every thread blocked in `wait_event` on this endpoint.
    fn wakeup(&self, ep: Handle) -> Result<()>;
}
