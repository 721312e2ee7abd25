use serde::{Deserialize, Serialize};

/// Opaque name of an endpoint inside the lower layer.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(pub u64);

impl Handle {
    pub const INVALID: Handle = Handle(u64::MAX);

    /// Packs a (board, endpoint) pair, the way the lower layer names its endpoints.
    #[inline]
    pub fn new(board_index: u8, endpoint_index: u8) -> Self {
        Handle(((board_index as u64) << 8) | endpoint_index as u64)
    }

    #[inline]
    pub fn board_index(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub fn endpoint_index(&self) -> u8 {
        self.0 as u8
    }
}

pub trait AsHandle {
    #[must_use]
    fn as_handle(&self) -> Handle;
}
