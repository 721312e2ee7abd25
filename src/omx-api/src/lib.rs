//! Types shared by the messaging engine and the lower layer it drives.
pub mod addr;
pub mod cmd;
pub mod error;
pub mod event;
pub mod handle;
pub mod status;

pub use addr::EndpointAddr;
pub use error::Error;
pub use handle::{AsHandle, Handle};
pub use status::Status;

pub type Result<T> = std::result::Result<T, Error>;

/// Largest payload carried inline in the command itself.
pub const TINY_MAX: usize = 32;
/// Largest payload sent in a single fragment straight from the application buffer.
pub const SMALL_MAX: usize = 128;
pub const MEDIUM_FRAG_LENGTH_SHIFT: u32 = 12;
pub const MEDIUM_FRAG_LENGTH_MAX: usize = 1 << MEDIUM_FRAG_LENGTH_SHIFT;
pub const MEDIUM_FRAGS_MAX: usize = 8;
/// Messages beyond this length go through the rendezvous protocol.
pub const MEDIUM_MAX: usize = MEDIUM_FRAG_LENGTH_MAX * MEDIUM_FRAGS_MAX;

/// Largest number of buffers a single request may describe.
pub const SEGMENTS_MAX: usize = 256;

/// Size of one slot of the expected and unexpected event rings.
pub const EVENTQ_ENTRY_SIZE: usize = 128;
pub const RECVQ_ENTRY_SIZE: usize = MEDIUM_FRAG_LENGTH_MAX;
pub const SENDQ_ENTRY_SIZE: usize = MEDIUM_FRAG_LENGTH_MAX;

/// Number of registration ids available to one endpoint.
pub const REGION_MAX: usize = 255;

pub const SEQNUM_BITS: u32 = 14;
pub const SEQNUM_MASK: u16 = (1 << SEQNUM_BITS) - 1;

/// The size class a message of a given length is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Tiny,
    Small,
    Medium,
    Large,
}

impl SizeClass {
    #[inline]
    pub fn of(length: usize) -> Self {
        if length <= TINY_MAX {
            SizeClass::Tiny
        } else if length <= SMALL_MAX {
            SizeClass::Small
        } else if length <= MEDIUM_MAX {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }
}

/// Number of medium fragments needed to carry `length` bytes.
#[inline]
pub fn medium_frags_nr(length: usize) -> usize {
    if length == 0 {
        1
    } else {
        (length + MEDIUM_FRAG_LENGTH_MAX - 1) >> MEDIUM_FRAG_LENGTH_SHIFT
    }
}

mod sa {
    use super::*;
    use static_assertions::const_assert;

    const_assert!(TINY_MAX < SMALL_MAX);
    const_assert!(SMALL_MAX < MEDIUM_MAX);
    const_assert!(SMALL_MAX <= RECVQ_ENTRY_SIZE);
    const_assert!(MEDIUM_FRAG_LENGTH_MAX <= RECVQ_ENTRY_SIZE);
    const_assert!(MEDIUM_FRAGS_MAX <= 8);
    const_assert!(REGION_MAX <= u8::MAX as usize);
}
