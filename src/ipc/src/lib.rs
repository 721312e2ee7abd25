//! Structures an endpoint shares with the lower layer that feeds it.
//!
//! The lower layer is the only writer of the event rings and of the receive data
//! queue, the engine is the only reader. They cooperate through the slot tags:
//! a slot is writable when its tag is `EventType::None` and readable otherwise.
pub mod counter;
pub mod eventq;
pub mod pages;
mod wait;

pub use counter::{Counter, Counters};
pub use eventq::{Cursors, DescStatus, EventQueues};
pub use pages::Pages;

/// Staging pages the engine fills with medium fragments for the lower layer.
pub type SendQueue = Pages;
/// Pages the lower layer fills with small and medium payloads.
pub type RecvQueue = Pages;

#[inline]
pub(crate) fn wrap_index(index: u64, size: usize) -> usize {
    // size is always a power of 2
    debug_assert!(size.is_power_of_two());
    (index & (size as u64 - 1)) as usize
}
