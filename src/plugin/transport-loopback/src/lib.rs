//! In-process lower layer: a set of boards whose endpoints exchange packets by
//! writing straight into each other's event rings.
use thiserror::Error;

use omx_api::addr::BoardAddr;

pub mod config;
pub mod ops;
pub(crate) mod state;

pub use config::LoopbackConfig;
pub use ops::LoopbackFabric;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Board {0} does not exist")]
    NoSuchBoard(u8),
    #[error("Endpoint index {0} is out of range")]
    BadEndpointIndex(u8),
    #[error("Endpoint {0} is already open")]
    EndpointBusy(u8),
    #[error("Endpoint is not open")]
    NotOpen,
    #[error("No endpoint {1} open on board {0}")]
    Closed(BoardAddr, u8),
    #[error("Session {0:#x} is not the current one")]
    BadSession(u32),
    #[error("Region {0} is not registered")]
    BadRegion(u8),
    #[error("Region {0} is already registered")]
    RegionBusy(u8),
    #[error("Event queue: {0}")]
    Queue(#[from] omx_api::Error),
}

impl From<Error> for omx_api::Error {
    fn from(other: Error) -> Self {
        match other {
            Error::NoSuchBoard(_) => omx_api::Error::BoardNotFound,
            Error::BadEndpointIndex(_) => omx_api::Error::BadEndpoint,
            Error::EndpointBusy(_) => omx_api::Error::Busy,
            Error::NotOpen => omx_api::Error::BadEndpoint,
            Error::Closed(..) => omx_api::Error::RemoteEndpointClosed,
            Error::BadSession(_) => omx_api::Error::RemoteEndpointBadSession,
            Error::BadRegion(_) => omx_api::Error::RemoteRdmaWindowBadId,
            Error::RegionBusy(_) => omx_api::Error::Busy,
            Error::Queue(e) => e,
        }
    }
}
