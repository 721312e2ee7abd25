//! User-space messaging engine for Myrinet Express over Ethernet.
//!
//! An [`Endpoint`] matches posted receives against incoming messages, splits sends
//! into the tiny, small, medium and rendezvous protocols and keeps per-partner
//! ordering. Moving bytes is left to a [`Driver`].
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod logging;
pub mod partner;
pub mod region;
pub mod request;
pub mod segments;

mod completion;
mod connect;
mod recv;
mod send;

#[cfg(test)]
mod tests;

pub use omx_api::addr::{BoardAddr, EndpointAddr};
pub use omx_api::{Error, Handle, Result, Status};

pub use config::{Config, EndpointConfig, TracingConfig};
pub use driver::{Driver, EndpointInfo};
pub use endpoint::{Endpoint, PartnerInfo};
pub use logging::init_log;
pub use region::RegionMemory;
pub use request::{Completion, QueueKind, RequestHandle, RequestInfo, RequestState, RequestType};
pub use segments::Segments;
