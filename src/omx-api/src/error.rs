use std::io;

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the engine can report to an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum Error {
    #[error("Bad error")]
    BadError,
    #[error("Already initialized")]
    AlreadyInitialized,
    #[error("Not initialized")]
    NotInitialized,
    #[error("No device file")]
    NoDeviceFile,
    #[error("Unusable device file (driver loaded?)")]
    NoDriver,
    #[error("Access denied")]
    AccessDenied,
    #[error("Board Not Found")]
    BoardNotFound,
    #[error("Bad Endpoint")]
    BadEndpoint,
    #[error("Multiple Segments Count Invalid")]
    SegmentsBadCount,
    #[error("This Function cannot be applied to this Request")]
    BadRequest,
    #[error("Bad match mask.")]
    BadMatchMask,
    #[error("No resources available")]
    NoResources,
    #[error("Resource Busy")]
    Busy,
    #[error("Bad Info Key")]
    BadInfoKey,
    #[error("Bad Info Value Address")]
    BadInfoAddress,
    #[error("Bad Endpoint Parameter List")]
    EndpointParamsBadList,
    #[error("Bad Endpoint Parameter Key")]
    EndpointParamBadKey,
    #[error("Bad Endpoint Parameter Value")]
    EndpointParamBadValue,
    #[error("Peer Not Found in the Table")]
    PeerNotFound,
    #[error("Command Timeout")]
    Timeout,
    #[error("Remote Endpoint Id is Wrong")]
    RemoteEndpointBadId,
    #[error("Remote Endpoint is Closed")]
    RemoteEndpointClosed,
    #[error("Connection Key to Remote Endpoint is Invalid")]
    RemoteEndpointBadConnectionKey,
    #[error("Bad Info Value Length")]
    BadInfoLength,
    #[error("Nic ID not Found in Peer Table")]
    NicIdNotFound,
    #[error("Kernel ABI too old, did you rebuild/reload the new driver?")]
    BadKernelAbi,
    #[error("Library ABI too old, did you relink your program with the new library?")]
    BadLibAbi,
    #[error("Matching info does not respect context id mask")]
    BadMatchingForContextIdMask,
    #[error("Remote Window Id is Invalid")]
    RemoteRdmaWindowBadId,
    #[error("Remote Endpoint Unreachable")]
    RemoteEndpointUnreachable,
    #[error("Wrong Remote Endpoint Session")]
    RemoteEndpointBadSession,
    #[error("Message Aborted")]
    MessageAborted,
    #[error("Message Truncated")]
    MessageTruncated,
    #[error("Operation not supported in the handler")]
    NotSupportedInHandler,
    #[error("No resources available in the system")]
    NoSystemResources,
    #[error("Not implemented")]
    NotImplemented,
    #[error("Internal error (misc einval)")]
    InternalMiscEinval,
    #[error("Internal error (misc enodev)")]
    InternalMiscEnodev,
    #[error("Internal error (unexpected errno)")]
    InternalUnexpectedErrno,
}

impl Error {
    /// Maps a lower layer errno onto the closed return code set.
    pub fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::EINVAL => Error::InternalMiscEinval,
            Errno::EACCES | Errno::EPERM => Error::AccessDenied,
            Errno::EMFILE | Errno::ENFILE | Errno::ENOMEM => Error::NoSystemResources,
            Errno::ENODEV => Error::InternalMiscEnodev,
            Errno::EBADF => Error::BadEndpoint,
            Errno::ENOENT => Error::NoDeviceFile,
            Errno::EBUSY => Error::Busy,
            _ => Error::InternalUnexpectedErrno,
        }
    }

    /// Whether the failure is a resource shortage the caller may retry after progress.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Error::NoResources | Error::Busy | Error::NoSystemResources
        )
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::from_errno(errno)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(raw) => Error::from_errno(Errno::from_i32(raw)),
            None => Error::InternalUnexpectedErrno,
        }
    }
}
