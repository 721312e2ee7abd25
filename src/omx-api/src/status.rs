use serde::{Deserialize, Serialize};

use crate::addr::EndpointAddr;
use crate::Error;

/// Completion record of a request, handed back to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Result<(), Error>,
    /// Destination of a send, source of a receive, target of a connect.
    pub addr: Option<EndpointAddr>,
    pub match_info: u64,
    pub msg_length: u32,
    pub xfer_length: u32,
    pub context: u64,
}

impl Status {
    pub fn new(context: u64) -> Self {
        Status {
            code: Ok(()),
            addr: None,
            match_info: 0,
            msg_length: 0,
            xfer_length: 0,
            context,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.code.is_ok()
    }
}
