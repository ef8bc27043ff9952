use thiserror::Error;

use crate::base::port::PortName;
use crate::dispatch::request::RequestId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("address {addr:#x} matches no configured range")]
    AddressOutOfRange { addr: u64 },

    #[error("port {0} has no peer")]
    PortNotConnected(PortName),

    #[error("port {0} is already connected")]
    PortAlreadyConnected(PortName),

    #[error("protocol violation{}: {}", fmt_id(.id), .detail)]
    ProtocolViolation {
        id: Option<RequestId>,
        detail: String,
    },

    #[error("request {id} dropped: {source_name} queue exceeded depth {depth}")]
    RetryExhausted {
        id: RequestId,
        source_name: &'static str,
        depth: usize,
    },
}

impl DispatchError {
    pub(crate) fn violation(id: impl Into<Option<RequestId>>, detail: impl Into<String>) -> Self {
        DispatchError::ProtocolViolation {
            id: id.into(),
            detail: detail.into(),
        }
    }

    /// Errors that end the run rather than a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::PortNotConnected(_)
                | DispatchError::PortAlreadyConnected(_)
                | DispatchError::ProtocolViolation { .. }
        )
    }
}

fn fmt_id(id: &Option<RequestId>) -> String {
    id.map(|id| format!(" on request {id}")).unwrap_or_default()
}

/// Problems with the construction-time address map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("address map is empty")]
    NoRanges,

    #[error("range at {base:#x} has zero size")]
    EmptyRange { base: u64 },

    #[error("range at {base:#x} with size {size:#x} overflows the address space")]
    RangeOverflow { base: u64, size: u64 },

    #[error("ranges [{a_base:#x}, {a_end:#x}) and [{b_base:#x}, {b_end:#x}) overlap")]
    Overlap {
        a_base: u64,
        a_end: u64,
        b_base: u64,
        b_end: u64,
    },
}
