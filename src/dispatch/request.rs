use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Upstream issuer a request entered the dispatcher from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Remap,
    Migration,
}

impl Source {
    /// Service order within one scheduling step: migration traffic first, so that page moves
    /// are never starved by steady-state translated traffic.
    pub const PRIORITY: [Source; 2] = [Source::Migration, Source::Remap];

    pub fn index(self) -> usize {
        match self {
            Source::Remap => 0,
            Source::Migration => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Remap => "remap",
            Source::Migration => "migration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Slow,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Slow => "slow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRequest {
    pub id: RequestId,
    pub addr: u64,
    pub kind: AccessKind,
    pub bytes: u32,
    pub source: Source,
    /// Per-source issue order.
    pub seq: u64,
}

impl MemRequest {
    pub fn new(id: u64, source: Source, seq: u64, addr: u64, kind: AccessKind, bytes: u32) -> Self {
        Self {
            id: RequestId(id),
            addr,
            kind,
            bytes,
            source,
            seq,
        }
    }

    pub fn read(id: u64, source: Source, seq: u64, addr: u64) -> Self {
        Self::new(id, source, seq, addr, AccessKind::Read, 64)
    }

    pub fn write(id: u64, source: Source, seq: u64, addr: u64) -> Self {
        Self::new(id, source, seq, addr, AccessKind::Write, 64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    AddressOutOfRange,
    RetryExhausted,
}

impl ResponseStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemResponse {
    pub id: RequestId,
    pub addr: u64,
    pub kind: AccessKind,
    pub bytes: u32,
    pub source: Source,
    pub seq: u64,
    pub status: ResponseStatus,
    /// Tier that served the access; `None` for error responses.
    pub served_by: Option<Tier>,
}

impl MemResponse {
    pub fn ok(request: &MemRequest, tier: Tier) -> Self {
        Self::with_status(request, ResponseStatus::Ok, Some(tier))
    }

    /// Successful completion from a memory that may not be one of the two tiers.
    pub fn completed(request: &MemRequest, served_by: Option<Tier>) -> Self {
        Self::with_status(request, ResponseStatus::Ok, served_by)
    }

    pub fn error(request: &MemRequest, status: ResponseStatus) -> Self {
        Self::with_status(request, status, None)
    }

    fn with_status(request: &MemRequest, status: ResponseStatus, served_by: Option<Tier>) -> Self {
        Self {
            id: request.id,
            addr: request.addr,
            kind: request.kind,
            bytes: request.bytes,
            source: request.source,
            seq: request.seq,
            status,
            served_by,
        }
    }
}

/// What the accounting stage hands back once it has observed a request: either a bare
/// acknowledgement or the request itself, forwarded on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountingReply {
    Ack(RequestId),
    Forward(MemRequest),
}

impl AccountingReply {
    pub fn id(&self) -> RequestId {
        match self {
            AccountingReply::Ack(id) => *id,
            AccountingReply::Forward(request) => request.id,
        }
    }
}
