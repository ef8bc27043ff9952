use std::collections::HashMap;

use crate::dispatch::error::DispatchError;
use crate::dispatch::request::{MemRequest, MemResponse, RequestId, Source, Tier};

/// Where an in-flight request is in its trip through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Accepted,
    Decoded,
    SentToAccounting,
    SentToTier,
    ResponseReceived,
    Delivered,
}

impl Stage {
    /// Legal forward transitions.  Error responses jump straight to `ResponseReceived`, and
    /// requests that bypass accounting go from `Decoded` to `SentToTier`.
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Accepted, Decoded)
                | (Accepted, ResponseReceived)
                | (Decoded, SentToAccounting)
                | (Decoded, SentToTier)
                | (SentToAccounting, SentToTier)
                | (SentToAccounting, ResponseReceived)
                | (SentToTier, ResponseReceived)
                | (ResponseReceived, Delivered)
        )
    }
}

/// Handle returned by `register`; the only way to resolve an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(RequestId);

impl Token {
    pub fn id(&self) -> RequestId {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub request: MemRequest,
    pub origin: Source,
    pub tier: Option<Tier>,
    pub stage: Stage,
    /// Set once the accounting stage has handed the request back.
    pub accounted: bool,
    pub response: Option<MemResponse>,
}

impl PendingEntry {
    fn new(request: MemRequest) -> Self {
        Self {
            origin: request.source,
            request,
            tier: None,
            stage: Stage::Accepted,
            accounted: false,
            response: None,
        }
    }
}

/// Table of requests accepted but not yet answered upstream.
#[derive(Debug, Default)]
pub struct PendingRequestTracker {
    entries: HashMap<RequestId, PendingEntry>,
}

impl PendingRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request: MemRequest) -> Result<Token, DispatchError> {
        let id = request.id;
        if self.entries.contains_key(&id) {
            return Err(DispatchError::violation(id, "request id already outstanding"));
        }
        self.entries.insert(id, PendingEntry::new(request));
        Ok(Token(id))
    }

    pub fn get(&self, id: RequestId) -> Result<&PendingEntry, DispatchError> {
        self.entries
            .get(&id)
            .ok_or_else(|| DispatchError::violation(id, "no such outstanding request"))
    }

    pub fn get_mut(&mut self, id: RequestId) -> Result<&mut PendingEntry, DispatchError> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| DispatchError::violation(id, "no such outstanding request"))
    }

    /// Move an entry to `next`, rejecting anything the state machine does not allow.
    pub fn advance(&mut self, id: RequestId, next: Stage) -> Result<&mut PendingEntry, DispatchError> {
        let entry = self.get_mut(id)?;
        if !entry.stage.can_advance_to(next) {
            return Err(DispatchError::violation(
                id,
                format!("illegal transition {:?} -> {:?}", entry.stage, next),
            ));
        }
        entry.stage = next;
        Ok(entry)
    }

    /// Remove a delivered entry and report where it came from.
    pub fn resolve(&mut self, token: Token) -> Result<Source, DispatchError> {
        let mut entry = self
            .entries
            .remove(&token.0)
            .ok_or_else(|| DispatchError::violation(token.0, "response for unknown or already delivered request"))?;
        if !entry.stage.can_advance_to(Stage::Delivered) {
            let stage = entry.stage;
            self.entries.insert(token.0, entry);
            return Err(DispatchError::violation(
                token.0,
                format!("delivered from stage {stage:?}"),
            ));
        }
        entry.stage = Stage::Delivered;
        Ok(entry.origin)
    }

    pub fn token_for(&self, id: RequestId) -> Option<Token> {
        self.entries.contains_key(&id).then_some(Token(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
