pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod pending;
pub mod relay;
pub mod request;
pub mod stats;

pub use decoder::{AddressDecoder, AddressRange};
pub use dispatcher::{AccountingPolicy, Dispatcher, DispatcherConfig};
pub use error::{ConfigError, DispatchError};
pub use pending::{PendingEntry, PendingRequestTracker, Stage, Token};
pub use relay::{FlatRelay, RelayStats};
pub use request::{
    AccessKind, AccountingReply, MemRequest, MemResponse, RequestId, ResponseStatus, Source, Tier,
};
pub use stats::{DispatcherStats, SourceStats};

#[cfg(test)]
mod unit_tests;
