pub mod config;
pub mod issuer;
pub mod patterns;

pub use config::{PatternKind, TrafficConfig};
pub use issuer::{IssuerStats, TrafficSource};
pub use patterns::AddressPattern;
