pub mod config;
pub mod event;
pub mod log;
pub mod memory;
pub mod perf_log;
pub mod top;
