pub mod base;
pub mod dispatch;
pub mod sim;
pub mod timeq;
pub mod traffic;
pub mod ui;
