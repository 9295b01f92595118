pub mod activity;
pub mod attach;
pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod ports;
pub mod preview;
pub mod process;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod screen;
pub mod session;
pub mod socket;
