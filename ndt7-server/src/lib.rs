//! ndt7 server side of the download test's counter-flow channel
//!
//! `receiver` consumes the measurements a client reports while it downloads;
//! `server` is a minimal websocket endpoint that drives receivers end to end.

pub mod config;
pub mod receiver;
pub mod server;

pub use config::ReceiverConfig;
pub use receiver::{StopCause, start};
pub use server::{Server, SessionSummary};

pub use ndt7_proto::Measurement;
