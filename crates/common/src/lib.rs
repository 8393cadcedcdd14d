//! Common utilities for hermes
//!
//! This crate provides shared functionality between the server and the
//! controller CLI: error handling, logging setup, the TCP line transport and
//! structured cancellation for background threads.

pub mod error;
pub mod logging;
pub mod task;
pub mod test_utils;
pub mod transport;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use task::{CancelToken, ThreadGroup};
pub use transport::{
    Inbox, LineReader, Publisher, Received, ReplyConnection, ReplySocket, Requester, Subscriber,
};
