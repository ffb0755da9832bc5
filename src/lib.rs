//! Shared-folder file service over a framed TCP protocol.
//!
//! The server publishes a directory; clients list it, upload files into it and
//! download files from it. Uploads become visible only once complete.

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod server;
pub mod session;
pub mod transfer;
pub mod tui;

pub use error::{Error, Result};
pub use reconnect::ReconnectController;
pub use server::Server;
pub use session::Session;
