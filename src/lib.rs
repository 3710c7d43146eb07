//! A SOCKS proxy split in two halves joined by a peer transport.
//!
//! The [`frontend`] accepts SOCKS4, SOCKS4a and SOCKS5 clients. For each
//! client it opens a virtual channel to the [`backend`], forwards the client's
//! request as JSON, relays the backend's reply to the client and from then on
//! forwards bytes both ways. The backend connects to the requested
//! destination, subject to a local network policy, a per-user session limit
//! and an optional global bandwidth limit.
//!
//! ```text
//! SOCKS client --tcp-- Frontend ==virtual channels== Backend --tcp-- destination
//! ```
//!
//! # Feature
//! ## Authentication
//!
//! Only `X'00'` (`NO AUTHENTICATION REQUIRED`) is offered to clients.
//!
//! ## Command
//!
//! Only `CONNECT` is proxied. `BIND` is rejected by the frontend's parser and
//! `UDP ASSOCIATE` by the backend.
//!
//! ## Transport
//!
//! The halves talk through any implementation of [`transport::Transport`].
//! [`pool::Pool`] multiplexes short lived virtual channels over the
//! transport's data channels, reusing closed ones. [`loopback`] provides an
//! in-process transport.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peersocks::*;
//!
//! # async fn run() -> peersocks::error::Result<()> {
//! let (a, b) = loopback::pair();
//! let backend = Backend::new(BackendConfig::default(), None, Arc::new(SessionLimiter::default()));
//! backend.start(b).await?;
//! let frontend = Frontend::new(FrontendConfig::default());
//! let endpoint = frontend.start(a).await?;
//! println!("SOCKS proxy listening on {}", endpoint);
//! frontend.stop();
//! frontend.once_stopped().await;
//! backend.once_stopped().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod frontend;
pub mod handler_queue;
pub mod loopback;
pub mod model;
pub mod pool;
mod raw_message;
pub mod relay;
pub mod session;
pub mod tcp;
mod test;
pub mod transport;

pub use backend::{Backend, SessionLimiter};
pub use config::*;
pub use frontend::Frontend;
pub use model::model::*;
