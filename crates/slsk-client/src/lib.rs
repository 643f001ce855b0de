//! Client for the Soulseek peer-to-peer file-sharing network.
//!
//! The network pairs a central server (login, user lookups, search
//! fan-out, connection rendezvous) with direct peer connections that
//! carry search replies and file transfers. [`SlskClient`] owns one
//! server connection and opens peer connections on demand:
//!
//! ```no_run
//! use slsk_client::{ClientConfig, SlskClient};
//!
//! # async fn run() -> Result<(), slsk_client::SlskError> {
//! let client = SlskClient::connect(ClientConfig::default()).await?;
//! client.login("username", "password").await?;
//!
//! let replies = client.search("eiffel 65").await?;
//! let reply = &replies[0];
//! let mut download = client
//!     .download(&reply.username, &reply.files[0].filename)
//!     .await?;
//! while let Some(chunk) = download.data.recv().await {
//!     // write the chunk somewhere
//!     let _ = chunk;
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod download;
mod error;
mod listener;
mod peer;
mod resolver;
mod search;
mod server;
mod token;

pub use client::{ClientConfig, SlskClient};
pub use download::{Download, DownloadEvent, DownloadState};
pub use error::SlskError;
pub use peer::{PeerConnection, PeerEnvelope};
pub use search::SearchReply;
pub use token::{RandomTokens, TokenSource};
