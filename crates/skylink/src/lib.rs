//!
//! # Skylink
//!
//! A small remote-tree protocol: a hierarchical namespace of addressable entries, served by mountable
//! devices and reachable over any transport that can carry JSON frames.
//!
//! The pieces, from the leaves up:
//! - [`PathFragment`] parses, compares and pattern-matches slash-separated, percent-encoded paths;
//! - [`Literal`] is the closed set of wire values, with [`LiteralCodec`] to inflate and deflate them;
//! - [`Entry`] and [`Device`] describe what a node can do (`get`, `put`, `enumerate`, `invoke`, `subscribe`);
//! - [`Environment`] is the mount table resolving paths to devices;
//! - [`EnumerationWriter`] produces depth-bounded, flattened listings of a subtree;
//! - [`Channel`] is the ordered, terminal-once stream used by subscriptions;
//! - [`Server`] and [`Client`] frame all of the above over a [`Link`], and [`Reversal`] lets one link
//!   carry both at the same time.
//!
//! ## Basic example
//!
//! ```
//! use std::sync::Arc;
//!
//! use sd_skylink::{devices::TempDevice, transport, Client, Config, Environment, Literal, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sd_skylink::Error> {
//!     let env = Arc::new(Environment::new());
//!     env.bind("/mem", Arc::new(TempDevice::new())).await?;
//!
//!     let config = Config::default();
//!     let (server_link, client_link) = transport::memory_pair();
//!     Server::new(Arc::clone(&env), &config).spawn(server_link);
//!     let client = Client::spawn(client_link, &config);
//!
//!     client.store("/mem/greeting", Some(Literal::string("", "hi"))).await?;
//!     assert_eq!(
//!         client.get("/mem/greeting").await?,
//!         Some(Literal::string("", "hi"))
//!     );
//!
//!     Ok(())
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod channel;
mod client;
mod config;
pub mod devices;
mod entry;
mod enumeration;
mod environment;
mod error;
mod literal;
mod notification;
mod observer;
mod ops;
mod path;
mod reversal;
mod server;
pub mod transport;
mod wire;

pub use channel::{Channel, ChannelFactory, ChannelId, ChannelSender, Packet, Status, Termination};
pub use client::{Client, ClientResponse, OutputDecoder};
pub use config::{ClientConfig, Config, Correlation, ReversalConfig, ServerConfig};
pub use entry::{
	Capability, Device, Enumerate, Entry, Get, Invocation, Invoke, Put, Subscribe,
};
pub use enumeration::EnumerationWriter;
pub use environment::{Environment, MountMatch};
pub use error::Error;
pub use literal::{Deflater, Inflater, Literal, LiteralCodec, LiteralKind};
pub use notification::{Notification, NotificationKind};
pub use observer::{ChannelEvent, NoopObserver, Observer, ShutdownHandler, TracingObserver};
pub use ops::{CoreOps, Operation, Output, Request};
pub use path::{PathFragment, PathMatch, PathParam};
pub use reversal::Reversal;
pub use server::{AfterSend, EncodeContext, Encoded, OpExtension, OutputEncoder, Server};
pub use transport::Link;
pub use wire::{normalize_keys, ChannelFrame, RequestFrame, ResponseFrame};
