//! dualspeed - concurrent TCP + UDP throughput testing
//!
//! A server announces itself on the LAN with broadcast offers and serves
//! fixed-size transfers over both TCP and UDP. A client discovers it, opens
//! many connections of each protocol at once and measures duration,
//! throughput and UDP delivery rate per connection.
//!
//! # Library Usage
//!
//! ```ignore
//! use dualspeed::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig {
//!         file_size: 10_000_000,
//!         tcp_connections: 4,
//!         udp_connections: 4,
//!         ..Default::default()
//!     };
//!
//!     let report = Client::new(config).run(None).await?;
//!     for result in &report.results {
//!         println!("{} #{}: {:.0} bit/s", result.protocol, result.connection, result.bits_per_second);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`protocol`] - Wire messages and result types
//! - [`discover`] - Offer broadcasting and listening
//! - [`tcp`], [`udp`] - Transfer engines
//! - [`client`] - Client-side orchestration
//! - [`serve`] - Server-side loops
//! - [`stats`] - Per-connection measurement and aggregation
//! - [`output`] - Plain, JSON and CSV reports

pub mod client;
pub mod config;
pub mod discover;
pub mod error;
pub mod net;
pub mod output;
pub mod protocol;
pub mod serve;
pub mod stats;
pub mod tcp;
pub mod udp;

pub use client::{Client, ClientConfig};
pub use error::{Result, SpeedError};
pub use protocol::{Outcome, Protocol, RunReport, ServerEndpoint, TransferResult};
pub use serve::{Server, ServerConfig, ServerHandle};
