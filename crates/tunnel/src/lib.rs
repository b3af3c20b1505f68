//! # Gantz tunnel
//!
//! Makes a locally running Gantz server reachable on a public URL through an
//! outbound websocket to a relay. No inbound ports are opened.
//!
//! ```rust,no_run
//! use gantz_tunnel::{TunnelClient, TunnelConfig, TunnelResult};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> TunnelResult<()> {
//! let relay = url::Url::parse("wss://relay.gantz.run/connect").unwrap();
//! let config = TunnelConfig::new(relay, 8787).with_relay_key("rk_...");
//!
//! let tunnel = TunnelClient::new(config)?
//!     .connect(CancellationToken::new())
//!     .await?;
//! println!("Public URL: {}", tunnel.public_url());
//! # Ok(())
//! # }
//! ```
//!
//! The relay forwards public requests as `request` frames; the client
//! replays each one against `http://127.0.0.1:<port>` and streams the
//! response back. After the first registration, lost connections are
//! re-established in the background with jittered exponential backoff.

pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod frames;

pub use client::{TunnelClient, TunnelHandle, TunnelState};
pub use config::{RetryConfig, TunnelConfig};
pub use error::{TunnelError, TunnelResult};
