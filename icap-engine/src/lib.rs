//! # icap-engine
//!
//! ICAP ([RFC 3507]) content-adaptation server engine.
//!
//! - [`parser`]: line, block and chunk primitives, ICAP request parsing with
//!   `Encapsulated` offsets, preview (`0; ieof`) and full-body reads;
//! - [`exchange`]: the per-exchange working set, reset between exchanges;
//! - [`session`]: the per-connection state machine;
//! - [`service`]: the [`AdaptationService`] callback interface and its
//!   [`Exchange`] handle (`early_response`, `full_response`, body helpers);
//! - [`pool`]: a bounded worker pool with FIFO overflow queue;
//! - [`server`]: listeners (keep-alive or pooled) and the multi-listener
//!   [`IcapServer`].
//!
//! ```rust,no_run
//! use icap_engine::config::ServerConfig;
//! use icap_engine::error::IcapResult;
//! use icap_engine::IcapServer;
//!
//! #[tokio::main]
//! async fn main() -> IcapResult<()> {
//!     let config = ServerConfig::from_json(
//!         r#"{"listeners":[{"name":"echo","handler":"echo","port":1344}]}"#,
//!     )?;
//!     let mut server = IcapServer::start(&config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! [RFC 3507]: https://www.rfc-editor.org/rfc/rfc3507

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod net;
pub mod parser;
pub mod pool;
pub mod response;
pub mod server;
pub mod service;
pub mod services;
pub mod session;

pub use config::{ListenerConfig, ServerConfig};
pub use error::{Error, IcapResult};
pub use exchange::{ExchangeState, RequestType};
pub use response::StatusCode;
pub use server::{IcapServer, Listener, ListenerHandle};
pub use service::{AdaptationService, Exchange, IcapMethod, VectoringPoint};

///Lib version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
///Max Header size
pub const MAX_HDR_BYTES: usize = 64 * 1024;
/// Supported ICAP protocol version.
pub const ICAP_VERSION: &str = "ICAP/1.0";
/// IANA port of ICAP.
pub const DEFAULT_PORT: u16 = 1344;
