//! `ktp`: a reliable, ordered, message-oriented transport over UDP.
//!
//! # Architecture
//!
//! ```text
//!   clients (any thread, any owner)
//!        │  socket / bind / send_to / recv_from / close
//!  ┌─────▼──────────────────────────────────────────────┐
//!  │                     KtpStack                       │
//!  │   Mutex ─┬─ ConnectionTable (slots + readiness)    │
//!  │          └─ LossModel                              │
//!  └─────┬─────────────────────────────────┬────────────┘
//!        │ inbound engine                  │ outbound engine
//!        │ (readiness wait, ACKs, sweep)   │ (T/2 tick, retransmit, admit)
//!  ┌─────▼─────────────────────────────────▼────────────┐
//!  │          Channel (tokio UdpSocket per slot)        │
//!  └────────────────────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`config`]     : protocol constants and their validation
//! - [`error`]      : caller-visible error kinds
//! - [`segment`]    : wire format (4-byte header + fixed-size payload)
//! - [`queue`]      : bounded FIFO used for both message queues
//! - [`window`]     : send window and receive window state
//! - [`connection`] : per-connection state machine
//! - [`channel`]    : the datagram socket under one connection
//! - [`table`]      : fixed-capacity connection table
//! - [`simulator`]  : channel-loss emulation on the inbound path
//! - [`stack`]      : the service, its socket facade and reclamation
//! - [`retry`]      : bounded retry helpers for `NoSpace` / `NoMessage`
//! - [`transfer`]   : file transfer built on the facade
//!
//! # Example
//!
//! ```no_run
//! use ktp::{KtpConfig, KtpStack, SocketType};
//! use socket2::Domain;
//!
//! # async fn demo() -> Result<(), ktp::KtpError> {
//! let stack = KtpStack::start(KtpConfig::default())?;
//! let handle = stack.socket(Domain::IPV4, SocketType::Ktp, None)?;
//! let peer = "127.0.0.1:9001".parse().unwrap();
//! stack.bind(handle, "127.0.0.1:9000".parse().unwrap(), peer)?;
//! stack.send_to(handle, b"hello", peer)?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
mod inbound;
mod outbound;
pub mod queue;
pub mod retry;
pub mod segment;
pub mod simulator;
pub mod stack;
pub mod table;
pub mod transfer;
pub mod window;

pub use config::KtpConfig;
pub use connection::{ConnectionStats, ConnectionStatus, OwnerId};
pub use error::KtpError;
pub use simulator::{LossModel, LossSimulator};
pub use stack::{KtpStack, SocketType};
pub use table::SocketHandle;
