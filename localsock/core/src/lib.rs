//! localsock Core - Unix Domain Socket Server Framework
//!
//! This crate lets a process expose a local IPC endpoint over `AF_UNIX`
//! stream sockets, either at a filesystem path or in the Linux abstract
//! namespace, and accept connections only from its own user or root.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      LocalSocketManager                       │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                     ServerSocket                        │  │
//! │  │   RunConfig ──> start() ──> accept thread               │  │
//! │  │                               │                         │  │
//! │  │         accept() -> peer credential -> uid check        │  │
//! │  │                               │                         │  │
//! │  │                 set SO_RCVTIMEO / SO_SNDTIMEO           │  │
//! │  └───────────────────────────────┼────────────────────────┘  │
//! │                                  ▼                            │
//! │                    ClientHandler::on_client_accepted          │
//! │           (closure | ThreadPerClient | ChannelHandler)        │
//! └──────────────────────────────────────────────────────────────┘
//!                                    │
//!                        NativeSocketProvider (libc)
//! ```
//!
//! # Key Types
//!
//! - [`RunConfig`]: Endpoint description (title, path, backlog, timeouts, fd slot)
//! - [`ServerSocket`]: Bind/listen, accept loop and access control
//! - [`ClientSocket`]: One accepted connection with blocking, timed I/O
//! - [`PeerCredential`]: Kernel-reported pid/uid/gid of the peer
//! - [`ClientHandler`]: Where accepted clients are handed off
//! - [`LocalSocketManager`]: Runs a server and serves each client on its own thread
//! - [`LocalSocketError`]: Categorized, coded errors
//!
//! # Quick Start
//!
//! ```no_run
//! use localsock_core::{ClientSocket, LocalSocketManager, RunConfig};
//!
//! let config = RunConfig::new("echo", "/tmp/echo.sock")?;
//! let manager = LocalSocketManager::new(config, |client: ClientSocket| {
//!     let mut buf = [0u8; 1024];
//!     while let Ok(n) = client.read(&mut buf) {
//!         if n == 0 || client.write(&buf[..n]).is_err() {
//!             break;
//!         }
//!     }
//! });
//! manager.start()?;
//! // ...
//! manager.stop()?;
//! # Ok::<(), localsock_core::LocalSocketError>(())
//! ```
//!
//! # Module Overview
//!
//! - [`run_config`]: Endpoint configuration and listening fd slot
//! - [`path`]: Socket path canonicalization and socket file housekeeping
//! - [`server`]: Server socket state machine and accept loop
//! - [`client`]: Accepted client connections and `std::io` adapters
//! - [`handler`]: Client handoff strategies
//! - [`manager`]: Server lifecycle wrapper
//! - [`credential`]: Peer credentials
//! - [`native`]: Syscall provider trait and libc implementation
//! - [`error`]: Error taxonomy
//! - [`config`]: TOML/environment settings

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(unix))]
compile_error!("localsock-core only supports Unix platforms");

pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod handler;
pub mod manager;
pub mod native;
pub mod path;
pub mod run_config;
pub mod server;

// Re-exports for convenience
pub use client::{ClientInputStream, ClientOutputStream, ClientSocket};
pub use credential::PeerCredential;
pub use error::{LocalSocketError, NativeError};
pub use handler::{ChannelHandler, ClientHandler, CloseImmediately, ThreadPerClient};
pub use manager::LocalSocketManager;
pub use native::{current_uid, LibcProvider, NativeSocketProvider};
pub use run_config::RunConfig;
pub use server::{ServerSocket, ServerState};

// Config exports
pub use config::{
    default_config_path, default_socket_path, load_settings, load_settings_from_path,
    ConfigError, ConfigOverrides, ConfigSource, ServerSettings,
};
