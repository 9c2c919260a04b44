//! Kernel protocol bridge
//!
//! Connects to a running interactive computation kernel over its
//! multi-channel, message-framed wire protocol and exposes tool-call style
//! operations (execute code, inspect state, interrupt, restart) to an
//! external agent. A single `execute` fans out into an asynchronous stream
//! of status, stdout/stderr, rich-output, and result messages; the bridge
//! correlates that burst back to the originating request and flattens it
//! into one coherent reply.
//!
//! # Architecture
//!
//! - **[`codec`]**: frames, signs, and parses wire messages (no I/O)
//! - **[`transport`]**: one socket per logical channel, TCP or in-memory
//! - **[`mux`]**: per-channel receive loops and correlation-key dispatch
//! - **[`session`]**: busy/idle, execution counter, reachability
//! - **[`execution`]**: request issue + output aggregation into one result
//! - **[`bridge`]**: connection lifecycle and the heartbeat monitor
//! - **[`mcp`]**: tool adapter translating tool calls to bridge operations
//! - **[`connection`]**: the external connection descriptor
//!
//! # Data flow
//!
//! ```text
//! tool call -> ExecutionCoordinator -> ChannelMultiplexer -> wire
//! wire -> channel loop -> ChannelMultiplexer -> PendingExecution -> result
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ipykernel_mcp::bridge::KernelBridge;
//! use ipykernel_mcp::config::BridgeConfig;
//! use ipykernel_mcp::connection::ConnectionInfo;
//!
//! # async fn example() -> ipykernel_mcp::Result<()> {
//! let info = ConnectionInfo::from_file(std::path::Path::new("kernel.json"))?;
//! let bridge = KernelBridge::connect(&info, BridgeConfig::default()).await?;
//!
//! let result = bridge.execute_code("1+1", None).await?;
//! println!("{:?}: {} outputs", result.status, result.outputs.len());
//! bridge.close();
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod execution;
pub mod mcp;
pub mod mux;
pub mod session;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod integration_tests;

pub use error::{Error, Result};
