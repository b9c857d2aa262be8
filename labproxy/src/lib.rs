//! Run device tools (`adb`, `idevice*`) on a remote lab host as if they were local.
//!
//! The crate is split the same way on both sides of the wire:
//!
//! - **[`core`]**: Pure, deterministic logic (command grammars, frame headers,
//!   placeholder types). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (frame streams, server configuration,
//!   per-request workspaces, request intake, child process execution).
//!
//! Client orchestration lives in [`marshal`] (argv to wire request),
//! [`client`] (HTTP exchange) and [`unmarshal`] (wire result to local streams
//! and files). The HTTP server itself is the `labproxy-server` crate.

pub mod client;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod marshal;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod unmarshal;

pub use error::ProxyError;
