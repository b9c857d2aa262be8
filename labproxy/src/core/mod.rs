//! Deterministic, pure logic shared by the proxy client and server.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod frame;
pub mod grammar;
pub mod registry;
pub mod types;
