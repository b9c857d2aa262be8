//! I/O side of the proxy: frame streams, directory archives, server
//! configuration, request workspaces, request intake and child process
//! execution.

pub mod archive;
pub mod config;
pub mod executor;
pub mod frame_io;
pub mod intake;
pub mod workspace;
