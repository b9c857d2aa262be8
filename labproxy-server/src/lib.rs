//! HTTP front end of the lab device proxy.
//!
//! `POST /` accepts a framed command request, runs the command inside a
//! per-request workspace and streams the framed result back. Everything
//! protocol-specific lives in the `labproxy` crate; this crate wires it to
//! axum.

pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
