//! Proxy-level failures.
//!
//! A non-zero exit code from the remote command is not an error here: it is
//! the result. `ProxyError` covers everything that prevents a trustworthy
//! result, and maps each case to a reserved exit code (client) and to an
//! HTTP status plus [`ErrorKind`] (server).

use std::path::PathBuf;

use thiserror::Error;

use crate::core::grammar::GrammarError;
use crate::core::types::{ErrorBody, ErrorKind};
use crate::exit_codes;
use crate::io::frame_io::FrameIoError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported command {0:?}")]
    UnknownCommand(String),
    #[error("invalid {command} arguments: {source}")]
    InvalidArguments {
        command: String,
        #[source]
        source: GrammarError,
    },
    #[error("{}: {reason}", path.display())]
    LocalFile { path: PathBuf, reason: String },
    #[error("command {0:?} is not allowed on this server")]
    CommandNotAllowed(String),
    #[error("could not launch {command}: {reason}")]
    ChildLaunchFailed { command: String, reason: String },
    #[error("request rejected: {0}")]
    BadRequest(String),
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("proxy server unreachable: {0}")]
    Transport(String),
    #[error("response ended before completion: {0}")]
    IncompleteResult(String),
    #[error("proxy server error: {0}")]
    Server(String),
    /// A rejection reported by the server, rebuilt on the client.
    #[error("server: {message}")]
    Rejected { kind: ErrorKind, message: String },
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn local_file(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ProxyError::LocalFile {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Reserved client exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProxyError::Usage(_) => exit_codes::USAGE,
            ProxyError::UnknownCommand(_) => exit_codes::UNKNOWN_COMMAND,
            ProxyError::InvalidArguments { .. } => exit_codes::INVALID_ARGUMENTS,
            ProxyError::LocalFile { .. } => exit_codes::LOCAL_FILE,
            ProxyError::CommandNotAllowed(_) => exit_codes::COMMAND_NOT_ALLOWED,
            ProxyError::ChildLaunchFailed { .. } => exit_codes::CHILD_LAUNCH_FAILED,
            ProxyError::BadRequest(_) | ProxyError::Protocol(_) => exit_codes::PROTOCOL,
            ProxyError::Transport(_) | ProxyError::IncompleteResult(_) => exit_codes::TRANSPORT,
            ProxyError::Server(_) | ProxyError::Io(_) => exit_codes::INTERNAL,
            ProxyError::Rejected { kind, .. } => match kind {
                ErrorKind::BadRequest => exit_codes::PROTOCOL,
                ErrorKind::CommandNotAllowed => exit_codes::COMMAND_NOT_ALLOWED,
                ErrorKind::ChildLaunchFailed => exit_codes::CHILD_LAUNCH_FAILED,
                ErrorKind::Internal => exit_codes::INTERNAL,
            },
        }
    }

    /// Wire reason reported by the server.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::UnknownCommand(_) | ProxyError::CommandNotAllowed(_) => {
                ErrorKind::CommandNotAllowed
            }
            ProxyError::ChildLaunchFailed { .. } => ErrorKind::ChildLaunchFailed,
            ProxyError::InvalidArguments { .. }
            | ProxyError::BadRequest(_)
            | ProxyError::Protocol(_)
            | ProxyError::IncompleteResult(_) => ErrorKind::BadRequest,
            ProxyError::Usage(_)
            | ProxyError::LocalFile { .. }
            | ProxyError::Transport(_)
            | ProxyError::Server(_)
            | ProxyError::Io(_) => ErrorKind::Internal,
            ProxyError::Rejected { kind, .. } => *kind,
        }
    }

    /// HTTP status code the server answers with.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::BadRequest => 400,
            ErrorKind::CommandNotAllowed => 403,
            ErrorKind::ChildLaunchFailed | ErrorKind::Internal => 500,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Rebuild the client-side error from a rejected response.
    pub fn from_body(status: u16, body: Option<ErrorBody>) -> Self {
        match body {
            Some(body) => ProxyError::Rejected {
                kind: body.kind,
                message: body.message,
            },
            None => ProxyError::Server(format!("unexpected HTTP status {status}")),
        }
    }

    /// Client-side view of a response stream failure.
    pub fn from_response_stream(err: FrameIoError) -> Self {
        match err {
            FrameIoError::UnexpectedEof => {
                ProxyError::IncompleteResult("connection closed mid-transfer".to_string())
            }
            FrameIoError::Io(err) => ProxyError::IncompleteResult(err.to_string()),
            other => ProxyError::Protocol(other.to_string()),
        }
    }

    /// Server-side view of a request stream failure.
    pub fn from_request_stream(err: FrameIoError) -> Self {
        match err {
            FrameIoError::UnexpectedEof => {
                ProxyError::BadRequest("request ended before the end marker".to_string())
            }
            FrameIoError::Io(err) => ProxyError::Io(err),
            other => ProxyError::BadRequest(other.to_string()),
        }
    }
}
