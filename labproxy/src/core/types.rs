//! Shared deterministic types for the proxy protocol.
//!
//! These types define stable contracts between the client and the server. They
//! must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a single command-line token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// Opaque argument, forwarded verbatim.
    Plain,
    /// Local file whose content is uploaded before the command runs.
    InputFile,
    /// Local path that receives a file the command produces.
    OutputFile,
}

/// Direction of a file argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileRole {
    Input,
    Output,
}

/// Opaque identifier substituted for a file path on the wire.
///
/// Rendered as `i<N>` or `o<N>`, where `N` is the token position in the
/// argument vector (the command name is position 0). Positions are unique
/// within a request, so placeholders are too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Placeholder {
    role: FileRole,
    index: usize,
}

impl Placeholder {
    pub fn input(index: usize) -> Self {
        Self {
            role: FileRole::Input,
            index,
        }
    }

    pub fn output(index: usize) -> Self {
        Self {
            role: FileRole::Output,
            index,
        }
    }

    pub fn role(&self) -> FileRole {
        self.role
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            FileRole::Input => write!(f, "i{}", self.index),
            FileRole::Output => write!(f, "o{}", self.index),
        }
    }
}

/// Machine-readable reason carried by a rejected (non-200) response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    CommandNotAllowed,
    ChildLaunchFailed,
    Internal,
}

/// JSON body of a rejected response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Characters allowed in wire file names and header values.
pub fn is_wire_safe(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')
}

/// Reduce a local file name to something the wire format accepts.
///
/// The server keeps this name for the workspace copy, so extensions survive
/// (tools such as `adb install` check them). Unsafe characters become `_`;
/// names that would resolve to `.` or `..` fall back to `file`.
pub fn wire_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| if is_wire_safe(ch) { ch } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '.') {
        "file".to_string()
    } else {
        cleaned
    }
}
