//! Frame header codec shared by request and response bodies.
//!
//! Every body is a sequence of frames followed by an end marker:
//!
//! ```text
//! <LEN-hex>;id=<id>[,in=<name>][,out=<name>][,tar=true][,missing=true]\r\n<LEN bytes>\r\n
//! 0\r\n\r\n
//! ```
//!
//! A zero-length frame that carries an id is an empty payload; a zero-length
//! header without an id is the end marker. File frames flagged `tar=true`
//! carry a tar archive of a directory instead of file content. Only the
//! header line is handled here; payload transfer lives in `io::frame_io`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::types::{FileRole, Placeholder, is_wire_safe};

/// Largest payload carried by a single frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;
/// Largest accepted header line, including the trailing CRLF.
pub const MAX_HEADER_LINE: usize = 1024;
/// Largest payload buffered in memory (plain arguments, exit codes).
pub const MAX_INLINE_LEN: usize = 64 * 1024;
/// Terminator that marks a body as complete.
pub const END_MARKER: &[u8] = b"0\r\n\r\n";

static KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z_]*[a-z]$").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame header does not end with CRLF: {0:?}")]
    MissingCrlf(String),
    #[error("invalid frame length in header {0:?}")]
    InvalidLength(String),
    #[error("invalid frame field {0:?}")]
    InvalidField(String),
    #[error("unsupported character in frame field {key}={value:?}")]
    UnsafeValue { key: String, value: String },
    #[error("unknown frame id {0:?}")]
    UnknownId(String),
    #[error("frame without id must be the zero-length end marker")]
    MissingId,
}

/// Identifies which argument or stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameId {
    /// Plain argument at position N (`a<N>`).
    Arg(usize),
    /// Input file at position N (`i<N>`).
    Input(usize),
    /// Output file at position N (`o<N>`).
    Output(usize),
    /// Remote stdout (`1`).
    Stdout,
    /// Remote stderr (`2`).
    Stderr,
    /// Remote exit status (`exit`).
    Exit,
}

impl FrameId {
    /// Position in the argument vector, for argument and file frames.
    pub fn index(&self) -> Option<usize> {
        match self {
            FrameId::Arg(index) | FrameId::Input(index) | FrameId::Output(index) => Some(*index),
            FrameId::Stdout | FrameId::Stderr | FrameId::Exit => None,
        }
    }
}

impl From<Placeholder> for FrameId {
    fn from(placeholder: Placeholder) -> Self {
        match placeholder.role() {
            FileRole::Input => FrameId::Input(placeholder.index()),
            FileRole::Output => FrameId::Output(placeholder.index()),
        }
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameId::Arg(index) => write!(f, "a{index}"),
            FrameId::Input(index) => write!(f, "i{index}"),
            FrameId::Output(index) => write!(f, "o{index}"),
            FrameId::Stdout => f.write_str("1"),
            FrameId::Stderr => f.write_str("2"),
            FrameId::Exit => f.write_str("exit"),
        }
    }
}

impl FromStr for FrameId {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => return Ok(FrameId::Stdout),
            "2" => return Ok(FrameId::Stderr),
            "exit" => return Ok(FrameId::Exit),
            _ => {}
        }
        let unknown = || FrameError::UnknownId(s.to_string());
        let mut chars = s.chars();
        let prefix = chars.next().ok_or_else(unknown)?;
        let digits = chars.as_str();
        if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(unknown());
        }
        let index: usize = digits.parse().map_err(|_| unknown())?;
        match prefix {
            'a' => Ok(FrameId::Arg(index)),
            'i' => Ok(FrameId::Input(index)),
            'o' => Ok(FrameId::Output(index)),
            _ => Err(unknown()),
        }
    }
}

/// A parsed frame header line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub len: usize,
    /// `None` only for the end marker.
    pub id: Option<FrameId>,
    /// Workspace file name of an uploaded input file (`in=`).
    pub input_name: Option<String>,
    /// Workspace file name of an expected output file (`out=`).
    pub output_name: Option<String>,
    /// The payload is a tar archive of a directory (`tar=true`).
    pub tar: bool,
    /// The declared output file was not produced (`missing=true`).
    pub missing: bool,
}

impl FrameHeader {
    pub fn new(id: FrameId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn end() -> Self {
        Self::default()
    }

    pub fn is_end(&self) -> bool {
        self.id.is_none()
    }

    pub fn with_len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    pub fn with_input_name(mut self, name: impl Into<String>) -> Self {
        self.input_name = Some(name.into());
        self
    }

    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn with_tar(mut self) -> Self {
        self.tar = true;
        self
    }

    pub fn with_missing(mut self) -> Self {
        self.missing = true;
        self
    }

    /// Render the header line, including the trailing CRLF.
    pub fn format(&self) -> Result<String, FrameError> {
        let mut fields = Vec::new();
        if let Some(id) = self.id {
            fields.push(("id", id.to_string()));
        }
        if let Some(name) = &self.input_name {
            fields.push(("in", name.clone()));
        }
        if let Some(name) = &self.output_name {
            fields.push(("out", name.clone()));
        }
        if self.tar {
            fields.push(("tar", "true".to_string()));
        }
        if self.missing {
            fields.push(("missing", "true".to_string()));
        }
        for (key, value) in &fields {
            validate_value(key, value)?;
        }
        if fields.is_empty() {
            return Ok(format!("{:X}\r\n", self.len));
        }
        let rendered: Vec<String> = fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        Ok(format!("{:X};{}\r\n", self.len, rendered.join(",")))
    }

    /// Parse a header line (with its trailing CRLF).
    ///
    /// Unknown keys are ignored so either side can add fields later.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let body = line
            .strip_suffix("\r\n")
            .ok_or_else(|| FrameError::MissingCrlf(line.to_string()))?;
        let (len_part, fields) = match body.split_once(';') {
            Some((len, fields)) => (len, Some(fields)),
            None => (body, None),
        };
        let len_part = len_part.trim();
        let len = usize::from_str_radix(len_part, 16)
            .map_err(|_| FrameError::InvalidLength(line.to_string()))?;

        let mut header = FrameHeader {
            len,
            ..Self::default()
        };
        for item in fields.into_iter().flat_map(|fields| fields.split(',')) {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| FrameError::InvalidField(item.to_string()))?;
            if !KEY_RE.is_match(key) {
                return Err(FrameError::InvalidField(item.to_string()));
            }
            validate_value(key, value)?;
            match key {
                "id" => header.id = Some(value.parse()?),
                "in" => header.input_name = Some(value.to_string()),
                "out" => header.output_name = Some(value.to_string()),
                "tar" => header.tar = value.eq_ignore_ascii_case("true"),
                "missing" => header.missing = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        if header.id.is_none() && header.len != 0 {
            return Err(FrameError::MissingId);
        }
        Ok(header)
    }
}

fn validate_value(key: &str, value: &str) -> Result<(), FrameError> {
    if value.chars().all(is_wire_safe) {
        Ok(())
    } else {
        Err(FrameError::UnsafeValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}
