//! Stable exit codes for proxy-level failures.
//!
//! A successful exchange exits with the remote command's own exit code. The
//! codes below are reserved for failures of the proxy itself so scripts can tell
//! "the device command failed" apart from "the proxy failed".
//!
//! The separation is by convention only: a remote command that itself exits
//! with a code in `PROXY_MIN..=PROXY_MAX` is passed through unchanged and
//! looks like a proxy failure. The device tools proxied here do not use that
//! range; scripts wrapping other tools should check stderr for a `labproxy:`
//! line before treating such a code as a proxy failure.

/// Lowest reserved proxy exit code.
pub const PROXY_MIN: i32 = 240;
/// Missing proxy URL or unusable client command line.
pub const USAGE: i32 = 240;
/// The command has no registered grammar.
pub const UNKNOWN_COMMAND: i32 = 241;
/// The arguments do not match the command's grammar.
pub const INVALID_ARGUMENTS: i32 = 242;
/// A local input file could not be read or an output path is unusable.
pub const LOCAL_FILE: i32 = 243;
/// The server refused to run the command.
pub const COMMAND_NOT_ALLOWED: i32 = 244;
/// The server could not launch the command's executable.
pub const CHILD_LAUNCH_FAILED: i32 = 245;
/// The server rejected the request or sent a malformed response.
pub const PROTOCOL: i32 = 246;
/// Network failure, or the response ended before it was marked complete.
pub const TRANSPORT: i32 = 247;
/// Unexpected server-side or local I/O failure.
pub const INTERNAL: i32 = 248;
/// Highest reserved proxy exit code.
pub const PROXY_MAX: i32 = 248;

/// Map a remote exit status to a process exit code.
///
/// Signal terminations arrive as `-signal` and follow the shell convention
/// `128 + signal`.
pub fn from_remote(code: i32) -> i32 {
    if code < 0 { 128 + code.saturating_neg().min(127) } else { code }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_codes_in_reserved_range_are_not_remapped() {
        assert_eq!(from_remote(COMMAND_NOT_ALLOWED), COMMAND_NOT_ALLOWED);
        assert!((PROXY_MIN..=PROXY_MAX).contains(&from_remote(PROXY_MAX)));
    }

    #[test]
    fn remote_codes_pass_through() {
        assert_eq!(from_remote(0), 0);
        assert_eq!(from_remote(1), 1);
        assert_eq!(from_remote(255), 255);
    }

    #[test]
    fn signal_exits_use_shell_convention() {
        assert_eq!(from_remote(-9), 137);
        assert_eq!(from_remote(-15), 143);
    }
}
