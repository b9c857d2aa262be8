//! Test-only helpers: fake device tools, server configs and response bodies.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::frame::{END_MARKER, FrameHeader, FrameId};
use crate::io::config::{CommandConfig, ServerConfig};
use crate::io::frame_io::encode_frame;

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    }
    path
}

/// A config that allows exactly `tools` (name, executable) and keeps
/// workspaces under `root/workspaces`.
pub fn config_with_tools(root: &Path, tools: &[(&str, &Path)]) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        workspace_root: Some(root.join("workspaces")),
        tool_dir: None,
        command_timeout_secs: None,
        commands: tools
            .iter()
            .map(|(name, path)| {
                (
                    name.to_string(),
                    CommandConfig {
                        path: Some(path.to_path_buf()),
                    },
                )
            })
            .collect(),
    }
}

/// A complete response body: the given frames, an exit frame and the end
/// marker.
pub fn response_body(frames: &[(FrameHeader, &[u8])], exit_code: i32) -> Vec<u8> {
    let mut body = Vec::new();
    for (header, payload) in frames {
        body.extend(encode_frame(header.clone(), payload).expect("encode frame"));
    }
    body.extend(
        encode_frame(
            FrameHeader::new(FrameId::Exit),
            exit_code.to_string().as_bytes(),
        )
        .expect("encode exit"),
    );
    body.extend_from_slice(END_MARKER);
    body
}

/// Entries left in a directory, or zero if it does not exist.
pub fn entry_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}
