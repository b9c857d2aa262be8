//! Client-side application of a response stream.
//!
//! Stdout and stderr frames are written through as they arrive. Output file
//! frames go to temporary files next to their destinations, which are only
//! renamed into place once the response is known to be complete (an `exit`
//! frame followed by the end marker). A broken stream therefore never leaves a
//! partially written output behind, and neither does an output the server
//! marks missing after some of its content was already sent.
//!
//! Archive outputs (`tar=true`) are staged the same way, then unpacked into a
//! staging directory and moved into the destination directory, which is
//! created if needed.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs;
use std::io::{self, BufRead, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::core::frame::FrameId;
use crate::core::types::Placeholder;
use crate::error::ProxyError;
use crate::io::archive;
use crate::io::frame_io::FrameReader;

/// Result of a completed remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Exit code reported by the server (negative: killed by signal).
    pub exit_code: i32,
    /// Declared outputs the command did not produce.
    pub missing: Vec<PathBuf>,
}

struct Staged {
    file: NamedTempFile,
    archive: bool,
}

pub struct Unmarshaler<O, E> {
    outputs: BTreeMap<Placeholder, PathBuf>,
    stdout: O,
    stderr: E,
}

impl<O: Write, E: Write> Unmarshaler<O, E> {
    pub fn new(outputs: BTreeMap<Placeholder, PathBuf>, stdout: O, stderr: E) -> Self {
        Self {
            outputs,
            stdout,
            stderr,
        }
    }

    /// Consume the response body up to and including the end marker.
    pub fn consume<R: BufRead>(mut self, reader: R) -> Result<Outcome, ProxyError> {
        let mut reader = FrameReader::new(reader);
        let mut staged: BTreeMap<Placeholder, Staged> = BTreeMap::new();
        let mut missing: Vec<Placeholder> = Vec::new();
        let mut exit_code: Option<i32> = None;

        loop {
            let header = reader
                .next_header()
                .map_err(ProxyError::from_response_stream)?;
            let Some(id) = header.id else {
                break;
            };
            if exit_code.is_some() {
                return Err(ProxyError::Protocol(format!(
                    "frame {id} after the exit status"
                )));
            }
            match id {
                FrameId::Stdout => {
                    reader
                        .copy_payload(&header, &mut self.stdout)
                        .map_err(ProxyError::from_response_stream)?;
                    self.stdout.flush()?;
                }
                FrameId::Stderr => {
                    reader
                        .copy_payload(&header, &mut self.stderr)
                        .map_err(ProxyError::from_response_stream)?;
                    self.stderr.flush()?;
                }
                FrameId::Output(index) => {
                    let placeholder = Placeholder::output(index);
                    let dest = self.outputs.get(&placeholder).ok_or_else(|| {
                        ProxyError::Protocol(format!("output {placeholder} was never requested"))
                    })?;
                    if missing.contains(&placeholder) {
                        return Err(ProxyError::Protocol(format!(
                            "output {placeholder} continued after its missing marker"
                        )));
                    }
                    if header.missing {
                        reader
                            .skip_payload(&header)
                            .map_err(ProxyError::from_response_stream)?;
                        if staged.remove(&placeholder).is_some() {
                            warn!(%placeholder, "output failed mid-transfer, discarding it");
                        }
                        missing.push(placeholder);
                        continue;
                    }
                    let stage = match staged.entry(placeholder) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => entry.insert(Staged {
                            file: stage_for(dest)?,
                            archive: header.tar,
                        }),
                    };
                    if stage.archive != header.tar {
                        return Err(ProxyError::Protocol(format!(
                            "output {placeholder} mixes archive and file frames"
                        )));
                    }
                    reader
                        .copy_payload(&header, stage.file.as_file_mut())
                        .map_err(ProxyError::from_response_stream)?;
                }
                FrameId::Exit => {
                    let payload = reader
                        .read_payload(&header)
                        .map_err(ProxyError::from_response_stream)?;
                    let code = std::str::from_utf8(&payload)
                        .ok()
                        .and_then(|text| text.trim().parse::<i32>().ok())
                        .ok_or_else(|| {
                            ProxyError::Protocol(format!(
                                "invalid exit status {:?}",
                                String::from_utf8_lossy(&payload)
                            ))
                        })?;
                    exit_code = Some(code);
                }
                FrameId::Arg(_) | FrameId::Input(_) => {
                    return Err(ProxyError::Protocol(format!(
                        "frame {id} is not valid in a response"
                    )));
                }
            }
        }

        let exit_code = exit_code.ok_or_else(|| {
            ProxyError::IncompleteResult("response ended without an exit status".to_string())
        })?;

        for (placeholder, stage) in staged {
            let dest = &self.outputs[&placeholder];
            if stage.archive {
                place_archive(stage.file, dest)?;
            } else {
                stage
                    .file
                    .persist(dest)
                    .map_err(|err| ProxyError::local_file(dest, err.error))?;
            }
            debug!(%placeholder, dest = %dest.display(), "output written");
        }

        let mut missing_paths = Vec::new();
        for (placeholder, dest) in &self.outputs {
            if missing.contains(placeholder) {
                missing_paths.push(dest.clone());
            } else if !dest.exists() {
                warn!(%placeholder, "server sent neither content nor a missing marker");
                missing_paths.push(dest.clone());
            }
        }
        Ok(Outcome {
            exit_code,
            missing: missing_paths,
        })
    }
}

/// Directory holding staged data for `dest`, so the final rename stays on
/// one filesystem.
fn staging_dir(dest: &Path) -> &Path {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn stage_for(dest: &Path) -> Result<NamedTempFile, ProxyError> {
    let dir = staging_dir(dest);
    let mut builder = tempfile::Builder::new();
    builder.prefix(".labproxy-");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    builder
        .tempfile_in(dir)
        .map_err(|err: io::Error| ProxyError::local_file(dest, err))
}

/// Unpack a staged archive into `dest`, creating it or merging into an
/// existing directory.
fn place_archive(mut staged: NamedTempFile, dest: &Path) -> Result<(), ProxyError> {
    let local = |err: io::Error| ProxyError::local_file(dest, err);
    if dest.exists() && !dest.is_dir() {
        return Err(ProxyError::local_file(
            dest,
            "server sent a directory, but the destination is a file",
        ));
    }
    let unpacked = tempfile::Builder::new()
        .prefix(".labproxy-")
        .tempdir_in(staging_dir(dest))
        .map_err(local)?;
    staged.as_file_mut().seek(SeekFrom::Start(0)).map_err(local)?;
    archive::unpack(staged.as_file(), unpacked.path()).map_err(local)?;

    if dest.is_dir() {
        merge_into(unpacked.path(), dest).map_err(local)?;
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(unpacked.path(), fs::Permissions::from_mode(0o755))
                .map_err(local)?;
        }
        fs::rename(unpacked.path(), dest).map_err(local)?;
    }
    Ok(())
}

fn merge_into(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() && target.is_dir() {
            merge_into(&entry.path(), &target)?;
        } else {
            fs::rename(entry.path(), &target)?;
        }
    }
    Ok(())
}
