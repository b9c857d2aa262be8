//! Per-request scratch directories on the server.
//!
//! Each request gets a fresh directory `proxy_<request-id>_XXXX` under the
//! configured workspace root. Uploaded inputs live at `<ws>/i<N>/<name>` and
//! outputs are expected at `<ws>/o<N>/<name>`; giving every placeholder its own
//! subdirectory keeps the original file name (and extension) intact without
//! any chance of two arguments colliding.
//!
//! Directory arguments arrive and leave as tar archives. An uploaded archive
//! is spooled to `<ws>/i<N>.tar` and unpacked into `<ws>/i<N>/`; an archive
//! output hands the command the whole `<ws>/o<N>/` directory.
//!
//! The directory is removed when the `Workspace` is dropped, whichever way the
//! request ends.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::core::types::{FileRole, Placeholder};
use crate::error::ProxyError;
use crate::io::archive;

/// What a command left at an output path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Produced {
    File(PathBuf),
    /// Sent back as an archive of the directory's contents.
    Directory(PathBuf),
}

#[derive(Debug)]
struct ReservedOutput {
    path: PathBuf,
    archive: bool,
}

#[derive(Debug)]
pub struct Workspace {
    request_id: String,
    dir: TempDir,
    outputs: BTreeMap<Placeholder, ReservedOutput>,
}

impl Workspace {
    /// Create the workspace directory for `request_id` under `root`.
    pub fn begin(root: &Path, request_id: &str) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("proxy_{request_id}_"))
            .tempdir_in(root)?;
        debug!(request_id, path = %dir.path().display(), "workspace created");
        Ok(Self {
            request_id: request_id.to_string(),
            dir,
            outputs: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Create the file that receives an uploaded input. The caller streams the
    /// content into the returned handle.
    pub async fn create_input(
        &self,
        placeholder: Placeholder,
        name: &str,
    ) -> Result<(PathBuf, tokio::fs::File), ProxyError> {
        if placeholder.role() != FileRole::Input {
            return Err(ProxyError::BadRequest(format!(
                "{placeholder} is not an input placeholder"
            )));
        }
        let path = self.slot(placeholder, name)?;
        let file = tokio::fs::File::create(&path).await?;
        Ok((path, file))
    }

    /// Like [`create_input`](Self::create_input) for a directory upload. The
    /// returned handle receives the archive; the returned path is where the
    /// directory appears after [`unpack_input`](Self::unpack_input).
    pub async fn create_input_archive(
        &self,
        placeholder: Placeholder,
        name: &str,
    ) -> Result<(PathBuf, tokio::fs::File), ProxyError> {
        if placeholder.role() != FileRole::Input {
            return Err(ProxyError::BadRequest(format!(
                "{placeholder} is not an input placeholder"
            )));
        }
        let path = self.slot(placeholder, name)?;
        let file = tokio::fs::File::create(self.archive_path(placeholder)).await?;
        Ok((path, file))
    }

    /// Unpack a fully received directory upload and drop its archive.
    pub async fn unpack_input(&self, placeholder: Placeholder, name: &str) -> Result<(), ProxyError> {
        let archive_path = self.archive_path(placeholder);
        let slot = self.dir.path().join(placeholder.to_string());
        let unpacked = tokio::task::spawn_blocking({
            let archive_path = archive_path.clone();
            let slot = slot.clone();
            move || archive::unpack(fs::File::open(&archive_path)?, &slot)
        })
        .await
        .map_err(|err| ProxyError::Server(format!("unpacking {placeholder} failed: {err}")))?
        .map_err(|err| ProxyError::BadRequest(format!("invalid archive for {placeholder}: {err}")))?;
        tokio::fs::remove_file(&archive_path).await?;

        if !slot.join(name).is_dir() {
            return Err(ProxyError::BadRequest(format!(
                "archive for {placeholder} does not contain {name}/"
            )));
        }
        debug!(%placeholder, entries = unpacked, "directory input unpacked");
        Ok(())
    }

    /// Reserve the path an output is expected at. For an archive output the
    /// path is an empty directory the command writes into.
    pub fn reserve_output(
        &mut self,
        placeholder: Placeholder,
        name: &str,
        archive: bool,
    ) -> Result<PathBuf, ProxyError> {
        if placeholder.role() != FileRole::Output {
            return Err(ProxyError::BadRequest(format!(
                "{placeholder} is not an output placeholder"
            )));
        }
        let mut path = self.slot(placeholder, name)?;
        if archive {
            path.pop();
        }
        self.outputs.insert(
            placeholder,
            ReservedOutput {
                path: path.clone(),
                archive,
            },
        );
        Ok(path)
    }

    /// What the command produced for `placeholder`, or `None` when there is
    /// nothing to send back.
    pub fn collect(&self, placeholder: Placeholder) -> Option<Produced> {
        let reserved = self.outputs.get(&placeholder)?;
        let path = &reserved.path;
        if reserved.archive {
            let has_entries = fs::read_dir(path)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            return has_entries.then(|| Produced::Directory(path.clone()));
        }
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_file() => Some(Produced::File(path.clone())),
            Ok(meta) if meta.is_dir() => Some(Produced::Directory(path.clone())),
            Ok(_) => {
                warn!(%placeholder, "output is neither a file nor a directory");
                None
            }
            Err(_) => None,
        }
    }

    /// Remove the workspace, reporting any cleanup failure.
    pub fn end(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(request_id = %self.request_id, path = %path.display(), "workspace removed");
        Ok(())
    }

    fn archive_path(&self, placeholder: Placeholder) -> PathBuf {
        self.dir.path().join(format!("{placeholder}.tar"))
    }

    fn slot(&self, placeholder: Placeholder, name: &str) -> Result<PathBuf, ProxyError> {
        validate_name(name)?;
        let dir = self.dir.path().join(placeholder.to_string());
        if dir.exists() {
            return Err(ProxyError::BadRequest(format!(
                "placeholder {placeholder} used twice"
            )));
        }
        fs::create_dir(&dir)?;
        Ok(dir.join(name))
    }
}

fn validate_name(name: &str) -> Result<(), ProxyError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(ProxyError::BadRequest(format!(
            "invalid workspace file name {name:?}"
        ))),
    }
}
