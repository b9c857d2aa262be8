//! Directory transfer as tar archives.
//!
//! A directory argument crosses the wire as one uncompressed tar stream in
//! the frames of its placeholder (`tar=true`). Archives are spooled to
//! anonymous temporary files so large trees never sit in memory, and
//! symlinks are stored as links rather than followed.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

/// Archive `dir` with every entry placed under `prefix/`.
pub fn pack_dir_as(dir: &Path, prefix: &str) -> io::Result<File> {
    let mut builder = tar::Builder::new(tempfile::tempfile()?);
    builder.follow_symlinks(false);
    builder.append_dir_all(prefix, dir)?;
    finish(builder)
}

/// Archive the contents of `dir`, with entry paths relative to it.
pub fn pack_contents(dir: &Path) -> io::Result<File> {
    let mut builder = tar::Builder::new(tempfile::tempfile()?);
    builder.follow_symlinks(false);
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let name = entry.file_name();
        if entry.file_type()?.is_dir() {
            builder.append_dir_all(&name, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }
    finish(builder)
}

fn finish(builder: tar::Builder<File>) -> io::Result<File> {
    let mut file = builder.into_inner()?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

/// Extract `archive` into `dest`, which must exist.
///
/// Entries whose path would resolve outside `dest` are skipped. Returns the
/// number of entries written.
pub fn unpack<R: Read>(archive: R, dest: &Path) -> io::Result<usize> {
    let mut archive = tar::Archive::new(archive);
    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.unpack_in(dest)? {
            written += 1;
        } else {
            warn!(
                entry = %entry.path()?.display(),
                "skipping archive entry outside its destination"
            );
        }
    }
    debug!(dest = %dest.display(), entries = written, "archive unpacked");
    Ok(written)
}
