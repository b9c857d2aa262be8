//! Client-side translation of a local command line into a wire request.
//!
//! Every token after the command name is classified by the command grammar.
//! Input files are opened up front (so a typo fails before anything is sent)
//! and their content is streamed lazily from [`RequestBody`]; an input that
//! names a directory is packed into a tar archive at this point instead.
//! Output files are only declared, and an output that names an existing
//! directory asks the server for an archive of everything the command wrote.
//! Local paths never leave the machine: the server sees placeholders plus a
//! sanitized base name.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::frame::{END_MARKER, FrameHeader, FrameId, MAX_FRAME_LEN};
use crate::core::registry;
use crate::core::types::{ArgKind, Placeholder, wire_file_name};
use crate::error::ProxyError;
use crate::io::archive;
use crate::io::frame_io::encode_frame;

/// One argument after the command name, as it will be sent.
#[derive(Debug)]
pub enum WireArg {
    Plain(String),
    Input {
        placeholder: Placeholder,
        name: String,
        path: PathBuf,
        file: File,
        /// `file` is a tar archive of the directory at `path`.
        archive: bool,
    },
    Output {
        placeholder: Placeholder,
        name: String,
        path: PathBuf,
        /// `path` is an existing directory that receives an archive.
        archive: bool,
    },
}

/// A classified command line, ready to be streamed to the server.
#[derive(Debug)]
pub struct WireRequest {
    command: String,
    args: Vec<WireArg>,
}

/// Classify `argv` (command name first) and prepare its file arguments.
pub fn marshal<S: AsRef<str>>(argv: &[S]) -> Result<WireRequest, ProxyError> {
    let (command, rest) = argv
        .split_first()
        .ok_or_else(|| ProxyError::Usage("no command given".to_string()))?;
    let command = command.as_ref();
    let spec =
        registry::lookup(command).ok_or_else(|| ProxyError::UnknownCommand(command.to_string()))?;
    let kinds = spec
        .classify(rest)
        .map_err(|source| ProxyError::InvalidArguments {
            command: command.to_string(),
            source,
        })?;

    let mut args = Vec::with_capacity(rest.len());
    for (offset, (token, kind)) in rest.iter().zip(kinds).enumerate() {
        let token = token.as_ref();
        let index = offset + 1;
        let arg = match kind {
            ArgKind::Plain => WireArg::Plain(token.to_string()),
            ArgKind::InputFile => {
                let path = PathBuf::from(token);
                let name = wire_name(&path);
                let (file, archive) = open_input(&path, &name)?;
                WireArg::Input {
                    placeholder: Placeholder::input(index),
                    name,
                    path,
                    file,
                    archive,
                }
            }
            ArgKind::OutputFile => {
                let path = PathBuf::from(token);
                let archive = check_output(&path)?;
                WireArg::Output {
                    placeholder: Placeholder::output(index),
                    name: wire_name(&path),
                    path,
                    archive,
                }
            }
        };
        args.push(arg);
    }

    let request = WireRequest {
        command: command.to_string(),
        args,
    };
    debug!(remote = %request.display(), "marshaled command");
    Ok(request)
}

impl WireRequest {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Local destination of every declared output.
    pub fn outputs(&self) -> BTreeMap<Placeholder, PathBuf> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                WireArg::Output {
                    placeholder, path, ..
                } => Some((*placeholder, path.clone())),
                _ => None,
            })
            .collect()
    }

    /// The command line as the server will see it, with placeholders.
    pub fn display(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.args.iter().map(|arg| match arg {
            WireArg::Plain(text) => text.clone(),
            WireArg::Input { placeholder, .. } | WireArg::Output { placeholder, .. } => {
                placeholder.to_string()
            }
        }));
        parts.join(" ")
    }

    /// Turn the request into a lazily encoded body.
    pub fn into_body(self) -> RequestBody {
        let mut parts = VecDeque::with_capacity(self.args.len() + 1);
        parts.push_back(Part::Plain {
            index: 0,
            text: self.command,
        });
        for (offset, arg) in self.args.into_iter().enumerate() {
            let index = offset + 1;
            parts.push_back(match arg {
                WireArg::Plain(text) => Part::Plain { index, text },
                WireArg::Input {
                    placeholder,
                    name,
                    file,
                    archive,
                    ..
                } => {
                    let header = FrameHeader::new(placeholder.into()).with_input_name(name);
                    Part::Input {
                        header: if archive { header.with_tar() } else { header },
                        file,
                    }
                }
                WireArg::Output {
                    placeholder,
                    name,
                    archive,
                    ..
                } => {
                    let header = FrameHeader::new(placeholder.into()).with_output_name(name);
                    Part::Output {
                        header: if archive { header.with_tar() } else { header },
                    }
                }
            });
        }
        RequestBody {
            parts,
            upload: None,
            buf: Vec::new(),
            pos: 0,
            finished: false,
        }
    }
}

#[derive(Debug)]
enum Part {
    Plain { index: usize, text: String },
    Input { header: FrameHeader, file: File },
    Output { header: FrameHeader },
}

#[derive(Debug)]
struct Upload {
    header: FrameHeader,
    file: File,
    sent_any: bool,
}

/// `Read` adapter producing the framed request body.
///
/// Input file content is read in frame-sized chunks as the transport pulls
/// bytes, so arbitrarily large uploads never sit in memory.
#[derive(Debug)]
pub struct RequestBody {
    parts: VecDeque<Part>,
    upload: Option<Upload>,
    buf: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl RequestBody {
    /// Load the next frame into `buf`. Returns false once the end marker has
    /// been produced.
    fn fill(&mut self) -> io::Result<bool> {
        self.buf.clear();
        self.pos = 0;
        loop {
            if let Some(upload) = self.upload.as_mut() {
                let mut chunk = Vec::with_capacity(MAX_FRAME_LEN);
                (&mut upload.file)
                    .take(MAX_FRAME_LEN as u64)
                    .read_to_end(&mut chunk)?;
                if !chunk.is_empty() || !upload.sent_any {
                    upload.sent_any = true;
                    self.buf = encode(upload.header.clone(), &chunk)?;
                    if chunk.len() < MAX_FRAME_LEN {
                        self.upload = None;
                    }
                    return Ok(true);
                }
                self.upload = None;
            }

            match self.parts.pop_front() {
                Some(Part::Plain { index, text }) => {
                    self.buf = encode(FrameHeader::new(FrameId::Arg(index)), text.as_bytes())?;
                    return Ok(true);
                }
                Some(Part::Output { header }) => {
                    self.buf = encode(header, &[])?;
                    return Ok(true);
                }
                Some(Part::Input { header, file }) => {
                    self.upload = Some(Upload {
                        header,
                        file,
                        sent_any: false,
                    });
                }
                None if !self.finished => {
                    self.finished = true;
                    self.buf.extend_from_slice(END_MARKER);
                    return Ok(true);
                }
                None => return Ok(false),
            }
        }
    }
}

impl Read for RequestBody {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            if !self.fill()? {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn encode(header: FrameHeader, payload: &[u8]) -> io::Result<Vec<u8>> {
    encode_frame(header, payload).map_err(io::Error::other)
}

/// Base name sent to the server. `.` and `dir/..` are resolved first so a
/// directory argument keeps its real name.
fn wire_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .or_else(|| {
            let resolved = fs::canonicalize(path).ok()?;
            Some(resolved.file_name()?.to_string_lossy().into_owned())
        })
        .unwrap_or_default();
    wire_file_name(&name)
}

/// Open an input for upload. Directories are packed under `name/`.
fn open_input(path: &Path, name: &str) -> Result<(File, bool), ProxyError> {
    let meta = fs::metadata(path).map_err(|err| ProxyError::local_file(path, err))?;
    if meta.is_dir() {
        let packed =
            archive::pack_dir_as(path, name).map_err(|err| ProxyError::local_file(path, err))?;
        debug!(path = %path.display(), "directory input packed");
        return Ok((packed, true));
    }
    let file = File::open(path).map_err(|err| ProxyError::local_file(path, err))?;
    Ok((file, false))
}

/// Returns whether the output is an existing directory.
fn check_output(path: &Path) -> Result<bool, ProxyError> {
    if path.is_dir() {
        return Ok(true);
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(false),
    };
    if !parent.is_dir() {
        return Err(ProxyError::local_file(path, "parent directory does not exist"));
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{BufReader, Read};

    use super::*;
    use crate::io::frame_io::FrameReader;

    fn frames(body: RequestBody) -> Vec<(FrameHeader, Vec<u8>)> {
        let mut reader = FrameReader::new(BufReader::new(body));
        let mut frames = Vec::new();
        loop {
            let header = reader.next_header().expect("header");
            if header.is_end() {
                return frames;
            }
            let mut payload = Vec::new();
            reader
                .copy_payload(&header, &mut payload)
                .expect("payload");
            frames.push((header, payload));
        }
    }

    #[test]
    fn install_uploads_the_apk_under_a_placeholder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let apk = temp.path().join("Test.apk");
        fs::write(&apk, b"PK\x03\x04apk").expect("write");
        let apk_arg = apk.to_str().expect("utf8 path");

        let request =
            marshal(&["adb", "-s", "emulator-5554", "install", apk_arg]).expect("marshal");
        assert_eq!(request.display(), "adb -s emulator-5554 install i4");
        assert!(request.outputs().is_empty());

        let frames = frames(request.into_body());
        let ids: Vec<FrameId> = frames.iter().filter_map(|(h, _)| h.id).collect();
        assert_eq!(
            ids,
            vec![
                FrameId::Arg(0),
                FrameId::Arg(1),
                FrameId::Arg(2),
                FrameId::Arg(3),
                FrameId::Input(4),
            ]
        );
        let (header, payload) = &frames[4];
        assert_eq!(header.input_name.as_deref(), Some("Test.apk"));
        assert_eq!(payload, b"PK\x03\x04apk");
        assert!(
            frames
                .iter()
                .all(|(_, payload)| !String::from_utf8_lossy(payload).contains(apk_arg))
        );
    }

    #[test]
    fn large_inputs_are_split_into_frames() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("blob.bin");
        let content: Vec<u8> = (0..=255u8).cycle().take(2 * MAX_FRAME_LEN + 7).collect();
        fs::write(&path, &content).expect("write");

        let request = marshal(&["adb", "push", path.to_str().expect("utf8"), "/sdcard/blob.bin"])
            .expect("marshal");
        let frames = frames(request.into_body());
        let uploads: Vec<&Vec<u8>> = frames
            .iter()
            .filter(|(h, _)| h.id == Some(FrameId::Input(2)))
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(uploads.len(), 3);
        assert_eq!(
            uploads.into_iter().flatten().copied().collect::<Vec<u8>>(),
            content
        );
        assert_eq!(frames.last().map(|(h, _)| h.id), Some(Some(FrameId::Arg(3))));
    }

    #[test]
    fn empty_input_is_one_empty_frame() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("empty.txt");
        fs::write(&path, b"").expect("write");

        let request = marshal(&["adb", "push", path.to_str().expect("utf8"), "/sdcard/e"])
            .expect("marshal");
        let frames = frames(request.into_body());
        let uploads: Vec<_> = frames
            .iter()
            .filter(|(h, _)| h.id == Some(FrameId::Input(2)))
            .collect();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].1.is_empty());
    }

    #[test]
    fn outputs_are_declared_not_read() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dest = temp.path().join("screen shot.png");

        let request = marshal(&["idevicescreenshot", dest.to_str().expect("utf8")]).expect("marshal");
        assert_eq!(
            request.outputs(),
            BTreeMap::from([(Placeholder::output(1), dest.clone())])
        );
        let frames = frames(request.into_body());
        let (header, payload) = &frames[1];
        assert_eq!(header.id, Some(FrameId::Output(1)));
        assert_eq!(header.output_name.as_deref(), Some("screen_shot.png"));
        assert!(payload.is_empty());
        assert!(!dest.exists());
    }

    #[test]
    fn body_ends_with_end_marker() {
        let mut body = marshal(&["idevice_id", "-l"]).expect("marshal").into_body();
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes).expect("read");
        assert!(bytes.ends_with(END_MARKER));
        assert!(bytes.starts_with(b"A;id=a0\r\nidevice_id\r\n"));
    }

    #[test]
    fn missing_input_fails_locally() {
        let err = marshal(&["adb", "install", "/nonexistent/Test.apk"]).expect_err("missing");
        assert!(matches!(err, ProxyError::LocalFile { .. }), "{err}");
    }

    #[test]
    fn directory_input_is_sent_as_archive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let photos = temp.path().join("photos");
        fs::create_dir_all(photos.join("2024")).expect("mkdir");
        fs::write(photos.join("2024").join("cat.jpg"), b"\xff\xd8jpeg").expect("write");

        let request = marshal(&["adb", "push", photos.to_str().expect("utf8"), "/sdcard/"])
            .expect("marshal");
        let frames = frames(request.into_body());
        let uploads: Vec<_> = frames
            .iter()
            .filter(|(h, _)| h.id == Some(FrameId::Input(2)))
            .collect();
        assert!(!uploads.is_empty());
        assert!(uploads.iter().all(|(h, _)| h.tar));
        assert_eq!(uploads[0].0.input_name.as_deref(), Some("photos"));

        let data: Vec<u8> = uploads
            .iter()
            .flat_map(|(_, payload)| payload.iter().copied())
            .collect();
        let dest = temp.path().join("unpacked");
        fs::create_dir(&dest).expect("mkdir");
        archive::unpack(data.as_slice(), &dest).expect("unpack");
        assert_eq!(
            fs::read(dest.join("photos/2024/cat.jpg")).expect("read"),
            b"\xff\xd8jpeg"
        );
    }

    #[test]
    fn existing_directory_output_requests_archive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = marshal(&["adb", "pull", "/sdcard/DCIM", temp.path().to_str().expect("utf8")])
            .expect("marshal");
        assert_eq!(
            request.outputs(),
            BTreeMap::from([(Placeholder::output(3), temp.path().to_path_buf())])
        );
        let frames = frames(request.into_body());
        let (header, payload) = &frames[3];
        assert_eq!(header.id, Some(FrameId::Output(3)));
        assert!(header.tar);
        assert!(payload.is_empty());
    }

    #[test]
    fn output_in_missing_directory_is_rejected() {
        let err = marshal(&["adb", "pull", "/sdcard/x", "/nonexistent/dir/x"])
            .expect_err("no parent");
        assert!(matches!(err, ProxyError::LocalFile { .. }), "{err}");
    }

    #[test]
    fn unknown_commands_and_bad_arguments_fail_before_sending() {
        assert!(matches!(
            marshal(&["rm", "-rf", "/"]),
            Err(ProxyError::UnknownCommand(_))
        ));
        assert!(matches!(
            marshal(&["adb", "frobnicate"]),
            Err(ProxyError::InvalidArguments { .. })
        ));
        assert!(matches!(
            marshal::<&str>(&[]),
            Err(ProxyError::Usage(_))
        ));
    }
}
