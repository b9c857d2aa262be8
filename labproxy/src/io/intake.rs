//! Server-side decoding of a request body into an [`Invocation`].
//!
//! The command name (`a0`) is authorized before anything touches the disk.
//! After that, frames must arrive in argument order: each position `N` is
//! either a plain argument (`aN`), an input upload (`iN`, possibly split over
//! several frames, a tar archive when flagged `tar=true`) or an output
//! declaration (`oN`). Once the end marker
//! arrives, the received kinds are checked against the command grammar so a
//! client cannot smuggle a file into a position the server considers plain,
//! or the other way round.

use std::ffi::OsString;
use std::path::PathBuf;

use tokio::io::{AsyncBufRead, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::core::frame::{FrameHeader, FrameId};
use crate::core::registry::CommandSpec;
use crate::core::types::{ArgKind, FileRole, Placeholder};
use crate::error::ProxyError;
use crate::io::executor::Executor;
use crate::io::frame_io::AsyncFrameReader;
use crate::io::workspace::Workspace;

/// One argument after intake, as the child process will see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerArg {
    Plain(String),
    File {
        placeholder: Placeholder,
        name: String,
        /// Absolute workspace path substituted for the placeholder.
        path: PathBuf,
    },
}

impl ServerArg {
    pub fn kind(&self) -> ArgKind {
        match self {
            ServerArg::Plain(_) => ArgKind::Plain,
            ServerArg::File { placeholder, .. } => match placeholder.role() {
                FileRole::Input => ArgKind::InputFile,
                FileRole::Output => ArgKind::OutputFile,
            },
        }
    }
}

/// A fully received, authorized request.
#[derive(Debug, Clone)]
pub struct Invocation {
    spec: &'static CommandSpec,
    args: Vec<ServerArg>,
}

impl Invocation {
    pub fn new(spec: &'static CommandSpec, args: Vec<ServerArg>) -> Self {
        Self { spec, args }
    }

    pub fn command(&self) -> &'static str {
        self.spec.name
    }

    /// Arguments passed to the child, with workspace paths substituted.
    pub fn argv(&self) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| match arg {
                ServerArg::Plain(text) => OsString::from(text),
                ServerArg::File { path, .. } => path.clone().into_os_string(),
            })
            .collect()
    }

    /// Declared outputs, in argument order.
    pub fn outputs(&self) -> impl Iterator<Item = (Placeholder, &str)> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            ServerArg::File {
                placeholder, name, ..
            } if placeholder.role() == FileRole::Output => Some((*placeholder, name.as_str())),
            _ => None,
        })
    }

    /// Command line for logs, with placeholders in place of file paths.
    pub fn display(&self) -> String {
        let mut parts = vec![self.spec.name.to_string()];
        parts.extend(self.args.iter().map(|arg| match arg {
            ServerArg::Plain(text) => text.clone(),
            ServerArg::File { placeholder, .. } => placeholder.to_string(),
        }));
        parts.join(" ")
    }
}

/// Read a request body, authorize it, and materialize its inputs.
///
/// The returned workspace owns every uploaded file and reserved output path;
/// dropping it removes them.
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn receive<R: AsyncBufRead + Unpin>(
    reader: &mut AsyncFrameReader<R>,
    executor: &Executor,
    request_id: &str,
) -> Result<(Invocation, Workspace), ProxyError> {
    let first = next_header(reader).await?;
    if first.id != Some(FrameId::Arg(0)) {
        return Err(ProxyError::BadRequest(
            "request must start with the command name (a0)".to_string(),
        ));
    }
    let command = read_text(reader, &first).await?;
    let spec = executor.authorize(&command)?;

    let mut workspace = Workspace::begin(&executor.config().workspace_root(), request_id)?;
    let mut args: Vec<ServerArg> = Vec::new();
    let mut upload: Option<Upload> = None;

    loop {
        let header = next_header(reader).await?;
        let Some(id) = header.id else {
            break;
        };

        if let (FrameId::Input(index), Some(current)) = (id, upload.as_mut()) {
            if index == current.index {
                if header.input_name.as_deref() != Some(current.name.as_str())
                    || header.tar != current.archive
                {
                    return Err(ProxyError::BadRequest(format!(
                        "input {id} changed its header mid-upload"
                    )));
                }
                reader
                    .copy_payload(&header, &mut current.file)
                    .await
                    .map_err(ProxyError::from_request_stream)?;
                continue;
            }
        }
        if let Some(done) = upload.take() {
            done.finish(&workspace).await?;
        }

        let expected = args.len() + 1;
        if id.index() != Some(expected) {
            return Err(ProxyError::BadRequest(format!(
                "expected argument {expected}, got frame {id}"
            )));
        }

        match id {
            FrameId::Arg(_) => {
                args.push(ServerArg::Plain(read_text(reader, &header).await?));
            }
            FrameId::Input(index) => {
                let placeholder = Placeholder::input(index);
                let name = required_name(header.input_name.as_deref(), id)?;
                let (path, mut file) = if header.tar {
                    workspace.create_input_archive(placeholder, &name).await?
                } else {
                    workspace.create_input(placeholder, &name).await?
                };
                reader
                    .copy_payload(&header, &mut file)
                    .await
                    .map_err(ProxyError::from_request_stream)?;
                args.push(ServerArg::File {
                    placeholder,
                    name: name.clone(),
                    path,
                });
                upload = Some(Upload {
                    index,
                    name,
                    archive: header.tar,
                    file,
                });
            }
            FrameId::Output(index) => {
                let placeholder = Placeholder::output(index);
                let name = required_name(header.output_name.as_deref(), id)?;
                reader
                    .skip_payload(&header)
                    .await
                    .map_err(ProxyError::from_request_stream)?;
                let path = workspace.reserve_output(placeholder, &name, header.tar)?;
                args.push(ServerArg::File {
                    placeholder,
                    name,
                    path,
                });
            }
            FrameId::Stdout | FrameId::Stderr | FrameId::Exit => {
                return Err(ProxyError::BadRequest(format!(
                    "frame {id} is not valid in a request"
                )));
            }
        }
    }
    if let Some(done) = upload.take() {
        done.finish(&workspace).await?;
    }

    check_kinds(spec, &args)?;
    let invocation = Invocation::new(spec, args);
    debug!(command = %invocation.display(), "request received");
    Ok((invocation, workspace))
}

/// An input upload that may continue in the next frame.
struct Upload {
    index: usize,
    name: String,
    archive: bool,
    file: tokio::fs::File,
}

impl Upload {
    async fn finish(self, workspace: &Workspace) -> Result<(), ProxyError> {
        let Upload {
            index,
            name,
            archive,
            mut file,
        } = self;
        file.flush().await?;
        drop(file);
        if archive {
            workspace
                .unpack_input(Placeholder::input(index), &name)
                .await?;
        }
        Ok(())
    }
}

/// The kinds the client sent must be exactly what the grammar assigns to the
/// same tokens, with placeholders standing in for file paths.
fn check_kinds(spec: &CommandSpec, args: &[ServerArg]) -> Result<(), ProxyError> {
    let tokens: Vec<String> = args
        .iter()
        .map(|arg| match arg {
            ServerArg::Plain(text) => text.clone(),
            ServerArg::File { placeholder, .. } => placeholder.to_string(),
        })
        .collect();
    let expected = spec
        .classify(&tokens)
        .map_err(|source| ProxyError::InvalidArguments {
            command: spec.name.to_string(),
            source,
        })?;
    for (position, (arg, kind)) in args.iter().zip(&expected).enumerate() {
        if arg.kind() != *kind {
            return Err(ProxyError::BadRequest(format!(
                "argument {} of {} must be {kind:?}, got {:?}",
                position + 1,
                spec.name,
                arg.kind()
            )));
        }
    }
    Ok(())
}

async fn next_header<R: AsyncBufRead + Unpin>(
    reader: &mut AsyncFrameReader<R>,
) -> Result<FrameHeader, ProxyError> {
    reader
        .next_header()
        .await
        .map_err(ProxyError::from_request_stream)
}

async fn read_text<R: AsyncBufRead + Unpin>(
    reader: &mut AsyncFrameReader<R>,
    header: &FrameHeader,
) -> Result<String, ProxyError> {
    let payload = reader
        .read_payload(header)
        .await
        .map_err(ProxyError::from_request_stream)?;
    String::from_utf8(payload)
        .map_err(|_| ProxyError::BadRequest("argument is not valid UTF-8".to_string()))
}

fn required_name(name: Option<&str>, id: FrameId) -> Result<String, ProxyError> {
    name.map(str::to_string)
        .ok_or_else(|| ProxyError::BadRequest(format!("frame {id} has no file name")))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::core::frame::END_MARKER;
    use crate::io::config::ServerConfig;
    use crate::io::frame_io::encode_frame;
    use crate::test_support::config_with_tools;

    fn arg(index: usize, text: &str) -> Vec<u8> {
        encode_frame(FrameHeader::new(FrameId::Arg(index)), text.as_bytes()).expect("arg")
    }

    fn input(index: usize, name: &str, data: &[u8]) -> Vec<u8> {
        encode_frame(
            FrameHeader::new(FrameId::Input(index)).with_input_name(name),
            data,
        )
        .expect("input")
    }

    fn output(index: usize, name: &str) -> Vec<u8> {
        encode_frame(
            FrameHeader::new(FrameId::Output(index)).with_output_name(name),
            &[],
        )
        .expect("output")
    }

    fn body(frames: &[Vec<u8>]) -> AsyncFrameReader<Cursor<Vec<u8>>> {
        let mut data = frames.concat();
        data.extend_from_slice(END_MARKER);
        AsyncFrameReader::new(Cursor::new(data))
    }

    fn executor(root: &std::path::Path, allowed: &[&str]) -> Executor {
        let mut config: ServerConfig = config_with_tools(root, &[]);
        config.workspace_root = Some(root.join("ws"));
        config.commands = allowed
            .iter()
            .map(|name| (name.to_string(), Default::default()))
            .collect();
        Executor::new(Arc::new(config))
    }

    #[tokio::test]
    async fn receives_install_with_streamed_upload() {
        let root = tempfile::tempdir().expect("tempdir");
        let executor = executor(root.path(), &["adb"]);
        let mut reader = body(&[
            arg(0, "adb"),
            arg(1, "-s"),
            arg(2, "emulator-5554"),
            arg(3, "install"),
            input(4, "Test.apk", b"PK\x03\x04"),
            input(4, "Test.apk", b"rest"),
        ]);

        let (invocation, workspace) = receive(&mut reader, &executor, "req1")
            .await
            .expect("receive");

        assert_eq!(invocation.command(), "adb");
        assert_eq!(invocation.display(), "adb -s emulator-5554 install i4");
        let path = workspace.path().join("i4").join("Test.apk");
        assert_eq!(
            invocation.argv().last(),
            Some(&path.clone().into_os_string())
        );
        assert_eq!(fs::read(&path).expect("read"), b"PK\x03\x04rest");
        assert_eq!(invocation.outputs().count(), 0);
    }

    #[tokio::test]
    async fn receives_declared_outputs() {
        let root = tempfile::tempdir().expect("tempdir");
        let executor = executor(root.path(), &["adb"]);
        let mut reader = body(&[
            arg(0, "adb"),
            arg(1, "pull"),
            arg(2, "/sdcard/shot.png"),
            output(3, "shot.png"),
        ]);

        let (invocation, workspace) = receive(&mut reader, &executor, "req2")
            .await
            .expect("receive");
        let outputs: Vec<_> = invocation.outputs().collect();
        assert_eq!(outputs, vec![(Placeholder::output(3), "shot.png")]);
        assert!(workspace.path().join("o3").is_dir());
        assert!(!workspace.path().join("o3").join("shot.png").exists());
    }

    #[tokio::test]
    async fn empty_upload_creates_empty_file() {
        let root = tempfile::tempdir().expect("tempdir");
        let executor = executor(root.path(), &["adb"]);
        let mut reader = body(&[
            arg(0, "adb"),
            arg(1, "push"),
            input(2, "empty.txt", b""),
            arg(3, "/sdcard/empty.txt"),
        ]);

        let (_, workspace) = receive(&mut reader, &executor, "req3")
            .await
            .expect("receive");
        let path = workspace.path().join("i2").join("empty.txt");
        assert_eq!(fs::read(path).expect("read"), b"");
    }

    #[tokio::test]
    async fn directory_upload_is_unpacked_before_launch() {
        let root = tempfile::tempdir().expect("tempdir");
        let src = root.path().join("photos");
        fs::create_dir(&src).expect("mkdir");
        fs::write(src.join("cat.jpg"), b"jpg").expect("write");
        let mut packed = crate::io::archive::pack_dir_as(&src, "photos").expect("pack");
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut packed, &mut data).expect("read archive");
        let (first, rest) = data.split_at(data.len() / 2);
        let tar_input = |chunk: &[u8]| {
            encode_frame(
                FrameHeader::new(FrameId::Input(2))
                    .with_input_name("photos")
                    .with_tar(),
                chunk,
            )
            .expect("input")
        };

        let executor = executor(root.path(), &["adb"]);
        let mut reader = body(&[
            arg(0, "adb"),
            arg(1, "push"),
            tar_input(first),
            tar_input(rest),
            arg(3, "/sdcard/"),
        ]);
        let (invocation, workspace) = receive(&mut reader, &executor, "req5")
            .await
            .expect("receive");

        let dir = workspace.path().join("i2").join("photos");
        assert_eq!(invocation.argv()[1], dir.clone().into_os_string());
        assert_eq!(fs::read(dir.join("cat.jpg")).expect("read"), b"jpg");
    }

    #[tokio::test]
    async fn archive_flag_cannot_change_mid_upload() {
        let root = tempfile::tempdir().expect("tempdir");
        let executor = executor(root.path(), &["adb"]);
        let flagged = encode_frame(
            FrameHeader::new(FrameId::Input(2))
                .with_input_name("photos")
                .with_tar(),
            b"more",
        )
        .expect("input");
        let mut reader = body(&[
            arg(0, "adb"),
            arg(1, "push"),
            input(2, "photos", b"data"),
            flagged,
            arg(3, "/sdcard/"),
        ]);
        let err = receive(&mut reader, &executor, "req6")
            .await
            .expect_err("header change");
        assert!(matches!(err, ProxyError::BadRequest(_)), "{err}");
    }

    #[tokio::test]
    async fn disallowed_command_touches_nothing() {
        let root = tempfile::tempdir().expect("tempdir");
        let executor = executor(root.path(), &["idevice_id"]);
        let mut reader = body(&[
            arg(0, "adb"),
            arg(1, "push"),
            input(2, "secret.bin", b"data"),
            arg(3, "/sdcard/x"),
        ]);

        let err = receive(&mut reader, &executor, "req4")
            .await
            .expect_err("not allowed");
        assert!(matches!(err, ProxyError::CommandNotAllowed(_)));
        assert!(!root.path().join("ws").exists());
    }

    #[tokio::test]
    async fn rejects_out_of_order_frames() {
        let root = tempfile::tempdir().expect("tempdir");
        let executor = executor(root.path(), &["adb"]);
        let mut reader = body(&[arg(0, "adb"), arg(2, "devices")]);
        let err = receive(&mut reader, &executor, "req5")
            .await
            .expect_err("gap");
        assert!(matches!(err, ProxyError::BadRequest(_)));

        let mut reader = body(&[arg(1, "devices")]);
        let err = receive(&mut reader, &executor, "req6")
            .await
            .expect_err("no a0");
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[tokio::test]
    async fn rejects_file_where_grammar_expects_plain() {
        let root = tempfile::tempdir().expect("tempdir");
        let executor = executor(root.path(), &["adb"]);
        let mut reader = body(&[
            arg(0, "adb"),
            arg(1, "shell"),
            input(2, "passwd", b"root:x:0:0"),
        ]);
        let err = receive(&mut reader, &executor, "req7")
            .await
            .expect_err("kind mismatch");
        assert!(matches!(err, ProxyError::BadRequest(_)), "{err}");
    }

    #[tokio::test]
    async fn rejects_plain_where_grammar_expects_file() {
        let root = tempfile::tempdir().expect("tempdir");
        let executor = executor(root.path(), &["adb"]);
        let mut reader = body(&[
            arg(0, "adb"),
            arg(1, "install"),
            arg(2, "/etc/passwd"),
        ]);
        let err = receive(&mut reader, &executor, "req8")
            .await
            .expect_err("kind mismatch");
        assert!(matches!(err, ProxyError::BadRequest(_)), "{err}");
    }

    #[tokio::test]
    async fn truncated_body_is_bad_request() {
        let root = tempfile::tempdir().expect("tempdir");
        let executor = executor(root.path(), &["adb"]);
        let data = [arg(0, "adb"), arg(1, "devices")].concat();
        let mut reader = AsyncFrameReader::new(Cursor::new(data));
        let err = receive(&mut reader, &executor, "req9")
            .await
            .expect_err("no end marker");
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }
}
