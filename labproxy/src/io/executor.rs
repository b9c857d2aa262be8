//! Launching allow-listed device tools and relaying their output.
//!
//! A command moves through `authorize` (before any workspace exists),
//! `launch` (spawn, which may fail with `ChildLaunchFailed` while the server
//! can still answer with an error status), `RunningCommand::relay` (stdout and
//! stderr chunks forwarded as they arrive) and `send_outputs` (produced files,
//! directories packed as tar archives, or a missing marker for each).

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::frame::{FrameError, FrameHeader, FrameId, MAX_FRAME_LEN};
use crate::core::registry::{self, CommandSpec};
use crate::core::types::Placeholder;
use crate::error::ProxyError;
use crate::io::archive;
use crate::io::config::ServerConfig;
use crate::io::frame_io::encode_frame;
use crate::io::intake::Invocation;
use crate::io::workspace::{Produced, Workspace};

/// Pause after the child exits before giving up on pipes still held open by
/// a process it left behind (`adb` forks its daemon this way).
const PIPE_GRACE: Duration = Duration::from_millis(250);

/// One piece of the response body, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// A chunk of a produced output file, or of a tar archive of a produced
    /// directory.
    Output {
        placeholder: Placeholder,
        name: String,
        archive: bool,
        data: Vec<u8>,
    },
    /// The command did not produce this output.
    OutputMissing { placeholder: Placeholder, name: String },
    Exit(i32),
}

impl ResponseEvent {
    /// Encode as a single response frame.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            ResponseEvent::Stdout(data) => encode_frame(FrameHeader::new(FrameId::Stdout), data),
            ResponseEvent::Stderr(data) => encode_frame(FrameHeader::new(FrameId::Stderr), data),
            ResponseEvent::Output {
                placeholder,
                name,
                archive,
                data,
            } => {
                let header =
                    FrameHeader::new((*placeholder).into()).with_output_name(name.as_str());
                encode_frame(if *archive { header.with_tar() } else { header }, data)
            }
            ResponseEvent::OutputMissing { placeholder, name } => encode_frame(
                FrameHeader::new((*placeholder).into())
                    .with_output_name(name.as_str())
                    .with_missing(),
                &[],
            ),
            ResponseEvent::Exit(code) => {
                encode_frame(FrameHeader::new(FrameId::Exit), code.to_string().as_bytes())
            }
        }
    }
}

/// How the relay phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The command exited on its own with this code (negative: killed by signal).
    Exited(i32),
    /// The command exceeded the configured timeout and was killed.
    TimedOut(i32),
    /// The client went away; the command was killed.
    Disconnected,
}

/// The receiving side of the response went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// Authorizes and launches commands according to the server configuration.
#[derive(Debug, Clone)]
pub struct Executor {
    config: Arc<ServerConfig>,
}

impl Executor {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Check that `name` is both a proxied command and allowed on this server.
    pub fn authorize(&self, name: &str) -> Result<&'static CommandSpec, ProxyError> {
        match registry::lookup(name) {
            Some(spec) if self.config.is_allowed(name) => Ok(spec),
            _ => {
                warn!(command = name, "rejecting command");
                Err(ProxyError::CommandNotAllowed(name.to_string()))
            }
        }
    }

    /// Spawn the command. Failure here means no process ever ran.
    #[instrument(skip_all, fields(command = invocation.command()))]
    pub fn launch(
        &self,
        invocation: &Invocation,
        workspace: &Workspace,
    ) -> Result<RunningCommand, ProxyError> {
        let program = self.config.executable(invocation.command());
        let mut cmd = Command::new(&program);
        cmd.args(invocation.argv())
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %program.display(), "spawning child process");
        let mut child = cmd.spawn().map_err(|err| {
            error!(program = %program.display(), err = %err, "failed to spawn command");
            ProxyError::ChildLaunchFailed {
                command: invocation.command().to_string(),
                reason: err.to_string(),
            }
        })?;

        let missing_pipe = |pipe: &str| ProxyError::ChildLaunchFailed {
            command: invocation.command().to_string(),
            reason: format!("{pipe} was not piped"),
        };
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        info!(pid = ?child.id(), "command launched");
        Ok(RunningCommand {
            child,
            stdout,
            stderr,
            timeout: self.config.command_timeout(),
        })
    }
}

/// A launched child process whose output has not been relayed yet.
#[derive(Debug)]
pub struct RunningCommand {
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    timeout: Option<Duration>,
}

impl RunningCommand {
    /// Forward stdout and stderr into `sink` as they arrive, then wait for the
    /// process.
    ///
    /// If the sink closes (client disconnect) the child is killed. If a
    /// timeout is configured and exceeded the child is killed and a note is
    /// sent on stderr.
    pub async fn relay(self, sink: &mpsc::Sender<ResponseEvent>) -> Result<Completion, ProxyError> {
        let RunningCommand {
            mut child,
            mut stdout,
            mut stderr,
            timeout,
        } = self;

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut out_buf = vec![0u8; MAX_FRAME_LEN];
        let mut err_buf = vec![0u8; MAX_FRAME_LEN];
        let mut out_open = true;
        let mut err_open = true;
        let mut status: Option<ExitStatus> = None;
        let mut timed_out = false;

        loop {
            if status.is_some() && !out_open && !err_open {
                break;
            }
            tokio::select! {
                biased;
                _ = sink.closed() => {
                    warn!("client disconnected, killing command");
                    kill(&mut child).await;
                    return Ok(Completion::Disconnected);
                }
                _ = &mut deadline, if status.is_none() && !timed_out => {
                    warn!(timeout_secs = timeout.map(|t| t.as_secs()), "command timed out, killing");
                    timed_out = true;
                    status = kill(&mut child).await;
                    if status.is_none() {
                        break;
                    }
                }
                read = read_chunk(&mut stdout, &mut out_buf), if out_open => match read {
                    Some(data) => {
                        if sink.send(ResponseEvent::Stdout(data)).await.is_err() {
                            kill(&mut child).await;
                            return Ok(Completion::Disconnected);
                        }
                    }
                    None => out_open = false,
                },
                read = read_chunk(&mut stderr, &mut err_buf), if err_open => match read {
                    Some(data) => {
                        if sink.send(ResponseEvent::Stderr(data)).await.is_err() {
                            kill(&mut child).await;
                            return Ok(Completion::Disconnected);
                        }
                    }
                    None => err_open = false,
                },
                waited = child.wait(), if status.is_none() => {
                    status = Some(waited?);
                }
                _ = tokio::time::sleep(PIPE_GRACE), if status.is_some() => {
                    debug!("pipes still open after exit, leaving them");
                    break;
                }
            }
        }

        let code = status.map(exit_code).unwrap_or(-1);
        if timed_out {
            let limit = timeout.map(|t| t.as_secs()).unwrap_or_default();
            let note = format!("labproxy-server: command timed out after {limit}s\n");
            if sink
                .send(ResponseEvent::Stderr(note.into_bytes()))
                .await
                .is_err()
            {
                return Ok(Completion::Disconnected);
            }
            return Ok(Completion::TimedOut(code));
        }
        debug!(exit_code = code, "command finished");
        Ok(Completion::Exited(code))
    }
}

/// Send every output the invocation declared: its content in frame-sized
/// chunks, or a missing marker.
///
/// An output that cannot be read is reported missing, with a note on stderr;
/// the client discards whatever part of it had already arrived.
pub async fn send_outputs(
    invocation: &Invocation,
    workspace: &Workspace,
    sink: &mpsc::Sender<ResponseEvent>,
) -> Result<(), Disconnected> {
    for (placeholder, name) in invocation.outputs() {
        let sent = match workspace.collect(placeholder) {
            Some(Produced::File(path)) => match tokio::fs::File::open(&path).await {
                Ok(file) => send_file(file, placeholder, name, false, sink).await,
                Err(err) => Err(SendFileError::Read(err)),
            },
            Some(Produced::Directory(path)) => match pack(path).await {
                Ok(file) => send_file(file, placeholder, name, true, sink).await,
                Err(err) => Err(SendFileError::Read(err)),
            },
            None => {
                debug!(%placeholder, "output missing");
                send_missing(placeholder, name, sink).await?;
                continue;
            }
        };
        match sent {
            Ok(()) => {}
            Err(SendFileError::Disconnected) => return Err(Disconnected),
            Err(SendFileError::Read(err)) => {
                warn!(%placeholder, err = %err, "could not read output");
                let note = format!("labproxy-server: could not send output {name}: {err}\n");
                sink.send(ResponseEvent::Stderr(note.into_bytes()))
                    .await
                    .map_err(|_| Disconnected)?;
                send_missing(placeholder, name, sink).await?;
            }
        }
    }
    Ok(())
}

async fn send_missing(
    placeholder: Placeholder,
    name: &str,
    sink: &mpsc::Sender<ResponseEvent>,
) -> Result<(), Disconnected> {
    sink.send(ResponseEvent::OutputMissing {
        placeholder,
        name: name.to_string(),
    })
    .await
    .map_err(|_| Disconnected)
}

/// Pack a produced directory into an anonymous temporary archive.
async fn pack(dir: std::path::PathBuf) -> std::io::Result<tokio::fs::File> {
    let file = tokio::task::spawn_blocking(move || archive::pack_contents(&dir))
        .await
        .map_err(std::io::Error::other)??;
    Ok(tokio::fs::File::from_std(file))
}

enum SendFileError {
    Disconnected,
    Read(std::io::Error),
}

async fn send_file(
    mut file: tokio::fs::File,
    placeholder: Placeholder,
    name: &str,
    archive: bool,
    sink: &mpsc::Sender<ResponseEvent>,
) -> Result<(), SendFileError> {
    let mut sent_any = false;
    loop {
        let mut data = Vec::with_capacity(MAX_FRAME_LEN);
        (&mut file)
            .take(MAX_FRAME_LEN as u64)
            .read_to_end(&mut data)
            .await
            .map_err(SendFileError::Read)?;
        if data.is_empty() && sent_any {
            return Ok(());
        }
        let last = data.len() < MAX_FRAME_LEN;
        sink.send(ResponseEvent::Output {
            placeholder,
            name: name.to_string(),
            archive,
            data,
        })
        .await
        .map_err(|_| SendFileError::Disconnected)?;
        sent_any = true;
        if last {
            return Ok(());
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Option<Vec<u8>> {
    match reader.read(buf).await {
        Ok(0) => None,
        Ok(n) => Some(buf[..n].to_vec()),
        Err(err) => {
            warn!(err = %err, "reading child output failed");
            None
        }
    }
}

async fn kill(child: &mut Child) -> Option<ExitStatus> {
    if let Err(err) = child.start_kill() {
        debug!(err = %err, "kill failed, child already exited");
    }
    child.wait().await.ok()
}

/// Exit code as a shell reports it, with signals as negative numbers.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
