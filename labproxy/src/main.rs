//! `labproxy`: run a device tool on the lab host as if it were installed here.
//!
//! ```text
//! labproxy --url http://mylab:8084 adb -s emulator-5554 install app.apk
//! ```
//!
//! Symlinking this binary under a supported tool's name (`ln -s labproxy adb`)
//! makes the symlink behave like the tool itself, with the server taken from
//! `LAB_DEVICE_PROXY_URL`.

use std::ffi::OsString;
use std::io;
use std::path::Path;

use clap::Parser;
use labproxy::client::{ProxyClient, URL_ENV};
use labproxy::core::registry;
use labproxy::marshal::marshal;
use labproxy::{ProxyError, exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "labproxy",
    version,
    about = "Run a lab device command (adb, idevice*) on a remote proxy server"
)]
struct Cli {
    /// Proxy server URL, e.g. `http://mylab:8084`.
    #[arg(long, env = URL_ENV)]
    url: Option<String>,

    /// Command to run remotely, followed by its arguments.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    command: Vec<String>,
}

fn main() {
    logging::init();
    let code = match run(std::env::args_os().collect()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("labproxy: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(args: Vec<OsString>) -> Result<i32, ProxyError> {
    let (url, command) = match invoked_as(&args) {
        Some(name) => {
            let mut command = vec![name];
            command.extend(utf8_args(&args[1..])?);
            (std::env::var(URL_ENV).ok(), command)
        }
        None => match Cli::try_parse_from(&args) {
            Ok(cli) => (cli.url, cli.command),
            Err(err) => {
                let code = if err.use_stderr() {
                    exit_codes::USAGE
                } else {
                    0
                };
                let _ = err.print();
                return Ok(code);
            }
        },
    };

    let url = url.filter(|url| !url.trim().is_empty()).ok_or_else(|| {
        ProxyError::Usage(format!(
            "no proxy server given; pass --url or set {URL_ENV}"
        ))
    })?;

    let request = marshal(&command)?;
    let client = ProxyClient::new(&url)?;
    let outcome = client.run(request, io::stdout().lock(), io::stderr().lock())?;
    for path in &outcome.missing {
        eprintln!(
            "labproxy: {}: not produced by the remote command",
            path.display()
        );
    }
    Ok(exit_codes::from_remote(outcome.exit_code))
}

/// The tool name when this binary runs through a symlink named after one.
fn invoked_as(args: &[OsString]) -> Option<String> {
    let name = Path::new(args.first()?).file_name()?.to_str()?;
    registry::lookup(name).map(|spec| spec.name.to_string())
}

fn utf8_args(args: &[OsString]) -> Result<Vec<String>, ProxyError> {
    args.iter()
        .map(|arg| {
            arg.clone().into_string().map_err(|arg| {
                ProxyError::Usage(format!("argument {arg:?} is not valid UTF-8"))
            })
        })
        .collect()
}
