//! labproxy-server - runs allow-listed device tools for remote `labproxy` clients.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use labproxy::io::config::load_config;
use labproxy_server::{AppState, router};
use tracing::info;

#[derive(Parser)]
#[command(name = "labproxy-server")]
#[command(about = "Serve lab device tools (adb, idevice*) to remote labproxy clients")]
struct Args {
    /// Configuration file (TOML). Defaults apply when it does not exist.
    #[arg(long, default_value = "labproxy-server.toml")]
    config: PathBuf,

    /// Address to bind the server to (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Directory containing the device tools (overrides the config file)
    #[arg(long, env = "LABPROXY_TOOL_DIR")]
    tool_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("labproxy_server=info".parse()?)
                .add_directive("labproxy=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(tool_dir) = args.tool_dir {
        config.tool_dir = Some(tool_dir);
    }
    config.validate()?;

    let addr = config.listen_addr();
    info!(
        config = %args.config.display(),
        workspace_root = %config.workspace_root().display(),
        commands = ?config.commands.keys().collect::<Vec<_>>(),
        "starting labproxy-server"
    );

    let app = router(AppState::new(config));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
