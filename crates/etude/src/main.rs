// src/main.rs
use clap::Parser;
use etude::{ConfigFile, EtudeResult, Server, ServerConfig, logging};
use mimalloc::MiMalloc;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Static file server with a CGI gateway.
#[derive(Parser, Debug)]
#[command(name = "etude", version, about)]
struct Cli {
    /// Configuration file. Defaults to `<exe dir>/../etc/etude.toml`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Document root. Overrides `server.doc_root`; defaults to `<exe dir>/../www`.
    #[arg(long)]
    root: Option<PathBuf>,
}

fn main() -> ExitCode {
    logging::init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> EtudeResult<()> {
    let exe = std::env::current_exe()?;
    let exe_dir = exe.parent().unwrap_or(Path::new("."));

    let config_path = cli
        .config
        .unwrap_or_else(|| exe_dir.join("../etc/etude.toml"));
    let default_root = exe_dir.join("../www");

    let file = ConfigFile::load(&config_path)?;
    let mut config = ServerConfig::from_file(&file, &default_root)?;
    if let Some(root) = cli.root {
        config = config.doc_root(root);
    }

    let server = Server::bind(&config)?;
    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received termination signal, shutting down");
        handle.shutdown();
    })
    .map_err(io::Error::other)?;

    server.run()?;
    Ok(())
}
