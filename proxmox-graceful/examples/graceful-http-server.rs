//! A small HTTP server which can be upgraded without dropping connections.
//!
//! Start it, then `kill -USR2 <pid>` replaces the process by a fresh instance serving on the same
//! socket, `kill -TERM <pid>` stops it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{format_err, Error};
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};

use proxmox_graceful::http::HttpHandler;
use proxmox_graceful::{ServerConfig, ServerProcess};
use proxmox_graceful_log::{LevelFilter, Logger};

#[derive(Parser, Debug)]
#[command(about = "HTTP server with graceful restart on SIGUSR2")]
struct Args {
    /// Address to listen on, ':8080' listens on all IPv4 interfaces.
    #[arg(short, long)]
    address: Option<String>,

    /// Seconds to wait for open connections on shutdown.
    #[arg(long)]
    shutdown_timeout: Option<f64>,

    /// JSON configuration file, command line options take precedence.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Set on a reloaded instance, the listening socket is inherited as file descriptor 3.
    #[arg(long, hide = true)]
    graceful: bool,
}

fn load_config(args: &Args) -> Result<ServerConfig, Error> {
    let mut config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .map_err(|err| format_err!("unable to read {path:?} - {err}"))?;
            ServerConfig::from_json(&data)
                .map_err(|err| format_err!("unable to parse {path:?} - {err}"))?
        }
        None => ServerConfig::default(),
    };

    if let Some(address) = &args.address {
        config.address = address.clone();
    }
    if let Some(timeout) = args.shutdown_timeout {
        config.shutdown_timeout = Duration::try_from_secs_f64(timeout)?;
    }

    Ok(config)
}

async fn hello(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Error> {
    let body = format!("{} {} served by pid {}\n", req.method(), req.uri(), std::process::id());
    Ok(Response::new(Full::new(Bytes::from(body))))
}

async fn run(config: ServerConfig, inherited: bool) -> Result<(), Error> {
    let server = ServerProcess::new(config, HttpHandler::new(hello)).graceful(inherited);
    server.run().await?;

    log::info!("done - exit server");
    Ok(())
}

fn main() -> Result<(), Error> {
    Logger::from_env("GRACEFUL_LOG", LevelFilter::INFO)
        .stderr_with_pid()
        .init()?;

    let args = Args::parse();
    let config = load_config(&args)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, args.graceful))
}
