use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Arg, ArgMatches, Command};
use tokio::runtime::{self, Runtime};

use crate::logging;

const MIN_WORKER_THREADS: usize = 6;

/// A long-running MIFS service.
///
/// `start` must return once the service is up; the process then waits for a shutdown signal
/// and calls `stop`.
#[async_trait]
pub trait Daemon {
    type Config;

    fn load_config(&self, path: &Option<PathBuf>) -> Result<Self::Config>;

    async fn start(&mut self, cfg: Self::Config) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
}

struct Args {
    config: Option<PathBuf>,
    log_config: Option<PathBuf>,
}

impl Args {
    fn command(name: &str, about: &str, version: &str) -> ArgMatches {
        Command::new(name)
            .version(version)
            .about(about)
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("cfg")
                    .value_name("FILE")
                    .help("Daemon config file, layered over the defaults")
                    .takes_value(true),
            )
            .arg(
                Arg::new("log_config")
                    .short('l')
                    .long("log")
                    .value_name("FILE")
                    .help("Logging config file")
                    .takes_value(true),
            )
            .get_matches()
    }

    fn parse(name: &str, about: &str, version: &str) -> Self {
        let matches = Self::command(name, about, version);
        Self {
            config: matches.value_of("config").map(PathBuf::from),
            log_config: matches.value_of("log_config").map(PathBuf::from),
        }
    }
}

fn build_runtime(name: &str) -> Result<Runtime> {
    let threads = num_cpus::get().max(MIN_WORKER_THREADS);
    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(threads)
        .thread_name(format!("{}-worker", name))
        .build()?;
    Ok(rt)
}

/// Resolves on ctrl-c, or on SIGTERM where there is one.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

async fn serve<D: Daemon>(name: &str, args: Args, mut daemon: D) -> Result<()> {
    // The span exporter needs a running reactor, so logging starts in here.
    logging::init_logger(name, &args.log_config)?;

    let cfg = daemon.load_config(&args.config)?;
    daemon.start(cfg).await?;
    tracing::info!("{} is up", name);

    shutdown_signal().await?;
    tracing::info!("shutdown requested");
    let stopped = daemon.stop().await;

    logging::shutdown();
    stopped
}

pub struct DaemonProcess;

impl DaemonProcess {
    /// Parses the command line, runs `daemon` until a shutdown signal and exits the process with
    /// a non-zero code if anything along the way failed.
    pub fn start<D: Daemon>(name: &str, about: &str, version: &str, daemon: D) {
        let args = Args::parse(name, about, version);

        let outcome = build_runtime(name).and_then(|rt| rt.block_on(serve(name, args, daemon)));
        if let Err(e) = outcome {
            tracing::error!("fatal: {:?}", e);
            eprintln!("fatal: {:?}", e);
            std::process::exit(1);
        }
    }
}
