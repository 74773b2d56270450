use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::Parser;
use cyclone::config::{read_config_file, LogConfig};
use cyclone::supervisor;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(name = "cyclone", version, about = "Threshold evaluation alarming engine")]
struct Args {
    /// Configuration file location
    #[arg(long, default_value = "cyclone.conf")]
    config: String,
}

/// Logfile writer that can be reopened in place, so external logrotate can
/// move the file and signal USR2.
#[derive(Clone)]
struct ReopenableFile {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
}

impl ReopenableFile {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn reopen(&self) {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(new_file) => {
                if let Ok(mut guard) = self.file.lock() {
                    *guard = new_file;
                }
            }
            Err(err) => eprintln!("failed to reopen logfile {}: {err}", self.path.display()),
        }
    }
}

impl Write for ReopenableFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.lock() {
            Ok(mut guard) => guard.write(buf),
            Err(_) => Err(std::io::Error::other("logfile lock poisoned")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.lock() {
            Ok(mut guard) => guard.flush(),
            Err(_) => Err(std::io::Error::other("logfile lock poisoned")),
        }
    }
}

impl<'a> MakeWriter<'a> for ReopenableFile {
    type Writer = ReopenableFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let level = if config.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let targets = filter::Targets::new()
        .with_target("cyclone", level)
        // the stats snapshot stays visible at the default level
        .with_target("cyclone::stats", LevelFilter::INFO);

    if config.path.is_empty() {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .with(targets)
            .init();
        return Ok(());
    }

    let logfile = PathBuf::from(&config.path).join(&config.file);
    let writer = ReopenableFile::open(&logfile)?;

    if config.rotate_on_usr2 {
        let rotate_writer = writer.clone();
        let mut usr2 =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined2())?;
        tokio::spawn(async move {
            while usr2.recv().await.is_some() {
                rotate_writer.reopen();
            }
        });
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(writer).compact())
        .with(targets)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = read_config_file(&args.config)?;
    init_logging(&config.log)?;

    trace!("started with args: {args:?}");
    info!("starting CYCLONE");

    if let Err(err) = supervisor::run(config).await {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }

    Ok(())
}
