use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use kraken_core::{
    Digest, PeerId,
    metainfo::MetaInfo,
    spawn_utils::{BlockingSpawner, spawn},
};
use kraken_scheduler::{
    InMemoryPieceStore, PeerInfo, ReloadableScheduler, Scheduler, SchedulerConfig,
    SchedulerOptions, StaticPeerDiscovery,
};
use size_format::SizeFormatterBinary as SF;
use tracing::{error, error_span, info, trace_span, warn};

const DEFAULT_PIECE_LENGTH: u32 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// The loglevel
    #[arg(value_enum, short = 'v')]
    log_level: Option<LogLevel>,

    /// Set this flag if you want to use tokio's single threaded runtime.
    #[arg(short, long)]
    single_thread_runtime: bool,

    /// How many threads to spawn for the executor.
    #[arg(short = 't', long)]
    worker_threads: Option<usize>,

    #[command(subcommand)]
    subcommand: SubCommand,
}

#[derive(Parser)]
struct ServeOpts {
    /// Files to seed. Their metainfo is printed to stdout as JSON, one per line.
    seed: Vec<PathBuf>,

    /// Where to accept peer connections.
    #[arg(short = 'l', long, default_value = "0.0.0.0:7602")]
    listen_addr: SocketAddr,

    /// Our peer id as hex. Random if not set.
    #[arg(long)]
    peer_id: Option<PeerId>,

    /// JSON scheduler config. Re-read on SIGHUP.
    #[arg(short = 'c', long, env = "KRAKEN_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Piece length for seeded files.
    #[arg(long, default_value_t = DEFAULT_PIECE_LENGTH)]
    piece_length: u32,

    /// A peer to download from, as PEER_ID@HOST:PORT. Can be repeated.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerInfo>,

    /// Metainfo JSON of a blob to download. Can be repeated.
    #[arg(long = "metainfo")]
    metainfo: Vec<PathBuf>,

    /// Download a blob, as DIGEST=DEST. Can be repeated.
    #[arg(long = "download", value_parser = parse_download)]
    downloads: Vec<(Digest, PathBuf)>,

    /// Exit once the downloads finish instead of seeding until interrupted.
    #[arg(short = 'e', long)]
    exit_on_finish: bool,

    /// How often to log torrent stats, e.g. 10s.
    #[arg(long, value_parser = parse_duration::parse, default_value = "10s")]
    stats_interval: Duration,
}

#[derive(Parser)]
struct MetainfoOpts {
    /// Files to describe.
    files: Vec<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_PIECE_LENGTH)]
    piece_length: u32,
}

#[derive(Parser)]
enum SubCommand {
    /// Seed files, download blobs and serve peers until interrupted.
    Serve(ServeOpts),
    /// Print the metainfo JSON of files without serving them.
    Metainfo(MetainfoOpts),
}

fn parse_peer(s: &str) -> anyhow::Result<PeerInfo> {
    let (peer_id, addr) = s
        .split_once('@')
        .context("expected PEER_ID@HOST:PORT")?;
    Ok(PeerInfo {
        peer_id: peer_id.parse().context("invalid peer id")?,
        addr: addr.parse().context("invalid address")?,
        complete: false,
    })
}

fn parse_download(s: &str) -> anyhow::Result<(Digest, PathBuf)> {
    let (digest, dest) = s.split_once('=').context("expected DIGEST=DEST")?;
    Ok((digest.parse().context("invalid digest")?, PathBuf::from(dest)))
}

fn init_logging(opts: &Opts) {
    let default_rust_log = match opts.log_level.as_ref() {
        Some(level) => match level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        },
        None => "info",
    };

    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let stderr_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| EnvFilter::builder().parse(rust_log).ok())
        .unwrap_or_else(|| EnvFilter::new(default_rust_log));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(stderr_filter)
        .init();
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<SchedulerConfig> {
    let Some(path) = path else {
        return Ok(SchedulerConfig::default());
    };
    let buf = tokio::fs::read(path)
        .await
        .with_context(|| format!("error reading {path:?}"))?;
    serde_json::from_slice(&buf).with_context(|| format!("error parsing {path:?}"))
}

async fn read_metainfo(path: &Path) -> anyhow::Result<MetaInfo> {
    let buf = tokio::fs::read(path)
        .await
        .with_context(|| format!("error reading {path:?}"))?;
    serde_json::from_slice(&buf).with_context(|| format!("error parsing {path:?}"))
}

#[cfg(unix)]
fn reload_on_sighup(
    scheduler: Arc<dyn ReloadableScheduler>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hup = signal(SignalKind::hangup()).context("error installing SIGHUP handler")?;
    spawn(error_span!("sighup"), async move {
        while hup.recv().await.is_some() {
            let Some(path) = config_path.as_deref() else {
                warn!("got SIGHUP, but there's no config file to reload");
                continue;
            };
            match load_config(Some(path)).await {
                Ok(config) => scheduler.reload(config),
                Err(e) => warn!("not reloading: {e:#}"),
            }
        }
        Ok(())
    });
    Ok(())
}

#[cfg(not(unix))]
fn reload_on_sighup(
    _scheduler: Arc<dyn ReloadableScheduler>,
    _config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    Ok(())
}

async fn stats_printer(scheduler: Arc<Scheduler>, interval: Duration) -> anyhow::Result<()> {
    loop {
        tokio::time::sleep(interval).await;
        for stats in scheduler.all_stats() {
            info!(
                "[{}] {:?}: {}/{} pieces, fetched {} of {}, peers: {}",
                stats.digest,
                stats.state,
                stats.have_pieces,
                stats.total_pieces,
                SF::new(stats.downloaded_bytes),
                SF::new(stats.length),
                stats.peers.len(),
            );
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let (mut rt_builder, spawner) = match opts.single_thread_runtime {
        true => (
            tokio::runtime::Builder::new_current_thread(),
            BlockingSpawner::new(false),
        ),
        false => (
            {
                let mut b = tokio::runtime::Builder::new_multi_thread();
                if let Some(e) = opts.worker_threads {
                    b.worker_threads(e);
                }
                b
            },
            BlockingSpawner::new(true),
        ),
    };

    let rt = rt_builder.enable_time().enable_io().build()?;

    rt.block_on(async_main(opts, spawner))
}

async fn async_main(opts: Opts, spawner: BlockingSpawner) -> anyhow::Result<()> {
    init_logging(&opts);

    match &opts.subcommand {
        SubCommand::Metainfo(m) => {
            for file in &m.files {
                let blob = tokio::fs::read(file)
                    .await
                    .with_context(|| format!("error reading {file:?}"))?;
                let meta = MetaInfo::from_blob(&blob, m.piece_length)
                    .with_context(|| format!("can't seed {file:?}"))?;
                println!("{}", serde_json::to_string(&meta)?);
            }
            Ok(())
        }
        SubCommand::Serve(serve_opts) => serve(serve_opts, spawner).await,
    }
}

async fn serve(opts: &ServeOpts, spawner: BlockingSpawner) -> anyhow::Result<()> {
    let config = load_config(opts.config.as_deref()).await?;

    let store = Arc::new(InMemoryPieceStore::new());
    for file in &opts.seed {
        let blob = tokio::fs::read(file)
            .await
            .with_context(|| format!("error reading {file:?}"))?;
        let meta = store
            .insert_blob(&blob, opts.piece_length)
            .with_context(|| format!("can't seed {file:?}"))?;
        info!(digest = %meta.digest, ?file, size = %SF::new(meta.length), "seeding");
        println!("{}", serde_json::to_string(&meta)?);
    }

    let discovery = Arc::new(StaticPeerDiscovery::new(opts.peers.clone()));
    for path in &opts.metainfo {
        discovery.add_metainfo(read_metainfo(path).await?);
    }

    let scheduler = Scheduler::new(
        config,
        store,
        discovery,
        SchedulerOptions {
            listen_addr: opts.listen_addr,
            peer_id: opts.peer_id,
            spawner: Some(spawner),
        },
    )
    .await
    .context("error starting scheduler")?;
    info!(
        peer_id = %scheduler.peer_id(),
        listen_addr = %scheduler.listen_addr(),
        "agent started"
    );

    reload_on_sighup(scheduler.clone(), opts.config.clone())?;
    spawn(
        trace_span!("stats_printer"),
        stats_printer(scheduler.clone(), opts.stats_interval),
    );

    let downloads = futures::future::join_all(opts.downloads.iter().map(|(digest, dest)| {
        let scheduler = scheduler.clone();
        async move {
            match scheduler.download(*digest, dest).await {
                Ok(()) => {
                    info!(%digest, ?dest, "downloaded");
                    true
                }
                Err(e) => {
                    error!(%digest, ?dest, "download failed: {e:#}");
                    false
                }
            }
        }
    }));
    tokio::pin!(downloads);

    let mut downloads_done = opts.downloads.is_empty();
    let mut failed = 0;
    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r.context("error waiting for ctrl-c")?;
                info!("interrupted, stopping");
                break;
            }
            results = &mut downloads, if !downloads_done => {
                downloads_done = true;
                failed = results.iter().filter(|ok| !**ok).count();
                if opts.exit_on_finish {
                    break;
                }
            }
        }
    }

    scheduler.stop().await;
    if failed > 0 {
        bail!("{failed} downloads failed")
    }
    Ok(())
}
