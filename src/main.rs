use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use speedprobe::client::HttpClient;
use speedprobe::config::Settings;
use speedprobe::context::ProbeContext;
use speedprobe::error::ProbeError;
use speedprobe::geo::Kilometers;
use speedprobe::latency::{rank_by_average_latency, rank_by_distance};
use speedprobe::report::SpeedPrinter;
use speedprobe::sources::fast::{self, FastProvider};
use speedprobe::sources::speedtest::{self, ClientConfig, SpeedtestDirectory};
use speedprobe::traits::{ServerDirectory, TargetProvider, TransferClient};
use speedprobe::types::{Server, ServerId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "speedprobe")]
#[command(
    about = "Measure download and upload bandwidth against public speed test servers",
    long_about = None
)]
struct Cli {
    /// More log output on stderr (-v, -vv, -vvv). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file (defaults to <config dir>/speedprobe/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// Report bytes per second instead of bits per second
    #[arg(long)]
    bytes: bool,

    /// Seconds allowed for loading the source's configuration
    #[arg(long, value_name = "SECS")]
    config_timeout: Option<u64>,

    /// Seconds allowed for the download phase
    #[arg(long, value_name = "SECS")]
    download_timeout: Option<u64>,

    /// Seconds allowed for the upload phase
    #[arg(long, value_name = "SECS")]
    upload_timeout: Option<u64>,
}

impl CommonArgs {
    fn apply(&self, settings: &mut Settings) {
        settings.show_bytes |= self.bytes;
        if let Some(t) = self.config_timeout {
            settings.config_timeout_secs = t;
        }
        if let Some(t) = self.download_timeout {
            settings.download_timeout_secs = t;
        }
        if let Some(t) = self.upload_timeout {
            settings.upload_timeout_secs = t;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Test against the best nearby speedtest.net server
    #[command(visible_aliases = ["st", "speedtest.net"])]
    Speedtest {
        #[command(flatten)]
        common: CommonArgs,

        /// List all servers and exit
        #[arg(long)]
        list: bool,

        /// Use this server id instead of picking the fastest
        #[arg(long, value_name = "ID")]
        server: Option<ServerId>,

        /// Never use this server id (repeatable)
        #[arg(long = "block", value_name = "ID")]
        blocked: Vec<ServerId>,

        /// Seconds allowed for latency-based server selection
        #[arg(long, value_name = "SECS")]
        ping_timeout: Option<u64>,

        /// Latency samples per server
        #[arg(long)]
        samples: Option<usize>,
    },
    /// Test against fast.com CDN targets
    #[command(visible_aliases = ["f", "fast.com"])]
    Fast {
        #[command(flatten)]
        common: CommonArgs,

        /// Number of CDN targets to request from the manifest
        #[arg(long)]
        urls: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load settings")?;

    match cli.command {
        Commands::Speedtest {
            common,
            list,
            server,
            blocked,
            ping_timeout,
            samples,
        } => {
            common.apply(&mut settings);
            settings.blocked_servers.extend(blocked);
            if let Some(t) = ping_timeout {
                settings.ping_timeout_secs = t;
            }
            if let Some(n) = samples {
                settings.latency_samples = n;
            }
            handle_speedtest(&settings, list, server).await?
        }
        Commands::Fast { common, urls } => {
            common.apply(&mut settings);
            if let Some(n) = urls {
                settings.fast_url_count = n;
            }
            handle_fast(&settings).await?
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("speedprobe={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_client(settings: &Settings) -> Result<Arc<dyn TransferClient>> {
    let client =
        HttpClient::new(settings.request_timeout()).context("Failed to build HTTP client")?;
    Ok(Arc::new(client))
}

// --- Handlers ---

async fn handle_speedtest(
    settings: &Settings,
    list: bool,
    server_id: Option<ServerId>,
) -> Result<()> {
    if settings.latency_samples == 0 {
        bail!("At least one latency sample is required.");
    }

    let client = build_client(settings)?;
    let root = ProbeContext::background();

    if list {
        let ctx = root.with_timeout(settings.config_timeout());
        for server in list_servers(&ctx, &client, settings).await? {
            println!("{}", server);
        }
        return Ok(());
    }

    let ctx = root.with_timeout(settings.config_timeout());
    let cfg = speedtest::fetch_client_config(&ctx, client.as_ref())
        .await
        .context("Error loading speedtest.net configuration")?;
    println!("Testing from {} ({})...", cfg.isp, cfg.ip);
    let servers = list_servers(&ctx, &client, settings).await?;

    let server =
        select_server(&root, client.as_ref(), &cfg, servers, server_id, settings).await?;

    let ctx = root.with_timeout(settings.download_timeout());
    let (printer, sink) = SpeedPrinter::start("Download", settings.show_bytes);
    let res =
        speedtest::probe_download_speed(&server, &ctx, Arc::clone(&client), Some(sink)).await;
    printer.finish(res).await.context("Error probing download speed")?;

    let ctx = root.with_timeout(settings.upload_timeout());
    let (printer, sink) = SpeedPrinter::start("Upload", settings.show_bytes);
    let res =
        speedtest::probe_upload_speed(&server, &ctx, Arc::clone(&client), Some(sink)).await;
    printer.finish(res).await.context("Error probing upload speed")?;

    Ok(())
}

/// Loads the directory and drops blocked servers.
async fn list_servers(
    ctx: &ProbeContext,
    client: &Arc<dyn TransferClient>,
    settings: &Settings,
) -> Result<Vec<Server>> {
    let directory = SpeedtestDirectory::new(Arc::clone(client));
    let mut servers = directory
        .load_all_servers(ctx)
        .await
        .context("Failed to load server list")?;

    if !settings.blocked_servers.is_empty() {
        servers.retain(|s| !settings.blocked_servers.contains(&s.id));
    }
    if servers.is_empty() {
        bail!("No servers found.");
    }
    Ok(servers)
}

/// Picks the requested server, or the lowest-latency one among the nearest
/// few.
async fn select_server(
    root: &ProbeContext,
    client: &dyn TransferClient,
    cfg: &ClientConfig,
    mut servers: Vec<Server>,
    server_id: Option<ServerId>,
    settings: &Settings,
) -> Result<Server> {
    let ctx = root.with_timeout(settings.ping_timeout());
    let samples = settings.latency_samples;

    let (server, latency, distance): (Server, Duration, Kilometers) = match server_id {
        Some(id) => {
            let server = servers
                .into_iter()
                .find(|s| s.id == id)
                .ok_or(ProbeError::ServerNotFound(id))?;
            let latency = server
                .average_latency(&ctx, client, samples)
                .await
                .with_context(|| format!("Error getting latency for ({})", server))?;
            let distance = cfg.coordinates.distance_to(&server.coordinates);
            (server, latency, distance)
        }
        None => {
            let distances = rank_by_distance(&mut servers, &cfg.coordinates);
            // Only the nearest few are worth the latency probes.
            servers.truncate(settings.closest_servers.max(1));

            let latencies = rank_by_average_latency(&mut servers, &ctx, client, samples)
                .await
                .into_result()
                .context("Error getting server latencies")?;

            let server = servers.swap_remove(0);
            let latency = latencies[&server.id];
            let distance = distances[&server.id];
            (server, latency, distance)
        }
    };

    println!(
        "Using server {} hosted by {} ({}) [{}]: {:.1} ms",
        server.id,
        server.sponsor,
        server.name,
        distance,
        latency.as_secs_f64() * 1000.0
    );

    Ok(server)
}

async fn handle_fast(settings: &Settings) -> Result<()> {
    if settings.fast_url_count == 0 {
        bail!("At least one fast.com target is required.");
    }

    let client = build_client(settings)?;
    let root = ProbeContext::background();

    let ctx = root.with_timeout(settings.config_timeout());
    let provider = FastProvider::new(Arc::clone(&client), settings.fast_url_count);
    let targets = provider
        .targets(&ctx)
        .await
        .context("Error loading fast.com configuration")?;
    println!("Testing against {} fast.com targets...", targets.len());

    let ctx = root.with_timeout(settings.download_timeout());
    let (printer, sink) = SpeedPrinter::start("Download", settings.show_bytes);
    let res =
        fast::probe_download_speed(&targets, &ctx, Arc::clone(&client), Some(sink)).await;
    printer.finish(res).await.context("Error probing download speed")?;

    let ctx = root.with_timeout(settings.upload_timeout());
    let (printer, sink) = SpeedPrinter::start("Upload", settings.show_bytes);
    let res = fast::probe_upload_speed(&targets, &ctx, Arc::clone(&client), Some(sink)).await;
    printer.finish(res).await.context("Error probing upload speed")?;

    Ok(())
}
