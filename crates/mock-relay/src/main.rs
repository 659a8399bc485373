//! Standalone mock relay binary.
//!
//! Prints the listening ws:// URL to stdout on start; everything else
//! (logs, periodic statistics) goes to stderr.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use mock_relay::{MockRelay, MockRelayConfig, RelayInformation};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mock-relay", about = "In-process Nostr relay for tests")]
struct Args {
    /// Port to listen on; 0 auto-assigns
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// JSONL seed file, one event per line
    #[arg(long)]
    seed: Option<PathBuf>,

    /// NIP-11 relay name
    #[arg(long, default_value = "MockRelay")]
    name: String,

    /// NIP-11 relay description
    #[arg(long)]
    desc: Option<String>,

    /// Delay before each response batch, in milliseconds
    #[arg(long)]
    delay: Option<u64>,

    /// Cap on events returned per REQ
    #[arg(long)]
    max_events: Option<usize>,

    /// Verify Schnorr signatures before accepting publishes
    #[arg(long)]
    validate_sig: bool,

    /// Do not send EOSE after stored results
    #[arg(long)]
    no_eose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let bind_addr: SocketAddr = match format!("{}:{}", args.bind, args.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid bind address {}:{}: {e}", args.bind, args.port);
            return ExitCode::from(1);
        }
    };

    let mut info = RelayInformation::named(args.name);
    if args.desc.is_some() {
        info.description = args.desc;
    }
    let config = MockRelayConfig {
        bind_addr,
        auto_eose: !args.no_eose,
        validate_signatures: args.validate_sig,
        response_delay: args.delay.map(Duration::from_millis),
        max_events_per_req: args.max_events,
        auth_challenge: None,
        info,
    };

    let relay = match MockRelay::start(config).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(1);
        }
    };

    if let Some(path) = &args.seed {
        match relay.seed_file(path).await {
            Ok(count) => info!("seeded {count} events from {}", path.display()),
            Err(e) => {
                error!("seeding from {} failed: {e}", path.display());
                return ExitCode::from(1);
            }
        }
    }

    // The one line tests scrape off stdout.
    println!("{}", relay.url());

    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = relay.stats();
                info!(
                    "stats: seeded={} matched={} published={} req={} close={} connections={}",
                    stats.seeded,
                    stats.matched,
                    stats.published,
                    stats.req_count,
                    stats.close_count,
                    stats.connections,
                );
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("signal handler failed: {e}");
                    return ExitCode::from(1);
                }
                info!("shutting down");
                relay.shutdown();
                return ExitCode::SUCCESS;
            }
        }
    }
}
