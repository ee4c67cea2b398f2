//! relay-compass - find the lowest-latency Mullvad VPN relays from where
//! you are.
//!
//! This is the command-line interface for the relay-compass library.

use anyhow::{bail, Context, Result};
use clap::Parser;
use relay_compass::api::{ApiClient, ApiError, UserLocation};
use relay_compass::relays::{AntiCensorship, IpVersion, Location, LocationFilter};
use relay_compass::{distance, format, relays, vlog};
use relay_compass::{scan_locations, ScanConfig, ScanError};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Search radius used when no explicit distance is given, and the step by
/// which best-server mode widens it.
const RANGE_STEP_KM: f64 = 500.0;
const MAX_RANGE_KM: f64 = 20000.0;

/// Get the version string for relay-compass
fn get_version() -> &'static str {
    if cfg!(debug_assertions) {
        concat!(env!("CARGO_PKG_VERSION"), "-UNRELEASED")
    } else {
        env!("CARGO_PKG_VERSION")
    }
}

/// Command-line arguments.
///
/// Running without any filter option enters best-server mode: the search
/// radius grows in 500 km steps until relays are found, and only the
/// fastest one is printed. Any filter option switches to table mode.
#[derive(Parser, Debug)]
#[clap(
    version = get_version(),
    about = "Find Mullvad VPN servers with the lowest latency at your current location",
    long_about = None
)]
struct Args {
    /// Maximum distance in km from your location (table mode)
    #[clap(short = 'm', long, value_parser = parse_max_distance)]
    max_distance: Option<f64>,

    /// Filter servers by anti-censorship type (table mode)
    #[clap(short = 'a', long, value_enum)]
    anti_censorship: Option<AntiCensorshipArg>,

    /// Only servers with DAITA enabled (table mode)
    #[clap(short = 'd', long)]
    daita: bool,

    /// Use IPv6 addresses for pinging (table mode)
    #[clap(short = '6', long)]
    ipv6: bool,

    /// Ping timeout in milliseconds
    #[clap(short = 't', long, default_value_t = 500,
           value_parser = clap::value_parser!(u64).range(100..=5000))]
    timeout: u64,

    /// Number of concurrent ping workers
    #[clap(short = 'w', long, default_value_t = 25,
           value_parser = clap::value_parser!(u64).range(1..=200))]
    workers: u64,

    /// Path to relays.json (auto-detected if not specified)
    #[clap(short = 'r', long)]
    relays_file: Option<PathBuf>,

    /// Enable verbose output (repeat for more detail)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    /// Any filter option switches from best-server mode to table mode.
    fn table_mode(&self) -> bool {
        self.max_distance.is_some() || self.anti_censorship.is_some() || self.daita || self.ipv6
    }

    fn ip_version(&self) -> IpVersion {
        if self.ipv6 {
            IpVersion::V6
        } else {
            IpVersion::V4
        }
    }

    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            ip_version: self.ip_version(),
            timeout: Duration::from_millis(self.timeout),
            workers: self.workers as usize,
            verbose: self.verbose,
        }
    }
}

fn parse_max_distance(value: &str) -> Result<f64, String> {
    let distance: f64 = value
        .parse()
        .map_err(|_| format!("invalid max-distance value: {value}"))?;
    if distance <= 0.0 {
        return Err("max-distance must be positive".to_string());
    }
    if distance > MAX_RANGE_KM {
        return Err(format!("max-distance must be at most {MAX_RANGE_KM:.0} km"));
    }
    Ok(distance)
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum AntiCensorshipArg {
    Lwo,
    Quic,
    Shadowsocks,
}

impl From<AntiCensorshipArg> for AntiCensorship {
    fn from(arg: AntiCensorshipArg) -> Self {
        match arg {
            AntiCensorshipArg::Lwo => AntiCensorship::Lwo,
            AntiCensorshipArg::Quic => AntiCensorship::Quic,
            AntiCensorshipArg::Shadowsocks => AntiCensorship::Shadowsocks,
        }
    }
}

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    if let Err(e) = runtime.block_on(async_main()) {
        if is_cancellation(&e) {
            eprintln!("Operation cancelled");
        } else {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(1);
    }
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<ScanError>(), Some(ScanError::Cancelled { .. }))
            || matches!(cause.downcast_ref::<ApiError>(), Some(ApiError::Cancelled))
    })
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    // Ctrl-C cancels in-flight probes; completed measurements are dropped
    // along with the scan, matching an ordinary aborted run.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let relays_path = match &args.relays_file {
        Some(path) => path.clone(),
        None => relays::default_relays_path().context(
            "could not find relays.json; please specify the path using --relays-file",
        )?,
    };
    vlog!(args.verbose, 1, "relays file: {}", relays_path.display());

    let relay_file = relays::load_relays_file(&relays_path)?;
    let filter = LocationFilter {
        server_type: None,
        anti_censorship: args
            .anti_censorship
            .map(AntiCensorship::from)
            .unwrap_or_default(),
        daita: args.daita,
        ip_version: args.ip_version(),
    };
    let (locations, skipped) = relays::collect_locations(&relay_file, &filter);
    if skipped > 0 {
        vlog!(args.verbose, 1, "skipped {skipped} relays with unknown endpoint data");
    }
    if locations.is_empty() {
        bail!("no servers found");
    }
    vlog!(args.verbose, 1, "found {} matching servers", locations.len());

    let api = ApiClient::new(get_version(), args.verbose)?;
    let user_loc = api
        .user_location(&cancel)
        .await
        .context("failed to get user location")?;

    // Ping results are meaningless when already exiting through a relay.
    if user_loc.mullvad_exit_ip {
        println!(
            "You are currently connected to Mullvad VPN. Pinging Mullvad servers \
             from a Mullvad server does not provide meaningful results.\nYour location info:"
        );
        print!("{}", format::format_user_location(&user_loc));
        return Ok(());
    }

    if args.table_mode() {
        run_table_mode(&args, locations, &user_loc, &cancel).await
    } else {
        run_best_server_mode(&args, locations, &user_loc, &cancel).await
    }
}

async fn run_table_mode(
    args: &Args,
    locations: Vec<Location>,
    user_loc: &UserLocation,
    cancel: &CancellationToken,
) -> Result<()> {
    let max_distance = args.max_distance.unwrap_or(RANGE_STEP_KM);
    let nearby = distance::filter_by_distance(
        &locations,
        user_loc.latitude,
        user_loc.longitude,
        max_distance,
    );
    if nearby.is_empty() {
        println!("No servers found within {max_distance:.0} km of your location");
        return Ok(());
    }
    vlog!(
        args.verbose,
        1,
        "{} servers within {max_distance:.0} km",
        nearby.len()
    );

    let mut results = scan_locations(nearby, args.scan_config(), cancel).await?;
    format::sort_by_latency(&mut results);
    print!("{}", format::format_table(&results, args.ip_version()));
    Ok(())
}

/// Widen the search radius until at least one relay is inside it, probe
/// that set, and print only the fastest relay.
async fn run_best_server_mode(
    args: &Args,
    locations: Vec<Location>,
    user_loc: &UserLocation,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut range_km = RANGE_STEP_KM;
    let nearby = loop {
        if cancel.is_cancelled() {
            bail!(ScanError::Cancelled {
                partial: Vec::new(),
                total: 0,
            });
        }
        let nearby = distance::filter_by_distance(
            &locations,
            user_loc.latitude,
            user_loc.longitude,
            range_km,
        );
        if !nearby.is_empty() {
            break nearby;
        }
        range_km += RANGE_STEP_KM;
        if range_km > MAX_RANGE_KM {
            bail!("no servers found within maximum search radius of {MAX_RANGE_KM:.0} km");
        }
    };
    vlog!(
        args.verbose,
        1,
        "{} servers within {range_km:.0} km",
        nearby.len()
    );

    let mut results = scan_locations(nearby, args.scan_config(), cancel).await?;
    format::sort_by_latency(&mut results);
    if let Some(best) = results.first() {
        println!("Your location:");
        print!("{}", format::format_user_location(user_loc));
        println!();
        println!("Best server:");
        print!("{}", format::format_best_server(best, args.ip_version()));
    }
    Ok(())
}
