//! slipnet: DNS tunnel client front-end
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! restores any system proxy a crashed run left behind, then runs the
//! tunnel client and HTTP relay until a termination signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use slipnet_vpn::{
    BinaryLocator, JsonFileStore, ServiceConfig, ServiceEvent, ServiceManager, SharedSettings, Teardown,
    default_driver, wait_for_signal,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Exit status when the service task panics, as for a panic in `main`
const PANIC_EXIT_CODE: i32 = 101;

#[derive(Debug, Parser)]
#[command(name = "slipnet", version, about = "DNS tunnel client with a local HTTP proxy")]
struct Args {
    /// DNS resolver (`ip` or `ip:port`); defaults to the saved setting
    #[arg(long)]
    resolver: Option<String>,

    /// Tunnel domain; defaults to the saved setting
    #[arg(long)]
    domain: Option<String>,

    /// Settings file
    #[arg(long, default_value = "settings.json")]
    settings: PathBuf,

    /// Directory holding the bundled tunnel-client binaries
    #[arg(long)]
    resources: Option<PathBuf>,

    /// Point the system proxy at the relay once running
    #[arg(long)]
    system_proxy: bool,

    /// Verbose relay diagnostics (persisted)
    #[arg(long)]
    verbose: bool,

    /// SOCKS5 username (persisted, requires --socks-pass)
    #[arg(long, requires = "socks_pass")]
    socks_user: Option<String>,

    /// SOCKS5 password (persisted)
    #[arg(long, requires = "socks_user")]
    socks_pass: Option<String>,

    /// Fetch the probe URL through the relay after starting
    #[arg(long)]
    probe: bool,
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "info,slipnet_vpn=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .compact()
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(args));
    info!("slipnet exiting ({})", code);
    std::process::exit(code);
}

/// Run until a signal or a fatal error; returns the process exit code
async fn run(args: Args) -> i32 {
    let service = match build_service(&args) {
        Ok(service) => service,
        Err(e) => {
            error!("{:#}", e);
            return 1;
        }
    };
    let teardown = Teardown::new(service.clone());
    tokio::spawn(print_events(service.clone()));

    // Own task, so a panic while serving still reaches teardown
    let mut serving = tokio::spawn({
        let service = service.clone();
        async move { serve(&service, &args).await }
    });

    let outcome = tokio::select! {
        joined = teardown.supervise(&mut serving) => match joined {
            Some(result) => result.map(|()| None),
            // Teardown already ran
            None => return PANIC_EXIT_CODE,
        },
        signal = wait_for_signal() => signal.map(Some).context("Failed to install signal handlers"),
    };
    serving.abort();

    match outcome {
        // Service ended on its own (tunnel exit); wait for a signal to leave
        Ok(None) => match wait_for_signal().await {
            Ok(signal) => {
                teardown.shutdown(&signal.to_string()).await;
                signal.exit_code()
            }
            Err(e) => {
                error!("Failed to wait for signals: {}", e);
                teardown.shutdown("signal handler failure").await;
                1
            }
        },
        Ok(Some(signal)) => {
            teardown.shutdown(&signal.to_string()).await;
            signal.exit_code()
        }
        Err(e) => {
            error!("{:#}", e);
            teardown.shutdown("fatal error").await;
            1
        }
    }
}

fn build_service(args: &Args) -> Result<ServiceManager> {
    let store = Arc::new(JsonFileStore::new(&args.settings));
    let settings = SharedSettings::load(store);

    let locator = match &args.resources {
        Some(dir) => BinaryLocator::new(dir),
        None => BinaryLocator::default(),
    };
    let config = ServiceConfig::new(locator);

    let driver = default_driver();
    if driver.is_none() {
        warn!("System proxy configuration is not available on this platform");
    }

    ServiceManager::new(config, settings, driver).context("Invalid service configuration")
}

/// Recover, start, then park while the service runs
async fn serve(service: &ServiceManager, args: &Args) -> Result<()> {
    // Before anything else: undo a system proxy a crashed run left behind
    if let Err(e) = service.recover().await {
        warn!("Crash recovery failed: {}", e);
    }

    if args.verbose {
        service.set_verbose(true);
    }
    if let (Some(user), Some(pass)) = (&args.socks_user, &args.socks_pass) {
        service.set_socks5_auth(true, user, pass);
    }

    let saved = service.settings().get();
    let resolver = args.resolver.clone().unwrap_or(saved.resolver);
    let domain = args.domain.clone().unwrap_or(saved.domain);

    let status = service
        .start(&resolver, &domain)
        .await
        .context("Failed to start the service")?;
    info!(
        "Relay on {} (tunnel alive: {}, mode: {})",
        service.config().relay,
        status.tunnel_alive,
        status.mode
    );

    if args.system_proxy {
        match service.enable_system_proxy().await {
            Ok(true) => info!("System proxy enabled"),
            Ok(false) => info!("System proxy already pointed at the relay"),
            Err(e) => warn!("System proxy not enabled: {}", e),
        }
    }

    if args.probe {
        match service.probe_relay().await {
            Ok(report) => info!("Probe OK: egress {} in {:?}", report.origin, report.elapsed),
            Err(e) => warn!("Probe failed: {}", e),
        }
    }

    let mut state = service.watch_state();
    state
        .wait_for(|s| !s.is_running())
        .await
        .context("Service state channel closed")?;
    warn!("Service stopped; press Ctrl-C to exit");
    Ok(())
}

/// Mirror UI events to the terminal
async fn print_events(service: ServiceManager) {
    let mut events = service.events().subscribe();
    loop {
        match events.recv().await {
            Ok(ServiceEvent::Log(line)) => println!("{line}"),
            Ok(ServiceEvent::Error(line)) => eprintln!("error: {line}"),
            Ok(ServiceEvent::Exit(code)) => eprintln!("tunnel client exited (code {code:?})"),
            Ok(ServiceEvent::StatusUpdate(status)) => println!(
                "status: tunnel {} | relay {} | system proxy {} | {}",
                on_off(status.tunnel_alive),
                on_off(status.relay_listening),
                on_off(status.system_proxy_configured),
                status.mode
            ),
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}
