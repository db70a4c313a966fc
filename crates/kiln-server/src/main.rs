//! kilnd - remote compilation server
//!
//! Accepts compiler invocations from kiln clients, fetches missing
//! dependencies from them, compiles and returns the object files.

use std::time::Duration;

use clap::Parser;
use eyre::{Result, WrapErr};
use kiln_io::net::is_loopback_host;
use kiln_server::config::{ConfigFile, default_limit};
use kiln_server::{Server, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kilnd", version, about = "Remote compilation server")]
struct Cli {
    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// TCP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Maximum number of concurrently served clients
    #[arg(short = 'j', long = "jobs", value_name = "N")]
    jobs: Option<usize>,

    /// Log level
    #[arg(
        long,
        value_name = "LEVEL",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    log_level: Option<String>,

    /// Debug logging (overrides --log-level)
    #[arg(long)]
    verbose: bool,

    /// Ignore config files
    #[arg(long)]
    no_config: bool,

    /// Compilation and socket inactivity timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "kilnd={level},kiln_server={level},kiln_env={level},kiln_cache={level},kiln_io={level}"
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = if cli.no_config {
        None
    } else {
        ConfigFile::discover().wrap_err("failed to load config file")?
    };
    let section = file.as_ref().map(|(_, file)| &file.kilnd);

    let verbose = cli.verbose || section.and_then(|s| s.verbose).unwrap_or(false);
    let level = if verbose {
        "debug"
    } else {
        cli.log_level
            .as_deref()
            .or_else(|| section.and_then(|s| s.log_level.as_deref()))
            .unwrap_or("info")
    };
    init_tracing(level);

    if let Some((path, _)) = &file {
        info!(path = %path, "loaded config file");
    }

    let limit = cli
        .jobs
        .or_else(|| section.and_then(|s| s.limit))
        .unwrap_or_else(default_limit);
    let mut config = ServerConfig::new(limit);
    if let Some(section) = section {
        config = section.apply(config);
    }
    if let Some(address) = cli.listen {
        config = config.with_address(address);
    }
    if let Some(port) = cli.port {
        config = config.with_port(port);
    }
    if let Some(jobs) = cli.jobs {
        config = config.with_limit(jobs);
    }
    if let Some(secs) = cli.timeout {
        config = config.with_compilation_timeout(Duration::from_secs(secs));
    }

    if !is_loopback_host(&config.address) {
        info!(
            address = %config.address,
            "listening beyond loopback; every host that reaches this port can run compilers here"
        );
    }

    let server = Server::bind(config).await.wrap_err("could not start kilnd")?;
    info!(address = %server.local_addr(), "kilnd ready");

    server
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received Ctrl-C"),
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl-C; stop kilnd with a signal");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .wrap_err("server stopped with an error")?;

    info!("kilnd stopped");
    Ok(())
}
