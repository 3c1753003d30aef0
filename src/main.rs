use clap::Parser;
use iperf_driver::config::{self, DriverConfig};
use iperf_driver::{
    signals, CancellationToken, IperfOutputParser, IperfRunnerFactory, RunningStats,
    ServerEndpoint, StartMeasurementTask, TaskSettings, TracingObserver,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Run one iperf throughput measurement under supervision: stream samples,
/// stop on Ctrl-C or when iperf goes quiet, and print the summary.
#[derive(Parser, Debug)]
#[command(name = "iperf-driver", version, about)]
pub struct Cli {
    /// Server address (overrides config)
    #[arg(long)]
    ip: Option<String>,

    /// Server iperf port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(short, long, default_value = "iperf-driver.toml")]
    config: PathBuf,

    /// Extra iperf arguments, must not contain -c or -p (overrides config)
    #[arg(long, allow_hyphen_values = true)]
    args: Option<String>,

    /// Idle window in milliseconds (overrides config)
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// iperf binary (overrides config)
    #[arg(long)]
    command: Option<PathBuf>,

    /// Working directory for iperf (overrides config)
    #[arg(long)]
    writable_dir: Option<PathBuf>,

    /// Print the final statistics as JSON
    #[arg(long)]
    json: bool,

    /// Log every iperf output line
    #[arg(short, long)]
    verbose: bool,
}

fn apply_overrides(cli: &Cli, config: &mut DriverConfig) -> Result<ServerEndpoint, String> {
    let m = &mut config.measurement;
    if let Some(args) = &cli.args {
        m.args = args.clone();
    }
    if let Some(ms) = cli.idle_timeout_ms {
        m.idle_timeout_millis = ms;
    }
    if let Some(command) = &cli.command {
        m.command = command.clone();
    }
    if let Some(dir) = &cli.writable_dir {
        m.writable_dir = dir.clone();
    }

    let ip = cli
        .ip
        .clone()
        .or_else(|| config.server.as_ref().map(|s| s.ip.clone()))
        .ok_or("no server address: pass --ip or set [server] in the config")?;
    let port = cli
        .port
        .or_else(|| config.server.as_ref().map(|s| s.port))
        .unwrap_or(5201);
    Ok(ServerEndpoint { ip, port })
}

fn print_summary(stats: &RunningStats, json: bool) {
    if json {
        match serde_json::to_string_pretty(stats) {
            Ok(s) => println!("{s}"),
            Err(e) => tracing::error!(error = %e, "failed to serialize statistics"),
        }
        return;
    }
    let mbps = |bits: Option<f64>| bits.map_or("-".to_string(), |b| format!("{:.2} Mbit/s", b / 1e6));
    println!("samples: {}", stats.count());
    println!("min:     {}", mbps(stats.min().map(|v| v as f64)));
    println!("mean:    {}", mbps(stats.mean()));
    println!("max:     {}", mbps(stats.max().map(|v| v as f64)));
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "iperf_driver=debug"
    } else {
        "iperf_driver=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let endpoint = match apply_overrides(&cli, &mut config) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.measurement.validate() {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let token = CancellationToken::new();
    if let Err(e) = signals::install(token.clone()) {
        tracing::warn!(error = %e, "failed to install signal handlers");
    }

    let task = Arc::new(StartMeasurementTask::new(
        TaskSettings::from(&config.measurement),
        Arc::new(IperfOutputParser::new()),
        Arc::new(TracingObserver),
        Arc::new(IperfRunnerFactory::new(&config.measurement.command)),
    ));
    let handle = task.prepare(endpoint, token);

    match handle.started.wait().await {
        Ok(endpoint) => tracing::info!(ip = %endpoint.ip, port = endpoint.port, "receiving samples"),
        Err(e) => tracing::warn!(error = %e, "measurement did not start"),
    }

    match handle.finished.await {
        Ok(Ok(stats)) => {
            print_summary(&stats, cli.json);
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: measurement task failed: {e}");
            ExitCode::FAILURE
        }
    }
}
