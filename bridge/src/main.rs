use clap::{Parser, ValueEnum};
use tracing::{error, info};

use telemetry_bridge::{Bridge, BridgeConfig};
use telemetry_mock::MockScenario;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "telemetry-bridge", about = "Vehicle telemetry bridge with database storage")]
struct Args {
    /// Generate synthetic telemetry instead of subscribing to the vehicle channel
    #[arg(long, conflicts_with = "real")]
    mock: bool,
    /// Subscribe to the live vehicle channel (the default)
    #[arg(long)]
    real: bool,
    /// Simulation scenario for --mock
    #[arg(long, value_enum, default_value_t = ScenarioArg::Normal)]
    scenario: ScenarioArg,
    /// Human label for this session
    #[arg(long)]
    session: Option<String>,
    /// Synthetic sample rate in messages per second (overrides MOCK_DATA_INTERVAL)
    #[arg(long)]
    rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScenarioArg {
    /// Realistic smooth simulation
    Normal,
    /// Sensor failures and dropouts
    Sensor,
    /// Data stream pauses
    Stalls,
    /// Intermittent connection
    Intermit,
    /// GPS signal issues
    Gps,
    /// All problems combined
    Chaos,
}

impl From<ScenarioArg> for MockScenario {
    fn from(arg: ScenarioArg) -> Self {
        match arg {
            ScenarioArg::Normal => MockScenario::Normal,
            ScenarioArg::Sensor => MockScenario::SensorFailures,
            ScenarioArg::Stalls => MockScenario::DataStalls,
            ScenarioArg::Intermit => MockScenario::Intermittent,
            ScenarioArg::Gps => MockScenario::GpsIssues,
            ScenarioArg::Chaos => MockScenario::Chaos,
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telemetry_bridge=info,telemetry_mock=info,telemetry_analytics=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = BridgeConfig::default();
    if let Some(rate) = args.rate {
        if rate > 0.0 {
            config.mock_interval = std::time::Duration::from_secs_f64(1.0 / rate);
        }
    }

    let scenario = args.mock.then(|| MockScenario::from(args.scenario));

    info!(
        "🚀 Telemetry Bridge v{} starting — mode: {}",
        env!("CARGO_PKG_VERSION"),
        if args.mock { "mock" } else { "real" },
    );

    let bridge = match Bridge::new(config, args.session, scenario) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("❌ startup failed: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = bridge.run().await {
        error!("❌ fatal: {e:#}");
        std::process::exit(1);
    }

    info!("🏁 exited");
}
