//! Example: Routing orders to a flaky broker through the resilience layer
//!
//! Simulates a broker that fails its first few order submissions, then
//! recovers. Orders go through a registry configured from a settings file
//! when one is present, otherwise from the built-in profile below.
//!
//! Run with:
//! ```bash
//! RUST_LOG=tradeguard_resilience=debug cargo run --example broker_orders
//! ```

#![allow(clippy::print_stdout)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tradeguard_resilience::{settings, ResilienceRegistry, ResilienceSettings};

const DEMO_PROFILE: &str = r#"
default_timeout = 2000

[dependencies.alpaca]
timeout = 200

[dependencies.alpaca.circuit_breaker]
failure_threshold = 3
recovery_timeout = 500
success_threshold = 1

[dependencies.alpaca.retry]
max_attempts = 2
base_delay = 50
strategy = "fixed"

[dependencies.alpaca.rate_limiter]
max_requests = 20
window = 1000

[dependencies.alpaca.bulkhead]
max_concurrent = 4
"#;

#[derive(Debug)]
struct BrokerError(String);

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "broker rejected order: {}", self.0)
    }
}

impl std::error::Error for BrokerError {}

/// Broker that answers 503 for its first `outage` submissions.
struct FlakyBroker {
    submissions: AtomicU32,
    outage: u32,
}

impl FlakyBroker {
    async fn submit(&self, symbol: &str, qty: u32) -> Result<String, BrokerError> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if n < self.outage {
            return Err(BrokerError("503 Service Unavailable".to_string()));
        }
        Ok(format!("order-{n}: buy {qty} {symbol}"))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Broker Order Routing Example");
    println!("============================\n");

    let profile = match settings::probe_config_paths() {
        Some(path) => {
            println!("Using settings from {}\n", path.display());
            settings::load()?
        }
        None => {
            println!("No resilience.toml found, using the built-in profile\n");
            ResilienceSettings::from_toml_str(DEMO_PROFILE)?
        }
    };

    let registry = ResilienceRegistry::from_settings(&profile)?;
    let options = profile.options_for("alpaca");
    let broker = FlakyBroker { submissions: AtomicU32::new(0), outage: 4 };

    for (round, symbol) in ["AAPL", "MSFT", "NVDA", "TSLA", "AMZN"].into_iter().enumerate() {
        let result = registry.execute("alpaca", &options, || broker.submit(symbol, 10)).await;
        match result {
            Ok(ack) => println!("round {round}: ✓ {ack}"),
            Err(err) => println!("round {round}: ✗ {err} ({})", err.kind()),
        }

        if registry.statistics().open_circuits().contains(&"alpaca") {
            println!("         circuit open, waiting for recovery");
            tokio::time::sleep(Duration::from_millis(600)).await;
        }
    }

    println!("\nFinal statistics:");
    println!("{}", registry.statistics().to_json()?);
    Ok(())
}
