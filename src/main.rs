use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use slotguard::config::Config;
use slotguard::engine::BookingRequest;
use slotguard::ledger::{Ledger, Seed};
use slotguard::store::FixedAvailability;

/// One stdin line.
#[derive(Deserialize)]
struct BookLine {
    #[serde(flatten)]
    request: BookingRequest,
    #[serde(default)]
    label: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = Config::from_env();
    slotguard::observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let seed: Seed = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
        None => Seed::default(),
    };
    let provider = Arc::new(FixedAvailability::new(50));
    for slot in &seed.external_slots {
        provider.publish(slot.clone());
    }

    let wal_path = config.data_dir.join("ledger.wal");
    let ledger = Arc::new(Ledger::open(wal_path, provider, &config.validator)?);
    if ledger.store().shop_count() == 0 {
        ledger.load_seed(&seed).await?;
        info!(shops = seed.shops.len(), "seed loaded");
    }

    info!("slotguard ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  external failure policy: {:?}", config.validator.external_failure_policy);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let compactor_ledger = ledger.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        slotguard::compactor::run_compactor(compactor_ledger, threshold).await;
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<BookLine>(&line) {
            Ok(BookLine { request, label }) => match ledger.book(&request, label).await {
                Ok(appt) => json!({
                    "ok": true,
                    "appointment_id": appt.id.to_string(),
                    "start": appt.span.start,
                    "end": appt.span.end,
                }),
                Err(e) => json!({ "ok": false, "error": e.kind_label(), "message": e.to_string() }),
            },
            Err(e) => json!({ "ok": false, "error": "parse", "message": e.to_string() }),
        };
        stdout.write_all(format!("{reply}\n").as_bytes()).await?;
        stdout.flush().await?;
    }

    slotguard::compactor::compact_if_due(&ledger, 1).await;
    info!("slotguard stopped");
    Ok(())
}
