//! Engine with the background scheduler and an implementation webhook.
//!
//! Events stream in from a producer task; the scheduler analyzes on every
//! notification and the rollout request arrives on a channel once a
//! winner is found. The run ends with a Parquet checkpoint.
//!
//! Run with: cargo run --example scheduled_engine

use std::time::Duration;

use anyhow::{Context, Result};
use trueno_ab::api::{ChannelSink, IngestRequest};
use trueno_ab::config::EngineConfig;
use trueno_ab::experiment::{EventType, ExperimentRecord, ExperimentStatus, VariantRecord};
use trueno_ab::logging::init_logging;
use trueno_ab::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = EngineConfig::from_env()?;
    config.evaluation_interval_ms = 200;
    init_logging(&config.log)?;

    let (sink, mut webhooks) = ChannelSink::new();
    let engine = Engine::builder().config(config).sink(sink).build()?;
    engine.create_experiment(
        ExperimentRecord::builder("pricing-cta", "Pricing page call to action")
            .variant(VariantRecord::control("start", "Start free trial", 0.5))
            .variant(VariantRecord::new("try", "Try it free", 0.5))
            .planned_sample_size(1500)
            .build(),
    )?;
    engine.transition("pricing-cta", ExperimentStatus::Active, None)?;
    let scheduler = engine.spawn_scheduler()?;

    println!("🚀 Streaming traffic into pricing-cta");
    let mut visitor = 0u32;
    while engine.experiment("pricing-cta")?.status() == ExperimentStatus::Active && visitor < 20_000 {
        visitor += 1;
        let id = format!("visitor-{visitor}");
        let variant = engine.assign("pricing-cta", &id).await?;
        let exposure = engine
            .ingest(IngestRequest::new("pricing-cta", id.as_str(), EventType::Exposure))
            .await;
        if exposure.is_err() {
            // Concluded between the status check and the ingest
            break;
        }
        let converts = if variant == "try" { visitor % 8 == 0 } else { visitor % 16 == 0 };
        if converts {
            let _ = engine
                .ingest(IngestRequest::new("pricing-cta", id.as_str(), EventType::Conversion))
                .await;
        }
        if visitor % 250 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let request = tokio::time::timeout(Duration::from_secs(5), webhooks.recv())
        .await
        .context("no implementation request within 5s")?
        .context("implementation channel closed")?;
    println!(
        "✅ Implement '{}' (analysis #{:?}, decided {})",
        request.winning_variant_id, request.analysis_sequence, request.decided_at
    );

    let stats = scheduler.shutdown().await?;
    println!(
        "   scheduler: {} evaluations, {} coalesced, {} timeouts",
        stats.evaluations, stats.coalesced, stats.timeouts
    );

    let dir = std::env::temp_dir().join("trueno-ab-demo");
    let summary = engine.checkpoint(&dir)?;
    println!(
        "💾 Checkpointed {} experiment(s), {} events to {}",
        summary.experiments,
        summary.events,
        dir.display()
    );
    Ok(())
}
