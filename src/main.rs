mod actions;
mod bridge;
mod buffer;
mod config;
mod dialogue;
mod encoder;
mod evolution;
mod identity;
mod logging;
mod memory;
mod orchestrator;
mod policy;
mod reward;
mod util;

use crate::config::Config;
use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mobmind", version)]
#[command(about = "Mobmind — tick-synchronized PPO core for Minecraft NPC populations", long_about = None)]
struct Cli {
    /// Path to the configuration file (default: ./mobmind.toml)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check external collaborators: sensor hub, stores, LLM backend
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Missing mandatory config or a corrupt parameter schema are the only
    // non-zero exits; everything after startup degrades instead of dying.
    let config = Config::load(cli.config.as_deref())?;

    if let Some(Command::Doctor) = cli.cmd {
        return doctor(&config).await;
    }

    let log_dir = logging::setup_tracing(logging::LoggingSettings {
        level: config.logging.level.as_deref(),
        directory: config.logging.directory.as_deref(),
        retention_days: config.logging.retention_days,
    })?;

    info!("--- Mobmind Startup ---");
    info!("Sensor hub: {}:{}", config.sensor.host, config.sensor.port);
    info!(
        "Population: target {} (bounds {}..{})",
        config.population.target_agents, config.population.min_agents, config.population.max_agents
    );
    info!(
        "Model: {}x{} (lr {}, clip {})",
        config.ml.state_dim, config.ml.action_dim, config.ml.learning_rate, config.ml.ppo_clip
    );
    info!("Dialogue backend: {}", config.llm.backend);
    info!("Workers: {}", config.worker_count());
    info!("Log directory: {}", log_dir.display());
    info!("-----------------------");

    let cancel = CancellationToken::new();

    let store = memory::MemoryStore::open(
        &config.memory.database_path,
        &config.memory.knowledge_database_path,
        config.memory.decay_factor,
        config.memory.prune_floor,
    )?;
    store.start(config.memory.decay_interval_ms, cancel.clone());
    if store.prompt_template("persona").is_none() {
        let seeded = "You are {speaker}, a villager working in a shared Minecraft world. \
                      Reply with one or two short, plain sentences. No markup.";
        if let Err(e) = store.store_prompt_template("persona", seeded) {
            tracing::warn!("Could not seed prompt library: {e}");
        }
    }

    let mut boot_rng = rand::rngs::StdRng::seed_from_u64(util::now_ts_millis());
    let policy = Arc::new(policy::PolicyCore::boot(config.ml.clone(), &mut boot_rng)?);

    let bridge = bridge::SensorBridge::new(config.sensor.clone());
    bridge.connect();

    let identity = Arc::new(identity::IdentityService::new(
        config.identity.clone(),
        store.clone(),
    ));
    let generator = dialogue::generator::ChatGenerator::from_config(&config.llm);
    let dialogue_pipeline = dialogue::DialoguePipeline::new(
        config.dialogue.clone(),
        generator,
        store.clone(),
        dialogue::ChatSink::Bridge(bridge.clone()),
    );
    dialogue_pipeline.start(cancel.clone());

    let evolution = Arc::new(evolution::EvolutionManager::new(
        config.evolution.clone(),
        config.personality.clone(),
    ));

    let orchestrator = orchestrator::Orchestrator::new(
        config.clone(),
        bridge.clone(),
        policy.clone(),
        store.clone(),
        identity,
        dialogue_pipeline.clone(),
        evolution,
        cancel.clone(),
    );

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.run().await;
        });
    }

    // Periodic parameter persistence.
    {
        let policy = policy.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_millis(config.ml.save_interval_ms.max(1000));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = policy.persist_all().await {
                            error!("Periodic parameter save failed: {e}");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    // Compact periodic status line.
    {
        let orchestrator = orchestrator.clone();
        let bridge = bridge.clone();
        let policy = policy.clone();
        let dialogue_pipeline = dialogue_pipeline.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_millis(config.features.status_interval_ms.max(1000));
        tokio::spawn(async move {
            let mut last_frames = 0u64;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
                let orch = orchestrator.stats().await;
                let net = bridge.stats();
                let brain = policy.stats().await;
                let chat = dialogue_pipeline.stats().await;
                let frame_rate =
                    (net.frames_received - last_frames) as f64 / (interval.as_secs_f64());
                last_frames = net.frames_received;
                info!(
                    "status: agents={} ticks={} frames/s={:.1} dropped={} train_steps={} brain=v{} chat_queue={} chat_emitted={}",
                    orch.active_agents,
                    orch.ticks,
                    frame_rate,
                    net.frames_dropped,
                    brain.training_steps,
                    brain.shared_version,
                    chat.queue_depth,
                    chat.emitted,
                );
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, draining");
        }
        _ = cancel.cancelled() => {
            info!("Internal shutdown requested");
        }
    }

    orchestrator.shutdown(Duration::from_secs(5)).await;
    cancel.cancel();
    info!("Shutdown complete");
    Ok(())
}

/// Connectivity and storage diagnostics; no tracing, plain output.
async fn doctor(config: &Config) -> Result<()> {
    println!("mobmind doctor");

    let addr = format!("{}:{}", config.sensor.host, config.sensor.port);
    match tokio::time::timeout(Duration::from_secs(3), tokio::net::TcpStream::connect(&addr)).await
    {
        Ok(Ok(_)) => println!("  sensor hub {addr}: reachable"),
        Ok(Err(e)) => println!("  sensor hub {addr}: {e}"),
        Err(_) => println!("  sensor hub {addr}: timed out"),
    }

    match memory::MemoryStore::open(
        &config.memory.database_path,
        &config.memory.knowledge_database_path,
        config.memory.decay_factor,
        config.memory.prune_floor,
    ) {
        Ok(_) => println!(
            "  memory store {}: ok",
            config.memory.database_path.display()
        ),
        Err(e) => println!("  memory store: {e}"),
    }

    match std::fs::create_dir_all(&config.ml.params_dir) {
        Ok(()) => println!("  params dir {}: writable", config.ml.params_dir.display()),
        Err(e) => println!("  params dir: {e}"),
    }
    let shared = config.ml.params_dir.join("shared").join("params.mobw");
    if shared.exists() {
        match policy::persist::load_params(&shared, config.ml.state_dim, config.ml.action_dim) {
            Ok((_, version)) => println!("  shared params: v{version}, schema ok"),
            Err(e) => println!("  shared params: {e}"),
        }
    } else {
        println!("  shared params: none (fresh init on boot)");
    }

    if config.llm.enabled {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()?;
        match client.get(&config.llm.url).send().await {
            Ok(resp) => println!("  llm backend {}: {}", config.llm.url, resp.status()),
            Err(e) => println!("  llm backend {}: {e}", config.llm.url),
        }
    } else {
        println!("  llm backend: disabled (template fallback)");
    }

    Ok(())
}
