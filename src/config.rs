use crate::reward::RewardWeights;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Whole-process configuration snapshot. Assembled once at startup from
/// `mobmind.toml` and never mutated afterwards; components receive clones of
/// the sections they need. Changing `ml.state_dim` or `ml.action_dim` between
/// runs invalidates persisted parameters (refused at load, see
/// `policy::persist`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub population: PopulationConfig,
    pub server: ServerConfig,
    pub sensor: SensorConfig,
    pub ml: MlConfig,
    pub llm: LlmConfig,
    pub dialogue: DialogueConfig,
    pub memory: MemoryConfig,
    pub identity: IdentityConfig,
    pub personality: PersonalityConfig,
    pub evolution: EvolutionConfig,
    pub features: FeatureConfig,
    pub threading: ThreadingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationConfig {
    pub min_agents: usize,
    pub max_agents: usize,
    pub target_agents: usize,
    pub spawn_batch_size: usize,
    pub spawn_batch_delay_ms: u64,
    /// Decision cadence per agent. A tick is a logical decision cycle, not a
    /// game tick.
    pub tick_interval_ms: u64,
}

/// Game server address, used for spawn locations and diagnostics. The core
/// never talks to the game server directly; all world effects go through the
/// sensor hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
    /// Frames older than this are reported stale by `latest()`.
    pub stale_window_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    pub enabled: bool,
    pub state_dim: usize,
    pub action_dim: usize,
    pub learning_rate: f32,
    pub gamma: f32,
    pub gae_lambda: f32,
    pub ppo_clip: f32,
    pub entropy_coef: f32,
    pub value_coef: f32,
    pub batch_size: usize,
    /// Minimum rollout length for an episode-end flush to trigger training.
    pub min_rollout: usize,
    /// At most one PPO update per parameter set every this many ticks.
    pub update_interval_ticks: u64,
    pub epsilon_start: f32,
    pub epsilon_min: f32,
    pub epsilon_decay_steps: u64,
    pub save_interval_ms: u64,
    pub params_dir: PathBuf,
    pub reward: RewardWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    /// "ollama" | "openai" | "template"
    pub backend: String,
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    pub queue_capacity: usize,
    pub cooldown_global_ms: u64,
    pub cooldown_whisper_ms: u64,
    pub cooldown_local_ms: u64,
    pub rate_limit_per_min: usize,
    pub dedup_window: usize,
    pub ambient_reply_probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub database_path: PathBuf,
    pub knowledge_database_path: PathBuf,
    pub decay_interval_ms: u64,
    pub decay_factor: f32,
    /// Episodic memories whose decayed strength falls below this are pruned.
    pub prune_floor: f32,
    pub recent_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub pool_url: String,
    pub oracle_url: String,
    pub batch_size: usize,
    pub max_batches: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalityConfig {
    pub mutation_rate: f32,
    pub mutation_sigma: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub weight_reward: f32,
    pub weight_survival: f32,
    pub weight_tasks: f32,
    pub weight_exploration: f32,
    pub weight_health: f32,
    pub parent_top_k: usize,
    pub mutation_rate: f32,
    pub mutation_sigma: f32,
    pub spawn_probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub idle_penalty: bool,
    pub idle_threshold_ms: u64,
    /// Cumulative-reward floor. Dropping below marks the agent terminal at
    /// the next death check. A culling lever, not a bug.
    pub death_threshold: f32,
    pub unstuck_detection: bool,
    /// Position radius (blocks) under which an agent attempting movement is
    /// considered stuck.
    pub stuck_radius: f64,
    pub stuck_ticks: u32,
    pub action_timeout_ms: u64,
    pub status_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    /// Upper bound on concurrently running agent ticks. 0 means hardware
    /// parallelism.
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.unwrap_or_else(|| Path::new("mobmind.toml"));
        if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.population.min_agents > self.population.max_agents {
            anyhow::bail!(
                "population.min_agents ({}) exceeds population.max_agents ({})",
                self.population.min_agents,
                self.population.max_agents
            );
        }
        if self.population.target_agents > self.population.max_agents {
            anyhow::bail!(
                "population.target_agents ({}) exceeds population.max_agents ({})",
                self.population.target_agents,
                self.population.max_agents
            );
        }
        if self.ml.state_dim == 0 || self.ml.action_dim == 0 {
            anyhow::bail!("ml.state_dim and ml.action_dim must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.ml.gamma) {
            anyhow::bail!("ml.gamma must be in [0, 1], got {}", self.ml.gamma);
        }
        if !(0.0..=1.0).contains(&self.ml.gae_lambda) {
            anyhow::bail!("ml.gae_lambda must be in [0, 1], got {}", self.ml.gae_lambda);
        }
        if self.ml.ppo_clip <= 0.0 {
            anyhow::bail!("ml.ppo_clip must be positive, got {}", self.ml.ppo_clip);
        }
        if self.sensor.token.is_empty() {
            anyhow::bail!("sensor.token must be set");
        }
        if self.dialogue.queue_capacity == 0 {
            anyhow::bail!("dialogue.queue_capacity must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.dialogue.ambient_reply_probability) {
            anyhow::bail!("dialogue.ambient_reply_probability must be in [0, 1]");
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        if self.threading.max_workers > 0 {
            self.threading.max_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            population: PopulationConfig::default(),
            server: ServerConfig::default(),
            sensor: SensorConfig::default(),
            ml: MlConfig::default(),
            llm: LlmConfig::default(),
            dialogue: DialogueConfig::default(),
            memory: MemoryConfig::default(),
            identity: IdentityConfig::default(),
            personality: PersonalityConfig::default(),
            evolution: EvolutionConfig::default(),
            features: FeatureConfig::default(),
            threading: ThreadingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            min_agents: 10,
            max_agents: 1000,
            target_agents: 50,
            spawn_batch_size: 5,
            spawn_batch_delay_ms: 2000,
            tick_interval_ms: 1000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25565,
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25580,
            token: "changeme".to_string(),
            stale_window_ms: 5000,
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dim: crate::encoder::STATE_DIM,
            action_dim: crate::actions::ACTION_DIM,
            learning_rate: 3e-4,
            gamma: 0.99,
            gae_lambda: 0.95,
            ppo_clip: 0.2,
            entropy_coef: 0.01,
            value_coef: 0.5,
            batch_size: 64,
            min_rollout: 8,
            update_interval_ticks: 20,
            epsilon_start: 1.0,
            epsilon_min: 0.05,
            epsilon_decay_steps: 100_000,
            save_interval_ms: 60_000,
            params_dir: PathBuf::from("data/params"),
            reward: RewardWeights::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "template".to_string(),
            url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.2".to_string(),
            api_key: None,
            timeout_ms: 10_000,
        }
    }
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            cooldown_global_ms: 5000,
            cooldown_whisper_ms: 2000,
            cooldown_local_ms: 3000,
            rate_limit_per_min: 30,
            dedup_window: 50,
            ambient_reply_probability: 0.15,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/memory.redb"),
            knowledge_database_path: PathBuf::from("data/knowledge.redb"),
            decay_interval_ms: 300_000,
            decay_factor: 0.99,
            prune_floor: 0.05,
            recent_limit: 8,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            pool_url: String::new(),
            oracle_url: String::new(),
            batch_size: 100,
            max_batches: 3,
            timeout_ms: 5000,
        }
    }
}

impl Default for PersonalityConfig {
    fn default() -> Self {
        Self {
            mutation_rate: 0.2,
            mutation_sigma: 0.1,
        }
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            weight_reward: 1.0,
            weight_survival: 0.01,
            weight_tasks: 5.0,
            weight_exploration: 0.5,
            weight_health: 0.25,
            parent_top_k: 5,
            mutation_rate: 0.1,
            mutation_sigma: 0.05,
            spawn_probability: 1.0,
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            idle_penalty: true,
            idle_threshold_ms: 6000,
            death_threshold: -20.0,
            unstuck_detection: true,
            stuck_radius: 1.5,
            stuck_ticks: 10,
            action_timeout_ms: 3000,
            status_interval_ms: 30_000,
        }
    }
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self { max_workers: 0 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            directory: None,
            retention_days: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("default config is valid");
    }

    #[test]
    fn rejects_inverted_population_bounds() {
        let mut config = Config::default();
        config.population.min_agents = 100;
        config.population.max_agents = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_gamma() {
        let mut config = Config::default();
        config.ml.gamma = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_src = r#"
            [population]
            target_agents = 20

            [sensor]
            token = "s3cret"

            [ml]
            learning_rate = 0.001
        "#;
        let config: Config = toml::from_str(toml_src).expect("parse");
        assert_eq!(config.population.target_agents, 20);
        assert_eq!(config.sensor.token, "s3cret");
        assert_eq!(config.ml.learning_rate, 0.001);
        // Untouched sections keep their defaults.
        assert_eq!(config.ml.batch_size, 64);
        assert_eq!(config.dialogue.rate_limit_per_min, 30);
    }
}
