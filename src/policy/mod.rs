//! Actor-critic parameter management.
//!
//! Two tiers of parameter sets: one shared set used by every agent unless a
//! personal override exists. Sets are published as immutable `Arc` versions;
//! forward passes resolve a version at call start, the trainer is the single
//! writer and swaps in a new version after each applied update. An update
//! mid-rollout may split a rollout across versions but never tears a single
//! forward pass.

use crate::buffer::Experience;
use crate::config::MlConfig;
use crate::policy::network::{AdamState, Network};
use crate::policy::ppo::{ppo_update, PpoConfig, PpoOutcome};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub mod network;
pub mod persist;
pub mod ppo;

/// Which parameter set produced (and therefore trains on) a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamOrigin {
    Shared,
    Personal(String),
}

/// One immutable published parameter version.
pub struct ParamSet {
    pub net: Network,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct ActionChoice {
    pub action: usize,
    pub log_prob: f32,
    pub value: f32,
    pub param_version: u64,
    pub explored: bool,
}

struct TrainerState {
    adam: AdamState,
    pending: Vec<Experience>,
    last_update_step: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyStats {
    pub shared_version: u64,
    pub personal_sets: usize,
    pub training_steps: u64,
    pub discarded_updates: u64,
    pub selection_steps: u64,
}

pub struct PolicyCore {
    ml: MlConfig,
    shared: RwLock<Arc<ParamSet>>,
    personal: RwLock<HashMap<String, Arc<ParamSet>>>,
    trainers: Mutex<HashMap<ParamOrigin, TrainerState>>,
    selection_steps: AtomicU64,
    training_steps: AtomicU64,
    discarded_updates: AtomicU64,
}

impl PolicyCore {
    /// Boots from the persisted shared set when present and schema-valid;
    /// otherwise initializes fresh. A corrupt file is a startup error, a
    /// missing one is not.
    pub fn boot(ml: MlConfig, rng: &mut StdRng) -> Result<Self> {
        let shared_path = Self::shared_path(&ml.params_dir);
        let shared = if shared_path.exists() {
            let (net, version) =
                persist::load_params(&shared_path, ml.state_dim, ml.action_dim)?;
            info!(
                "Loaded shared parameters v{version} from {}",
                shared_path.display()
            );
            ParamSet { net, version }
        } else {
            info!(
                "No shared parameters at {}, initializing fresh",
                shared_path.display()
            );
            ParamSet {
                net: Network::init(ml.state_dim, ml.action_dim, rng),
                version: 0,
            }
        };
        Ok(Self {
            ml,
            shared: RwLock::new(Arc::new(shared)),
            personal: RwLock::new(HashMap::new()),
            trainers: Mutex::new(HashMap::new()),
            selection_steps: AtomicU64::new(0),
            training_steps: AtomicU64::new(0),
            discarded_updates: AtomicU64::new(0),
        })
    }

    fn shared_path(dir: &PathBuf) -> PathBuf {
        dir.join("shared").join("params.mobw")
    }

    fn personal_path(dir: &PathBuf, uuid: &str) -> PathBuf {
        dir.join("personal").join(uuid).join("params.mobw")
    }

    fn ppo_config(&self) -> PpoConfig {
        PpoConfig {
            learning_rate: self.ml.learning_rate,
            gamma: self.ml.gamma,
            gae_lambda: self.ml.gae_lambda,
            clip: self.ml.ppo_clip,
            entropy_coef: self.ml.entropy_coef,
            value_coef: self.ml.value_coef,
        }
    }

    /// Personal set when present, shared otherwise.
    pub async fn effective(&self, uuid: &str) -> (Arc<ParamSet>, ParamOrigin) {
        if let Some(set) = self.personal.read().await.get(uuid) {
            (set.clone(), ParamOrigin::Personal(uuid.to_string()))
        } else {
            (self.shared.read().await.clone(), ParamOrigin::Shared)
        }
    }

    pub async fn shared_version(&self) -> u64 {
        self.shared.read().await.version
    }

    /// Exploration rate after `step` selections, linear decay.
    fn epsilon(&self, step: u64) -> f32 {
        let ml = &self.ml;
        if ml.epsilon_decay_steps == 0 {
            return ml.epsilon_min;
        }
        let progress = (step as f32 / ml.epsilon_decay_steps as f32).min(1.0);
        (ml.epsilon_start - (ml.epsilon_start - ml.epsilon_min) * progress).max(ml.epsilon_min)
    }

    /// One action selection: forward pass on the resolved version, then
    /// argmax, or (with the decayed exploration rate) a single weighted
    /// sample. Invalid-action masking is deliberately absent.
    pub async fn select_action(
        &self,
        uuid: &str,
        state: &[f32],
        rng: &mut StdRng,
    ) -> (ActionChoice, ParamOrigin) {
        let (set, origin) = self.effective(uuid).await;
        let pass = set.net.forward(state);
        let step = self.selection_steps.fetch_add(1, Ordering::Relaxed);
        let epsilon = self.epsilon(step);
        let explored = rng.random::<f32>() < epsilon;
        let action = if explored {
            sample_categorical(pass.probs.as_slice().unwrap_or(&[]), rng)
        } else {
            argmax(pass.probs.as_slice().unwrap_or(&[]))
        };
        let log_prob = pass
            .probs
            .get(action)
            .copied()
            .unwrap_or(1.0 / self.ml.action_dim as f32)
            .max(1e-8)
            .ln();
        (
            ActionChoice {
                action,
                log_prob,
                value: pass.value,
                param_version: set.version,
                explored,
            },
            origin,
        )
    }

    /// Installs a personal override (inheritance product).
    pub async fn install_personal(&self, uuid: &str, net: Network) {
        let set = Arc::new(ParamSet { net, version: 1 });
        self.personal.write().await.insert(uuid.to_string(), set);
    }

    /// Drops an agent's personal set and trainer state after death. The
    /// offspring, if any, received its own clone beforehand.
    pub async fn retire_personal(&self, uuid: &str) {
        self.personal.write().await.remove(uuid);
        self.trainers
            .lock()
            .await
            .remove(&ParamOrigin::Personal(uuid.to_string()));
    }

    /// A clone of the network an agent is currently running on.
    pub async fn clone_effective_net(&self, uuid: &str) -> Network {
        self.effective(uuid).await.0.net.clone()
    }

    /// Feeds one closed rollout into the right trainer and runs a PPO update
    /// when the batch and pacing thresholds allow. Returns the outcome when
    /// an update was attempted.
    pub async fn train_on(
        &self,
        origin: ParamOrigin,
        episode: Vec<Experience>,
    ) -> Option<PpoOutcome> {
        if !self.ml.enabled || episode.is_empty() {
            return None;
        }
        let episode_len = episode.len();
        let mut trainers = self.trainers.lock().await;
        if !trainers.contains_key(&origin) {
            let net = self.net_for(&origin).await;
            trainers.insert(
                origin.clone(),
                TrainerState {
                    adam: AdamState::new(&net),
                    pending: Vec::new(),
                    last_update_step: 0,
                },
            );
        }
        let Some(state) = trainers.get_mut(&origin) else {
            return None;
        };
        state.pending.extend(episode);

        let batch_ready = state.pending.len() >= self.ml.batch_size
            || episode_len >= self.ml.min_rollout;
        if !batch_ready {
            return None;
        }
        let now_step = self.selection_steps.load(Ordering::Relaxed);
        // Pacing bound: at most one update per interval per set.
        if now_step.saturating_sub(state.last_update_step) < self.ml.update_interval_ticks
            && state.last_update_step != 0
        {
            return None;
        }
        state.last_update_step = now_step.max(1);

        let batch: Vec<Experience> = std::mem::take(&mut state.pending);
        let mut net = self.net_for(&origin).await;
        let outcome = ppo_update(&mut net, &mut state.adam, &self.ppo_config(), &batch);
        if outcome.applied {
            self.training_steps.fetch_add(1, Ordering::Relaxed);
            self.publish(&origin, net).await;
        } else {
            self.discarded_updates.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Discarded non-finite training step for {:?} (loss {})",
                origin, outcome.loss
            );
        }
        Some(outcome)
    }

    async fn net_for(&self, origin: &ParamOrigin) -> Network {
        match origin {
            ParamOrigin::Shared => self.shared.read().await.net.clone(),
            ParamOrigin::Personal(uuid) => match self.personal.read().await.get(uuid) {
                Some(set) => set.net.clone(),
                None => self.shared.read().await.net.clone(),
            },
        }
    }

    async fn publish(&self, origin: &ParamOrigin, net: Network) {
        match origin {
            ParamOrigin::Shared => {
                let mut shared = self.shared.write().await;
                let version = shared.version + 1;
                *shared = Arc::new(ParamSet { net, version });
            }
            ParamOrigin::Personal(uuid) => {
                let mut personal = self.personal.write().await;
                let version = personal.get(uuid).map(|s| s.version + 1).unwrap_or(1);
                personal.insert(uuid.clone(), Arc::new(ParamSet { net, version }));
            }
        }
    }

    /// Persists every parameter set. Called on the save interval and during
    /// graceful shutdown; idempotent.
    pub async fn persist_all(&self) -> Result<()> {
        let dir = &self.ml.params_dir;
        {
            let shared = self.shared.read().await.clone();
            persist::save_params(&Self::shared_path(dir), &shared.net, shared.version)?;
        }
        let personal: Vec<(String, Arc<ParamSet>)> = self
            .personal
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (uuid, set) in personal {
            persist::save_params(&Self::personal_path(dir, &uuid), &set.net, set.version)?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> PolicyStats {
        PolicyStats {
            shared_version: self.shared.read().await.version,
            personal_sets: self.personal.read().await.len(),
            training_steps: self.training_steps.load(Ordering::Relaxed),
            discarded_updates: self.discarded_updates.load(Ordering::Relaxed),
            selection_steps: self.selection_steps.load(Ordering::Relaxed),
        }
    }
}

fn argmax(probs: &[f32]) -> usize {
    let mut best = 0;
    let mut best_p = f32::MIN;
    for (i, p) in probs.iter().enumerate() {
        if *p > best_p {
            best_p = *p;
            best = i;
        }
    }
    best
}

fn sample_categorical(probs: &[f32], rng: &mut StdRng) -> usize {
    if probs.is_empty() {
        return 0;
    }
    let mut u: f32 = rng.random();
    for (i, p) in probs.iter().enumerate() {
        u -= p;
        if u <= 0.0 {
            return i;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn ml(dir: &std::path::Path) -> MlConfig {
        MlConfig {
            state_dim: 16,
            action_dim: 6,
            batch_size: 8,
            min_rollout: 4,
            update_interval_ticks: 0,
            params_dir: dir.to_path_buf(),
            ..MlConfig::default()
        }
    }

    fn rollout(core_net: &Network, len: usize, reward: f32) -> Vec<Experience> {
        (0..len)
            .map(|i| {
                let state = vec![0.1 * i as f32; core_net.state_dim];
                let pass = core_net.forward(&state);
                Experience {
                    state,
                    action: i % core_net.action_dim,
                    log_prob: pass.probs[i % core_net.action_dim].max(1e-8).ln(),
                    value: pass.value,
                    reward,
                    done: i == len - 1,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn personal_overrides_shared() {
        let dir = tempdir().expect("tempdir");
        let mut rng = StdRng::seed_from_u64(1);
        let core = PolicyCore::boot(ml(dir.path()), &mut rng).expect("boot");
        let (_, origin) = core.effective("uuid-1").await;
        assert_eq!(origin, ParamOrigin::Shared);

        let personal = Network::init(16, 6, &mut rng);
        core.install_personal("uuid-1", personal).await;
        let (_, origin) = core.effective("uuid-1").await;
        assert_eq!(origin, ParamOrigin::Personal("uuid-1".to_string()));

        core.retire_personal("uuid-1").await;
        let (_, origin) = core.effective("uuid-1").await;
        assert_eq!(origin, ParamOrigin::Shared);
    }

    #[tokio::test]
    async fn training_bumps_shared_version() {
        let dir = tempdir().expect("tempdir");
        let mut rng = StdRng::seed_from_u64(2);
        let core = PolicyCore::boot(ml(dir.path()), &mut rng).expect("boot");
        assert_eq!(core.shared_version().await, 0);
        let net = core.clone_effective_net("any").await;
        let outcome = core
            .train_on(ParamOrigin::Shared, rollout(&net, 8, 1.0))
            .await
            .expect("update attempted");
        assert!(outcome.applied);
        assert_eq!(core.shared_version().await, 1);
    }

    #[tokio::test]
    async fn nan_rollout_does_not_bump_version() {
        let dir = tempdir().expect("tempdir");
        let mut rng = StdRng::seed_from_u64(3);
        let core = PolicyCore::boot(ml(dir.path()), &mut rng).expect("boot");
        let net = core.clone_effective_net("any").await;
        let mut bad = rollout(&net, 8, 1.0);
        bad[0].reward = f32::NAN;
        let outcome = core.train_on(ParamOrigin::Shared, bad).await.expect("attempted");
        assert!(!outcome.applied);
        assert_eq!(core.shared_version().await, 0);
        assert_eq!(core.stats().await.discarded_updates, 1);
    }

    #[tokio::test]
    async fn personal_training_does_not_touch_shared() {
        let dir = tempdir().expect("tempdir");
        let mut rng = StdRng::seed_from_u64(4);
        let core = PolicyCore::boot(ml(dir.path()), &mut rng).expect("boot");
        let personal = Network::init(16, 6, &mut rng);
        core.install_personal("uuid-9", personal).await;
        let net = core.clone_effective_net("uuid-9").await;
        core.train_on(
            ParamOrigin::Personal("uuid-9".to_string()),
            rollout(&net, 8, 1.0),
        )
        .await
        .expect("attempted");
        assert_eq!(core.shared_version().await, 0);
        let (set, _) = core.effective("uuid-9").await;
        assert_eq!(set.version, 2);
    }

    #[tokio::test]
    async fn persist_then_boot_restores_shared_version() {
        let dir = tempdir().expect("tempdir");
        let mut rng = StdRng::seed_from_u64(5);
        let core = PolicyCore::boot(ml(dir.path()), &mut rng).expect("boot");
        let net = core.clone_effective_net("any").await;
        core.train_on(ParamOrigin::Shared, rollout(&net, 8, 1.0))
            .await
            .expect("attempted");
        core.persist_all().await.expect("persist");

        let reborn = PolicyCore::boot(ml(dir.path()), &mut rng).expect("reboot");
        assert_eq!(reborn.shared_version().await, 1);
    }

    #[tokio::test]
    async fn boot_refuses_mismatched_schema() {
        let dir = tempdir().expect("tempdir");
        let mut rng = StdRng::seed_from_u64(6);
        let core = PolicyCore::boot(ml(dir.path()), &mut rng).expect("boot");
        core.persist_all().await.expect("persist");

        let mut wrong = ml(dir.path());
        wrong.state_dim = 32;
        assert!(PolicyCore::boot(wrong, &mut rng).is_err());
    }

    #[test]
    fn epsilon_decays_linearly_to_floor() {
        let dir = tempdir().expect("tempdir");
        let mut rng = StdRng::seed_from_u64(7);
        let mut cfg = ml(dir.path());
        cfg.epsilon_start = 1.0;
        cfg.epsilon_min = 0.1;
        cfg.epsilon_decay_steps = 100;
        let core = PolicyCore::boot(cfg, &mut rng).expect("boot");
        assert_eq!(core.epsilon(0), 1.0);
        assert!((core.epsilon(50) - 0.55).abs() < 1e-6);
        assert_eq!(core.epsilon(100), 0.1);
        assert_eq!(core.epsilon(100_000), 0.1);
    }
}
