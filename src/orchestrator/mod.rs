//! Population orchestration.
//!
//! One tokio task per live agent runs the decision tick; parallelism across
//! agents is bounded by a semaphore sized from config. Ticks for a single
//! agent are strictly ordered, the tick boundary is the error firewall, and
//! every terminal condition funnels through one death pathway into the
//! evolution manager.

use crate::actions::executor::{ActionExecutor, ActionOutcome};
use crate::actions::{ActionCatalog, ActionCategory};
use crate::bridge::protocol::{Location, SpawnAgent, WireMessage};
use crate::bridge::{BridgeEvent, FrameQuery, SensorBridge};
use crate::buffer::{Experience, ExperienceBuffer};
use crate::config::Config;
use crate::dialogue::{ContextTag, DialoguePipeline};
use crate::encoder;
use crate::evolution::{EvolutionManager, FitnessInputs, ParentCandidate};
use crate::identity::IdentityService;
use crate::memory::{
    EpisodeSummary, EpisodicKind, LineageRecord, MemoryStore, ResourceLocation, WriteOp,
};
use crate::policy::network::Network;
use crate::policy::{ParamOrigin, PolicyCore};
use crate::reward::{NearbyPeer, RewardInputs, RewardShaper, TickFlags};
use crate::util::{dist, now_ts_millis, now_ts_secs};
use anyhow::Result;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod agent;

use agent::{is_known_role, role_resource, AgentState, Lifecycle, Personality, ROLE_TAGS};

/// Per-agent experience ring size.
const BUFFER_CAPACITY: usize = 10_000;

/// Inheritance payload for an offspring spawn.
pub struct Inheritance {
    pub network: Network,
    pub personality: Personality,
    pub generation: u32,
    pub parent: String,
}

struct AgentEntry {
    death_flag: Arc<AtomicBool>,
    death_cause: Arc<Mutex<Option<String>>>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    pub active_agents: usize,
    pub ticks: u64,
    pub sanitized_fields: u64,
    pub deaths: u64,
    pub spawns: u64,
}

pub struct Orchestrator {
    config: Config,
    bridge: Arc<SensorBridge>,
    policy: Arc<PolicyCore>,
    store: Arc<MemoryStore>,
    identity: Arc<IdentityService>,
    dialogue: Arc<DialoguePipeline>,
    evolution: Arc<EvolutionManager>,
    catalog: Arc<ActionCatalog>,
    executor: ActionExecutor,
    shaper: RewardShaper,
    agents: Mutex<HashMap<String, AgentEntry>>,
    /// Read-only position snapshot shared with reward computation.
    positions: RwLock<HashMap<String, (f64, f64, f64)>>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    seed_rng: Mutex<rand::rngs::StdRng>,
    ticks: AtomicU64,
    sanitized_fields: AtomicU64,
    deaths: AtomicU64,
    spawns: AtomicU64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        bridge: Arc<SensorBridge>,
        policy: Arc<PolicyCore>,
        store: Arc<MemoryStore>,
        identity: Arc<IdentityService>,
        dialogue: Arc<DialoguePipeline>,
        evolution: Arc<EvolutionManager>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let catalog = Arc::new(ActionCatalog::new());
        let executor = ActionExecutor::new(
            bridge.clone(),
            catalog.clone(),
            Duration::from_millis(config.features.action_timeout_ms),
        );
        let shaper = RewardShaper::new(config.ml.reward.clone());
        let workers = Arc::new(Semaphore::new(config.worker_count()));
        Arc::new(Self {
            config,
            bridge,
            policy,
            store,
            identity,
            dialogue,
            evolution,
            catalog,
            executor,
            shaper,
            agents: Mutex::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            workers,
            cancel,
            seed_rng: Mutex::new(rand::rngs::StdRng::seed_from_u64(now_ts_millis())),
            ticks: AtomicU64::new(0),
            sanitized_fields: AtomicU64::new(0),
            deaths: AtomicU64::new(0),
            spawns: AtomicU64::new(0),
        })
    }

    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            active_agents: self.agents.lock().await.len(),
            ticks: self.ticks.load(Ordering::Relaxed),
            sanitized_fields: self.sanitized_fields.load(Ordering::Relaxed),
            deaths: self.deaths.load(Ordering::Relaxed),
            spawns: self.spawns.load(Ordering::Relaxed),
        }
    }

    /// Brings the population up to target in batches, then listens for
    /// bridge lifecycle events until cancelled.
    pub async fn run(self: &Arc<Self>) {
        let target = self.config.population.target_agents;
        let batch = self.config.population.spawn_batch_size.max(1);
        let delay = Duration::from_millis(self.config.population.spawn_batch_delay_ms);
        let mut spawned = 0usize;
        while spawned < target && !self.cancel.is_cancelled() {
            for _ in 0..batch.min(target - spawned) {
                let role = self.pick_role().await;
                if let Err(e) = self.spawn_agent(&role, None).await {
                    warn!("Initial spawn failed: {e}");
                }
                spawned += 1;
            }
            if spawned < target {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => return,
                }
            }
        }

        self.event_loop().await;
    }

    async fn pick_role(&self) -> String {
        let mut rng = self.seed_rng.lock().await;
        ROLE_TAGS
            .choose(&mut *rng)
            .copied()
            .unwrap_or("wanderer")
            .to_string()
    }

    async fn event_loop(self: &Arc<Self>) {
        let mut events = self.bridge.subscribe();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Ok(BridgeEvent::AgentDeath(death)) => {
                            let agents = self.agents.lock().await;
                            if let Some(entry) = agents.get(&death.name) {
                                *entry.death_cause.lock().await = Some(death.cause.clone());
                                entry.death_flag.store(true, Ordering::SeqCst);
                            }
                        }
                        Ok(BridgeEvent::SpawnConfirm(confirm)) => {
                            debug!("Spawn confirmed for {}", confirm.name);
                        }
                        Ok(BridgeEvent::ServerShutdown) | Ok(BridgeEvent::ReconnectFailed) => {
                            info!("Bridge terminal event, shutting the population down");
                            self.cancel.cancel();
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Orchestrator lagged {n} bridge events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Spawns one agent, optionally from an inheritance payload. Refuses
    /// above the population maximum.
    pub fn spawn_agent<'a>(
        self: &'a Arc<Self>,
        role: &'a str,
        inheritance: Option<Inheritance>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
        let role = if is_known_role(role) { role } else { "wanderer" };
        {
            let agents = self.agents.lock().await;
            if agents.len() >= self.config.population.max_agents {
                anyhow::bail!(
                    "population at maximum ({}), refusing spawn",
                    self.config.population.max_agents
                );
            }
        }

        let identity = self.identity.acquire(role).await;
        let now = now_ts_millis();
        let seed = {
            let mut rng = self.seed_rng.lock().await;
            rng.random::<u64>()
        };

        let (personality, generation, parent) = match &inheritance {
            Some(inherited) => (
                inherited.personality,
                inherited.generation,
                Some(inherited.parent.clone()),
            ),
            None => {
                let mut rng = self.seed_rng.lock().await;
                (Personality::random(&mut *rng), 1, None)
            }
        };
        if let Some(inherited) = inheritance {
            self.policy
                .install_personal(&identity.uuid, inherited.network)
                .await;
        }

        self.bridge.register(&identity.name).await;
        let spawn_msg = WireMessage::SpawnAgent(SpawnAgent {
            name: identity.name.clone(),
            agent_type: role.to_string(),
            location: Location {
                x: 0.0,
                y: 64.0,
                z: 0.0,
                yaw: 0.0,
                pitch: 0.0,
                world: "overworld".to_string(),
            },
            skin: None,
        });
        if let Err(e) = self.bridge.send(spawn_msg) {
            warn!("Spawn message for {} not queued: {e}", identity.name);
        }

        if let Err(e) = self.store.register_lineage(LineageRecord {
            agent: identity.name.clone(),
            agent_uuid: identity.uuid.clone(),
            parent: parent.clone(),
            generation,
            birth_ts: now_ts_secs(),
            death_ts: None,
            final_fitness: None,
        }) {
            warn!("Lineage registration failed for {}: {e}", identity.name);
        }
        if let Err(e) = self.store.record_agent_type(&identity.name, role) {
            warn!("Type record failed for {}: {e}", identity.name);
        }
        self.store.enqueue(WriteOp::Episodic {
            agent: identity.name.clone(),
            kind: EpisodicKind::Spawn,
            description: format!("spawned as {role} generation {generation}"),
            outcome: "ok".to_string(),
            reward: 0.0,
            pos: None,
        });

        let state = AgentState::spawn(
            &identity.name,
            &identity.uuid,
            role,
            generation,
            parent,
            personality,
            now,
            seed,
        );
        let death_flag = Arc::new(AtomicBool::new(false));
        let death_cause = Arc::new(Mutex::new(None));
        let orch = self.clone();
        let flag = death_flag.clone();
        let cause = death_cause.clone();
        let handle = tokio::spawn(async move {
            orch.agent_loop(state, flag, cause).await;
        });

        self.agents.lock().await.insert(
            identity.name.clone(),
            AgentEntry {
                death_flag,
                death_cause,
                handle,
            },
        );
        self.spawns.fetch_add(1, Ordering::Relaxed);
        info!("Spawned {} ({role}, gen {generation})", identity.name);
        Ok(identity.name)
        })
    }

    /// The per-agent task: strictly ordered ticks until a terminal
    /// condition, then the death pathway.
    async fn agent_loop(
        self: Arc<Self>,
        mut state: AgentState,
        death_flag: Arc<AtomicBool>,
        death_cause: Arc<Mutex<Option<String>>>,
    ) {
        let tick_interval = Duration::from_millis(self.config.population.tick_interval_ms.max(50));
        let mut buffer = ExperienceBuffer::new(BUFFER_CAPACITY);
        state.lifecycle = Lifecycle::Active;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick_interval) => {}
                _ = self.cancel.cancelled() => break,
            }

            if death_flag.load(Ordering::SeqCst) {
                state.lifecycle = Lifecycle::Dying;
            }

            if state.lifecycle == Lifecycle::Dying {
                break;
            }

            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let result = self.run_tick(&mut state, &mut buffer).await;
            drop(permit);
            self.ticks.fetch_add(1, Ordering::Relaxed);

            match result {
                Ok(()) => {}
                Err(e) => {
                    // Integrity faults abort this agent's task only; the
                    // rest of the population keeps running.
                    error!("{}: tick aborted: {e:#}", state.name);
                    state.lifecycle = Lifecycle::Dying;
                }
            }
        }

        // Flush whatever the buffer still holds, then run the death pathway
        // unless this is a process shutdown.
        self.flush_buffer(&state, &mut buffer).await;
        if state.lifecycle == Lifecycle::Dying && !self.cancel.is_cancelled() {
            let cause = death_cause.lock().await.take();
            self.death_pathway(state, cause).await;
        } else {
            self.positions.write().await.remove(&state.name);
        }
    }

    async fn run_tick(
        self: &Arc<Self>,
        state: &mut AgentState,
        buffer: &mut ExperienceBuffer,
    ) -> Result<()> {
        let now = now_ts_millis();

        // 1. Latest frame; a stale or missing frame only accumulates idle.
        let frame = match self.bridge.latest(&state.name).await {
            FrameQuery::Fresh(frame) => frame,
            FrameQuery::Stale(_) | FrameQuery::None => {
                state.idle_ms = now.saturating_sub(state.last_action_ms);
                return Ok(());
            }
        };
        self.positions
            .write()
            .await
            .insert(state.name.clone(), frame.update.location.pos());

        // 2. Memory context.
        let context = self.store.context_for(
            &state.name,
            self.config.memory.recent_limit,
            Some(frame.update.location.pos()),
            role_resource(&state.role),
        );

        // 3. Encode.
        let encoded = encoder::encode(&state.snapshot(), Some(&frame), &context);
        if encoded.sanitized_fields > 0 {
            self.sanitized_fields
                .fetch_add(encoded.sanitized_fields as u64, Ordering::Relaxed);
        }

        // 4. Select. A stuck agent gets a forced random move instead.
        let (mut choice, origin) = self
            .policy
            .select_action(&state.uuid, &encoded.vector, &mut state.rng)
            .await;
        if state.stuck && self.config.features.unstuck_detection {
            if let Some(def) = self.catalog.by_name("random_move") {
                // Forced moves are off-policy; record them with a uniform
                // log-prob so the ratio stays bounded.
                choice.action = def.index;
                choice.log_prob = (1.0 / self.config.ml.action_dim as f32).ln();
            }
        }

        // 5. Execute against the hub.
        let outcome = self.executor.execute(&state.name, choice.action, &frame).await?;
        let def = self
            .catalog
            .get(choice.action)
            .ok_or_else(|| anyhow::anyhow!("action {} vanished from catalog", choice.action))?;

        // 6. Observe the post-action frame.
        let was_stuck = state.stuck;
        let new_chunk = match &outcome.frame_after {
            Some(after) => state.observe_frame(
                after,
                def.is_movement,
                self.config.features.stuck_radius,
                self.config.features.stuck_ticks,
            ),
            None => false,
        };
        let stuck_triggered = !was_stuck && state.stuck;

        // 7. Price the tick.
        let first_craft = matches!(
            outcome.category,
            ActionCategory::Craft | ActionCategory::AdvancedCraft
        ) && state.note_first_crafts(&outcome.items_gained);
        let completed_tasks = if outcome.success {
            state.tasks.on_success(def.name)
        } else {
            Vec::new()
        };
        let idle_breach = self.config.features.idle_penalty
            && state.idle_ms >= self.config.features.idle_threshold_ms;

        let reward_death = state.cumulative_reward < self.config.features.death_threshold;
        let health_death = outcome
            .frame_after
            .as_ref()
            .map(|f| f.update.health <= 0.0)
            .unwrap_or(false);
        let died = reward_death || health_death;

        let peers = self.nearby_peers(state, &context.bonds).await;
        let flags = TickFlags {
            entered_new_chunk: new_chunk,
            first_craft,
            task_completed: !completed_tasks.is_empty(),
            idle_breach,
            stuck_triggered,
            died,
        };
        let breakdown = self.shaper.compute(&RewardInputs {
            outcome: &outcome,
            health: state.health,
            needs: &state.needs,
            personality: &state.personality,
            peers: &peers,
            flags,
        });

        // 8. Record the experience in tick order.
        buffer.push(Experience {
            state: encoded.vector,
            action: choice.action,
            log_prob: choice.log_prob,
            value: choice.value,
            reward: breakdown.total,
            done: died,
        });

        // 9. Bookkeeping.
        state.apply_tick(
            outcome.category,
            outcome.success,
            breakdown.total,
            peers.len(),
            now,
            self.config.population.tick_interval_ms,
        );
        if idle_breach {
            // One penalty unit per breach; the clock restarts.
            state.last_action_ms = now;
            state.idle_ms = 0;
        }
        self.record_side_effects(state, &outcome, &completed_tasks, &frame.update.location)
            .await;

        // 10. Flush closed episodes to the trainer.
        if died || buffer.closed_len() >= self.config.ml.batch_size {
            self.flush_episodes(state, buffer, origin).await;
        }

        if died {
            info!(
                "{} terminal (reward {:.1}, threshold {})",
                state.name, state.cumulative_reward, self.config.features.death_threshold
            );
            state.lifecycle = Lifecycle::Dying;
        }
        Ok(())
    }

    async fn nearby_peers(
        &self,
        state: &AgentState,
        bonds: &HashMap<String, f32>,
    ) -> Vec<NearbyPeer> {
        let Some(my_pos) = state.last_position else {
            return Vec::new();
        };
        let positions = self.positions.read().await;
        let mut peers = Vec::new();
        for (name, pos) in positions.iter() {
            if name == &state.name {
                continue;
            }
            let bond = bonds.get(name).copied().unwrap_or(0.0);
            let distance = dist(my_pos, *pos);
            if distance <= self.shaper.weights().social_radius {
                peers.push(NearbyPeer {
                    name: name.clone(),
                    distance,
                    bond,
                });
            }
        }
        peers
    }

    async fn record_side_effects(
        &self,
        state: &mut AgentState,
        outcome: &ActionOutcome,
        completed_tasks: &[&'static str],
        location: &Location,
    ) {
        if outcome.success {
            self.store.enqueue(WriteOp::Episodic {
                agent: state.name.clone(),
                kind: if completed_tasks.is_empty() {
                    EpisodicKind::ActionSuccess
                } else {
                    EpisodicKind::Task
                },
                description: format!(
                    "{} ({:?})",
                    self.catalog
                        .get(outcome.action_index)
                        .map(|d| d.name)
                        .unwrap_or("unknown"),
                    outcome.category
                ),
                outcome: "success".to_string(),
                reward: 0.0,
                pos: Some(location.pos()),
            });
        }

        // Resource discoveries feed the shared knowledge database.
        if outcome.success && outcome.category == ActionCategory::Resource {
            for (name, _) in &outcome.items_gained {
                self.store.enqueue(WriteOp::Resource(ResourceLocation {
                    kind: name.clone(),
                    x: location.x,
                    y: location.y,
                    z: location.z,
                    recorded_by: state.name.clone(),
                    ts: now_ts_secs(),
                }));
            }
        }

        // Social actions strengthen bonds with the nearest peer and may
        // speak through the dialogue pipeline.
        if outcome.success && outcome.category == ActionCategory::Communication {
            let listener = {
                let positions = self.positions.read().await;
                let my_pos = state.last_position.unwrap_or((location.x, location.y, location.z));
                positions
                    .iter()
                    .filter(|(name, _)| name.as_str() != state.name)
                    .min_by(|a, b| dist(my_pos, *a.1).total_cmp(&dist(my_pos, *b.1)))
                    .map(|(name, _)| name.clone())
            };
            if let Some(listener) = listener {
                self.store.enqueue(WriteOp::Relationship {
                    a: state.name.clone(),
                    b: listener.clone(),
                    bond_delta: 0.05,
                    trust_delta: 0.01,
                    kind: crate::memory::InteractionKind::Chat,
                });
                let tag = match self
                    .catalog
                    .get(outcome.action_index)
                    .map(|d| d.name)
                    .unwrap_or("")
                {
                    "chat_greet" => ContextTag::Greeting,
                    "chat_call_help" => ContextTag::CallForHelp,
                    "chat_share_location" => ContextTag::ShareLocation,
                    _ => ContextTag::Ambient,
                };
                self.dialogue
                    .enqueue_tagged(&state.name, &listener, tag)
                    .await;
            }
        }
    }

    async fn flush_episodes(
        &self,
        state: &AgentState,
        buffer: &mut ExperienceBuffer,
        origin: ParamOrigin,
    ) {
        for episode in buffer.take_closed() {
            let total: f32 = episode.iter().map(|e| e.reward).sum();
            self.store.enqueue(WriteOp::EpisodeSummary(EpisodeSummary {
                agent: state.name.clone(),
                steps: episode.len(),
                total_reward: total,
                ts: now_ts_secs(),
            }));
            self.policy.train_on(origin.clone(), episode).await;
        }
    }

    async fn flush_buffer(&self, state: &AgentState, buffer: &mut ExperienceBuffer) {
        let (_, origin) = self.policy.effective(&state.uuid).await;
        self.flush_episodes(state, buffer, origin).await;
    }

    /// Fitness, lineage close, bookkeeping teardown, and the offspring
    /// decision.
    async fn death_pathway(self: &Arc<Self>, state: AgentState, cause: Option<String>) {
        self.deaths.fetch_add(1, Ordering::Relaxed);
        let fitness = self.evolution.fitness(&FitnessInputs {
            cumulative_reward: state.cumulative_reward,
            survival_ticks: state.survival_ticks,
            completed_tasks: state.tasks.completed,
            explored_chunks: state.visited_chunks.len() as u32,
            final_health: state.health,
        });
        info!(
            "{} died ({}) fitness {fitness:.1}",
            state.name,
            cause.as_deref().unwrap_or("reward_threshold")
        );

        if let Err(e) = self
            .store
            .close_lineage(&state.name, now_ts_secs(), fitness)
        {
            warn!("Lineage close failed for {}: {e}", state.name);
        }
        self.store.enqueue(WriteOp::Episodic {
            agent: state.name.clone(),
            kind: EpisodicKind::Death,
            description: cause.clone().unwrap_or_else(|| "reward threshold".to_string()),
            outcome: format!("fitness {fitness:.1}"),
            reward: -1.0,
            pos: state.last_position,
        });

        let network = self.policy.clone_effective_net(&state.uuid).await;
        self.evolution
            .record_death(ParentCandidate {
                name: state.name.clone(),
                agent_type: state.role.clone(),
                generation: state.generation,
                fitness,
                network,
                personality: state.personality,
            })
            .await;

        self.policy.retire_personal(&state.uuid).await;
        self.identity.release(&state.name).await;
        self.bridge.unregister(&state.name).await;
        let _ = self.bridge.send(WireMessage::RemoveAgent {
            name: state.name.clone(),
            reason: cause.unwrap_or_else(|| "died".to_string()),
        });
        self.positions.write().await.remove(&state.name);
        self.agents.lock().await.remove(&state.name);

        // Offspring decision.
        let population = self.agents.lock().await.len();
        let should_spawn = {
            let mut rng = self.seed_rng.lock().await;
            self.evolution.should_spawn(
                population,
                self.config.population.max_agents,
                self.config.population.target_agents,
                &mut *rng,
            )
        };
        if !should_spawn || self.cancel.is_cancelled() {
            return;
        }
        let inheritance = {
            let mut rng = self.seed_rng.lock().await;
            match self.evolution.select_parent(&state.role, &mut *rng).await {
                Some(parent) => {
                    let (network, personality, generation) =
                        self.evolution.make_offspring(&parent, &mut *rng);
                    Some(Inheritance {
                        network,
                        personality,
                        generation,
                        parent: parent.name,
                    })
                }
                None => None,
            }
        };
        let role = state.role.clone();
        let orch = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orch.spawn_agent(&role, inheritance).await {
                warn!("Offspring spawn failed: {e}");
            }
        });
    }

    /// Graceful drain: stop new ticks, give in-flight ones a grace window,
    /// flush and persist. Safe to call twice.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut agents = self.agents.lock().await;
            agents.drain().map(|(_, entry)| entry.handle).collect()
        };
        for handle in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Agent task exceeded shutdown grace window");
            }
        }
        if let Err(e) = self.policy.persist_all().await {
            error!("Parameter persistence on shutdown failed: {e}");
        }
        self.bridge.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dialogue::{generator::ChatGenerator, ChatSink};
    use tempfile::tempdir;

    async fn harness() -> (Arc<Orchestrator>, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let mut config = Config::default();
        config.memory.database_path = dir.path().join("memory.redb");
        config.memory.knowledge_database_path = dir.path().join("knowledge.redb");
        config.ml.params_dir = dir.path().join("params");
        config.ml.state_dim = crate::encoder::STATE_DIM;
        config.ml.action_dim = crate::actions::ACTION_DIM;
        config.population.target_agents = 2;
        config.population.max_agents = 3;
        config.features.action_timeout_ms = 30;
        config.population.tick_interval_ms = 50;

        let store = MemoryStore::open(
            &config.memory.database_path,
            &config.memory.knowledge_database_path,
            0.99,
            0.05,
        )
        .expect("store");
        let bridge = SensorBridge::new(config.sensor.clone());
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let policy =
            Arc::new(PolicyCore::boot(config.ml.clone(), &mut rng).expect("policy"));
        let identity = Arc::new(IdentityService::new(config.identity.clone(), store.clone()));
        let dialogue = DialoguePipeline::new(
            config.dialogue.clone(),
            ChatGenerator::Template,
            store.clone(),
            ChatSink::Bridge(bridge.clone()),
        );
        let evolution = Arc::new(EvolutionManager::new(
            config.evolution.clone(),
            config.personality.clone(),
        ));
        let orch = Orchestrator::new(
            config,
            bridge,
            policy,
            store,
            identity,
            dialogue,
            evolution,
            CancellationToken::new(),
        );
        (orch, dir)
    }

    #[tokio::test]
    async fn spawn_registers_identity_and_lineage() {
        let (orch, _dir) = harness().await;
        let name = orch.spawn_agent("miner", None).await.expect("spawn");
        assert!(name.starts_with("miner_"));
        assert_eq!(orch.stats().await.active_agents, 1);
        let lineage = orch.store.lineage_of(&name).expect("lineage");
        assert_eq!(lineage.generation, 1);
        assert!(lineage.parent.is_none());
        orch.shutdown(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn unknown_role_falls_back_to_wanderer() {
        let (orch, _dir) = harness().await;
        let name = orch.spawn_agent("astronaut", None).await.expect("spawn");
        assert!(name.starts_with("wanderer_"));
        orch.shutdown(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn population_maximum_refuses_spawns() {
        let (orch, _dir) = harness().await;
        for _ in 0..3 {
            orch.spawn_agent("miner", None).await.expect("spawn");
        }
        assert!(orch.spawn_agent("miner", None).await.is_err());
        assert_eq!(orch.stats().await.active_agents, 3);
        orch.shutdown(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn inherited_spawn_installs_personal_parameters() {
        let (orch, _dir) = harness().await;
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let network = Network::init(
            crate::encoder::STATE_DIM,
            crate::actions::ACTION_DIM,
            &mut rng,
        );
        let name = orch
            .spawn_agent(
                "miner",
                Some(Inheritance {
                    network,
                    personality: Personality::default(),
                    generation: 4,
                    parent: "miner_ancestor".to_string(),
                }),
            )
            .await
            .expect("spawn");
        let uuid = orch
            .store
            .uuid_for_name(&name)
            .expect("uuid persisted");
        let (_, origin) = orch.policy.effective(&uuid).await;
        assert_eq!(origin, ParamOrigin::Personal(uuid.clone()));
        let lineage = orch.store.lineage_of(&name).expect("lineage");
        assert_eq!(lineage.generation, 4);
        assert_eq!(lineage.parent.as_deref(), Some("miner_ancestor"));
        orch.shutdown(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (orch, _dir) = harness().await;
        orch.spawn_agent("miner", None).await.expect("spawn");
        orch.shutdown(Duration::from_millis(500)).await;
        let stats_once = orch.policy.stats().await;
        orch.shutdown(Duration::from_millis(500)).await;
        let stats_twice = orch.policy.stats().await;
        assert_eq!(stats_once.shared_version, stats_twice.shared_version);
        assert_eq!(orch.stats().await.active_agents, 0);
    }
}
