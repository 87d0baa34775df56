//! Durable agent memory.
//!
//! Two redb databases: agent memory (episodic events, relationships,
//! lineage, conversations, counters, identity assignments, experience
//! summaries, context snapshots) and world knowledge (resource locations,
//! prompt library). Rows are JSON values under composite string keys.
//!
//! Tick-path writes go through an in-process queue so disk latency never
//! bounds a decision tick; reads degrade to empty results when the store
//! misbehaves.

use crate::util::{dist, now_ts_millis, now_ts_secs};
use anyhow::Result;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EPISODIC_TABLE: TableDefinition<&str, &str> = TableDefinition::new("episodic_memories");
const RELATIONSHIPS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("relationships");
const LINEAGE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("lineage");
const CONVERSATIONS_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("player_agent_conversations");
const COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("agent_counters");
const AGENT_UUIDS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("agent_uuids");
const AGENT_TYPES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("agent_types");
const EXPERIENCES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("experiences");
const SNAPSHOTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("context_snapshots");

const RESOURCES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("resource_locations");
const PROMPTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("prompt_library");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodicKind {
    ActionSuccess,
    ActionFailure,
    Combat,
    Social,
    Chat,
    Discovery,
    Craft,
    Trade,
    Task,
    Spawn,
    Death,
}

impl EpisodicKind {
    pub fn id(self) -> u8 {
        match self {
            EpisodicKind::ActionSuccess => 0,
            EpisodicKind::ActionFailure => 1,
            EpisodicKind::Combat => 2,
            EpisodicKind::Social => 3,
            EpisodicKind::Chat => 4,
            EpisodicKind::Discovery => 5,
            EpisodicKind::Craft => 6,
            EpisodicKind::Trade => 7,
            EpisodicKind::Task => 8,
            EpisodicKind::Spawn => 9,
            EpisodicKind::Death => 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicMemory {
    pub id: u64,
    pub agent: String,
    pub kind: EpisodicKind,
    pub description: String,
    pub outcome: String,
    pub reward: f32,
    /// Decaying salience, seeded from |reward|. Prune candidate below the
    /// configured floor.
    pub strength: f32,
    pub valence: f32,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<(f64, f64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    /// Canonically ordered pair: `a < b`. Symmetry is a storage invariant,
    /// not a convention callers must remember.
    pub a: String,
    pub b: String,
    pub bond: f32,
    pub trust: f32,
    pub cooperation_count: u32,
    pub conflict_count: u32,
    pub last_interaction: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Cooperation,
    Conflict,
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageRecord {
    pub agent: String,
    pub agent_uuid: String,
    pub parent: Option<String>,
    pub generation: u32,
    pub birth_ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub death_ts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_fitness: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub speaker: String,
    pub listener: String,
    pub channel: String,
    pub text: String,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub agent: String,
    pub steps: usize,
    pub total_reward: f32,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub speaker: String,
    pub listener: String,
    pub context_tag: String,
    /// "oracle" or "template".
    pub source: String,
    pub prompt: String,
    pub response: String,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLocation {
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub recorded_by: String,
    pub ts: u64,
}

/// Compressed episodic row for the encoder's memory digest.
#[derive(Debug, Clone)]
pub struct EpisodicDigest {
    pub valence: f32,
    pub recency: f32,
    pub kind_id: u8,
    pub reward: f32,
}

/// Context handed to the encoder and the dialogue prompt builder.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub recent: Vec<EpisodicDigest>,
    /// Bond strengths of this agent's strongest relationships, by peer name.
    pub bonds: HashMap<String, f32>,
    pub nearest_resource_dist: Option<f64>,
}

/// Fire-and-forget write operations accepted from the tick path.
#[derive(Debug)]
pub enum WriteOp {
    Episodic {
        agent: String,
        kind: EpisodicKind,
        description: String,
        outcome: String,
        reward: f32,
        pos: Option<(f64, f64, f64)>,
    },
    Relationship {
        a: String,
        b: String,
        bond_delta: f32,
        trust_delta: f32,
        kind: InteractionKind,
    },
    Conversation(ConversationRecord),
    EpisodeSummary(EpisodeSummary),
    ContextSnapshot(ContextSnapshot),
    Resource(ResourceLocation),
}

pub struct MemoryStore {
    db: Database,
    knowledge: Database,
    write_tx: mpsc::UnboundedSender<WriteOp>,
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteOp>>>,
    decay_factor: f32,
    prune_floor: f32,
}

impl MemoryStore {
    pub fn open(memory_path: &Path, knowledge_path: &Path, decay_factor: f32, prune_floor: f32) -> Result<Arc<Self>> {
        for path in [memory_path, knowledge_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(memory_path)?;
        let knowledge = Database::create(knowledge_path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(EPISODIC_TABLE)?;
            let _ = write_txn.open_table(RELATIONSHIPS_TABLE)?;
            let _ = write_txn.open_table(LINEAGE_TABLE)?;
            let _ = write_txn.open_table(CONVERSATIONS_TABLE)?;
            let _ = write_txn.open_table(COUNTERS_TABLE)?;
            let _ = write_txn.open_table(AGENT_UUIDS_TABLE)?;
            let _ = write_txn.open_table(AGENT_TYPES_TABLE)?;
            let _ = write_txn.open_table(EXPERIENCES_TABLE)?;
            let _ = write_txn.open_table(SNAPSHOTS_TABLE)?;
        }
        write_txn.commit()?;

        let write_txn = knowledge.begin_write()?;
        {
            let _ = write_txn.open_table(RESOURCES_TABLE)?;
            let _ = write_txn.open_table(PROMPTS_TABLE)?;
        }
        write_txn.commit()?;

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            db,
            knowledge,
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            decay_factor,
            prune_floor,
        }))
    }

    /// Spawns the write-queue drainer and the decay job. Call once after
    /// open; the tasks stop when `cancel` fires.
    pub fn start(self: &Arc<Self>, decay_interval_ms: u64, cancel: CancellationToken) {
        let store = self.clone();
        let drain_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut rx = match store.write_rx.lock().await.take() {
                Some(rx) => rx,
                None => return,
            };
            loop {
                tokio::select! {
                    op = rx.recv() => {
                        let Some(op) = op else { break };
                        if let Err(e) = store.apply(op) {
                            warn!("Memory write failed: {e}");
                        }
                    }
                    _ = drain_cancel.cancelled() => {
                        // Drain whatever is already queued before stopping.
                        while let Ok(op) = rx.try_recv() {
                            if let Err(e) = store.apply(op) {
                                warn!("Memory write failed during drain: {e}");
                            }
                        }
                        break;
                    }
                }
            }
        });

        let store = self.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_millis(decay_interval_ms.max(1000));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match store.run_decay() {
                            Ok(pruned) if pruned > 0 => {
                                info!("Memory decay pruned {pruned} episodic rows")
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Memory decay failed: {e}"),
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Queues a write from the tick path. Never blocks, never errors; a
    /// closed queue is logged by the drainer side.
    pub fn enqueue(&self, op: WriteOp) {
        let _ = self.write_tx.send(op);
    }

    fn apply(&self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::Episodic {
                agent,
                kind,
                description,
                outcome,
                reward,
                pos,
            } => self
                .append_episodic(&agent, kind, &description, &outcome, reward, pos)
                .map(|_| ()),
            WriteOp::Relationship {
                a,
                b,
                bond_delta,
                trust_delta,
                kind,
            } => self
                .upsert_relationship(&a, &b, bond_delta, trust_delta, kind)
                .map(|_| ()),
            WriteOp::Conversation(record) => self.append_conversation(record),
            WriteOp::EpisodeSummary(summary) => self.append_episode_summary(summary),
            WriteOp::ContextSnapshot(snapshot) => self.append_context_snapshot(snapshot),
            WriteOp::Resource(location) => self.record_resource(location),
        }
    }

    fn next_counter(&self, key: &str) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let next = {
            let mut table = write_txn.open_table(COUNTERS_TABLE)?;
            let current = table.get(key)?.map(|v| v.value()).unwrap_or(0);
            let next = current + 1;
            table.insert(key, next)?;
            next
        };
        write_txn.commit()?;
        Ok(next)
    }

    // ------------------------------------------------------------------
    // episodic
    // ------------------------------------------------------------------

    pub fn append_episodic(
        &self,
        agent: &str,
        kind: EpisodicKind,
        description: &str,
        outcome: &str,
        reward: f32,
        pos: Option<(f64, f64, f64)>,
    ) -> Result<u64> {
        let id = self.next_counter("episodic_id")?;
        let memory = EpisodicMemory {
            id,
            agent: agent.to_string(),
            kind,
            description: description.to_string(),
            outcome: outcome.to_string(),
            reward,
            strength: reward.abs().max(0.1),
            valence: (reward / 5.0).clamp(-1.0, 1.0),
            ts: now_ts_millis(),
            pos,
        };
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(EPISODIC_TABLE)?;
            let key = format!("{}:{:020}", agent, id);
            let val = serde_json::to_string(&memory)?;
            table.insert(key.as_str(), val.as_str())?;
        }
        write_txn.commit()?;
        Ok(id)
    }

    /// Most recent episodic rows for `agent`, newest first. Empty on store
    /// failure.
    pub fn recent_episodic(&self, agent: &str, limit: usize) -> Vec<EpisodicMemory> {
        self.try_recent_episodic(agent, limit).unwrap_or_else(|e| {
            debug!("recent_episodic degraded to empty: {e}");
            Vec::new()
        })
    }

    fn try_recent_episodic(&self, agent: &str, limit: usize) -> Result<Vec<EpisodicMemory>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EPISODIC_TABLE)?;
        let prefix = format!("{}:", agent);
        let mut rows = Vec::new();
        for res in table.iter()? {
            let (key, val) = res?;
            if key.value().starts_with(&prefix) {
                let memory: EpisodicMemory = serde_json::from_str(val.value())?;
                rows.push(memory);
            }
        }
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(limit);
        Ok(rows)
    }

    /// Decay pass: every episodic row loses salience; rows under the floor
    /// are pruned. Runs in the background job, off the tick path.
    pub fn run_decay(&self) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let mut pruned = 0usize;
        {
            let mut table = write_txn.open_table(EPISODIC_TABLE)?;
            let mut updates: Vec<(String, Option<String>)> = Vec::new();
            for res in table.iter()? {
                let (key, val) = res?;
                let mut memory: EpisodicMemory = match serde_json::from_str(val.value()) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                memory.strength *= self.decay_factor;
                if memory.strength < self.prune_floor {
                    updates.push((key.value().to_string(), None));
                } else {
                    updates.push((key.value().to_string(), Some(serde_json::to_string(&memory)?)));
                }
            }
            for (key, update) in updates {
                match update {
                    Some(val) => {
                        table.insert(key.as_str(), val.as_str())?;
                    }
                    None => {
                        table.remove(key.as_str())?;
                        pruned += 1;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(pruned)
    }

    // ------------------------------------------------------------------
    // relationships
    // ------------------------------------------------------------------

    fn pair_key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    pub fn upsert_relationship(
        &self,
        a: &str,
        b: &str,
        bond_delta: f32,
        trust_delta: f32,
        kind: InteractionKind,
    ) -> Result<Relationship> {
        let (first, second) = Self::pair_key(a, b);
        let key = format!("{}|{}", first, second);
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(RELATIONSHIPS_TABLE)?;
            let mut rel = match table.get(key.as_str())? {
                Some(val) => serde_json::from_str(val.value())?,
                None => Relationship {
                    a: first.clone(),
                    b: second.clone(),
                    bond: 0.0,
                    trust: 0.5,
                    cooperation_count: 0,
                    conflict_count: 0,
                    last_interaction: 0,
                },
            };
            rel.bond = (rel.bond + bond_delta).clamp(-1.0, 1.0);
            rel.trust = (rel.trust + trust_delta).clamp(0.0, 1.0);
            match kind {
                InteractionKind::Cooperation => rel.cooperation_count += 1,
                InteractionKind::Conflict => rel.conflict_count += 1,
                InteractionKind::Chat => {}
            }
            rel.last_interaction = now_ts_secs();
            let val = serde_json::to_string(&rel)?;
            table.insert(key.as_str(), val.as_str())?;
            rel
        };
        write_txn.commit()?;
        Ok(updated)
    }

    /// Strongest relationships for `agent`, by |bond| descending. Empty on
    /// store failure.
    pub fn top_relationships(&self, agent: &str, limit: usize) -> Vec<Relationship> {
        self.try_top_relationships(agent, limit).unwrap_or_else(|e| {
            debug!("top_relationships degraded to empty: {e}");
            Vec::new()
        })
    }

    fn try_top_relationships(&self, agent: &str, limit: usize) -> Result<Vec<Relationship>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RELATIONSHIPS_TABLE)?;
        let mut rows = Vec::new();
        for res in table.iter()? {
            let (_key, val) = res?;
            let rel: Relationship = serde_json::from_str(val.value())?;
            if rel.a == agent || rel.b == agent {
                rows.push(rel);
            }
        }
        rows.sort_by(|x, y| y.bond.abs().total_cmp(&x.bond.abs()));
        rows.truncate(limit);
        Ok(rows)
    }

    pub fn bond_between(&self, a: &str, b: &str) -> f32 {
        let (first, second) = Self::pair_key(a, b);
        let key = format!("{}|{}", first, second);
        let lookup = || -> Result<Option<f32>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(RELATIONSHIPS_TABLE)?;
            match table.get(key.as_str())? {
                Some(val) => {
                    let rel: Relationship = serde_json::from_str(val.value())?;
                    Ok(Some(rel.bond))
                }
                None => Ok(None),
            }
        };
        lookup().ok().flatten().unwrap_or(0.0)
    }

    // ------------------------------------------------------------------
    // lineage and identity persistence
    // ------------------------------------------------------------------

    pub fn register_lineage(&self, record: LineageRecord) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LINEAGE_TABLE)?;
            let val = serde_json::to_string(&record)?;
            table.insert(record.agent.as_str(), val.as_str())?;

            let mut uuids = write_txn.open_table(AGENT_UUIDS_TABLE)?;
            uuids.insert(record.agent.as_str(), record.agent_uuid.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn close_lineage(&self, agent: &str, death_ts: u64, final_fitness: f32) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LINEAGE_TABLE)?;
            let existing = table.get(agent)?.map(|v| v.value().to_string());
            if let Some(json) = existing {
                let mut record: LineageRecord = serde_json::from_str(&json)?;
                record.death_ts = Some(death_ts);
                record.final_fitness = Some(final_fitness);
                let val = serde_json::to_string(&record)?;
                table.insert(agent, val.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn lineage_of(&self, agent: &str) -> Option<LineageRecord> {
        let lookup = || -> Result<Option<LineageRecord>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(LINEAGE_TABLE)?;
            match table.get(agent)? {
                Some(val) => Ok(Some(serde_json::from_str(val.value())?)),
                None => Ok(None),
            }
        };
        lookup().ok().flatten()
    }

    /// Returns the uuid previously assigned to `name`, if any. Assignment
    /// history survives restarts; a uuid is never reissued to a different
    /// name.
    pub fn uuid_for_name(&self, name: &str) -> Option<String> {
        let lookup = || -> Result<Option<String>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(AGENT_UUIDS_TABLE)?;
            Ok(table.get(name)?.map(|v| v.value().to_string()))
        };
        lookup().ok().flatten()
    }

    /// Persists a name→uuid assignment at acquisition time.
    pub fn record_identity(&self, name: &str, uuid: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AGENT_UUIDS_TABLE)?;
            table.insert(name, uuid)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn record_agent_type(&self, name: &str, agent_type: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AGENT_TYPES_TABLE)?;
            table.insert(name, agent_type)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Monotonic per-type counter backing generated fallback identities.
    pub fn next_name_counter(&self, type_prefix: &str) -> Result<u64> {
        self.next_counter(&format!("name:{type_prefix}"))
    }

    // ------------------------------------------------------------------
    // conversations, summaries, snapshots
    // ------------------------------------------------------------------

    pub fn append_conversation(&self, record: ConversationRecord) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONVERSATIONS_TABLE)?;
            let key = format!("{}:{:020}", record.speaker, record.ts);
            let val = serde_json::to_string(&record)?;
            table.insert(key.as_str(), val.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn recent_conversations(&self, speaker: &str, limit: usize) -> Vec<ConversationRecord> {
        let lookup = || -> Result<Vec<ConversationRecord>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(CONVERSATIONS_TABLE)?;
            let prefix = format!("{}:", speaker);
            let mut rows = Vec::new();
            for res in table.iter()? {
                let (key, val) = res?;
                if key.value().starts_with(&prefix) {
                    rows.push(serde_json::from_str(val.value())?);
                }
            }
            rows.sort_by(|a: &ConversationRecord, b: &ConversationRecord| b.ts.cmp(&a.ts));
            rows.truncate(limit);
            Ok(rows)
        };
        lookup().unwrap_or_default()
    }

    pub fn append_episode_summary(&self, summary: EpisodeSummary) -> Result<()> {
        let id = self.next_counter("experience_id")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(EXPERIENCES_TABLE)?;
            let key = format!("{}:{:020}", summary.agent, id);
            let val = serde_json::to_string(&summary)?;
            table.insert(key.as_str(), val.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn append_context_snapshot(&self, snapshot: ContextSnapshot) -> Result<()> {
        let id = self.next_counter("snapshot_id")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let key = format!("{:020}", id);
            let val = serde_json::to_string(&snapshot)?;
            table.insert(key.as_str(), val.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // knowledge database
    // ------------------------------------------------------------------

    pub fn record_resource(&self, location: ResourceLocation) -> Result<()> {
        let id = self.next_counter("resource_id")?;
        let write_txn = self.knowledge.begin_write()?;
        {
            let mut table = write_txn.open_table(RESOURCES_TABLE)?;
            let key = format!("{}:{:020}", location.kind, id);
            let val = serde_json::to_string(&location)?;
            table.insert(key.as_str(), val.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Distance from `pos` to the nearest known deposit of `kind`.
    pub fn nearest_resource(&self, kind: &str, pos: (f64, f64, f64)) -> Option<f64> {
        let lookup = || -> Result<Option<f64>> {
            let read_txn = self.knowledge.begin_read()?;
            let table = read_txn.open_table(RESOURCES_TABLE)?;
            let prefix = format!("{}:", kind);
            let mut best: Option<f64> = None;
            for res in table.iter()? {
                let (key, val) = res?;
                if !key.value().starts_with(&prefix) {
                    continue;
                }
                let loc: ResourceLocation = serde_json::from_str(val.value())?;
                let d = dist(pos, (loc.x, loc.y, loc.z));
                if best.map(|b| d < b).unwrap_or(true) {
                    best = Some(d);
                }
            }
            Ok(best)
        };
        lookup().ok().flatten()
    }

    pub fn prompt_template(&self, name: &str) -> Option<String> {
        let lookup = || -> Result<Option<String>> {
            let read_txn = self.knowledge.begin_read()?;
            let table = read_txn.open_table(PROMPTS_TABLE)?;
            Ok(table.get(name)?.map(|v| v.value().to_string()))
        };
        lookup().ok().flatten()
    }

    pub fn store_prompt_template(&self, name: &str, template: &str) -> Result<()> {
        let write_txn = self.knowledge.begin_write()?;
        {
            let mut table = write_txn.open_table(PROMPTS_TABLE)?;
            table.insert(name, template)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // context assembly
    // ------------------------------------------------------------------

    /// Builds the encoder/dialogue context for one agent: recent episodic
    /// digest, strongest bonds, and proximity to the needed resource kind.
    pub fn context_for(
        &self,
        agent: &str,
        limit: usize,
        pos: Option<(f64, f64, f64)>,
        needed_resource: Option<&str>,
    ) -> MemoryContext {
        let now = now_ts_millis();
        let recent = self
            .recent_episodic(agent, limit)
            .into_iter()
            .map(|m| {
                let age_ms = now.saturating_sub(m.ts) as f32;
                EpisodicDigest {
                    valence: m.valence,
                    recency: (1.0 - age_ms / 600_000.0).clamp(0.0, 1.0),
                    kind_id: m.kind.id(),
                    reward: m.reward,
                }
            })
            .collect();
        let bonds = self
            .top_relationships(agent, limit)
            .into_iter()
            .map(|rel| {
                let peer = if rel.a == agent { rel.b } else { rel.a };
                (peer, rel.bond)
            })
            .collect();
        let nearest_resource_dist = match (pos, needed_resource) {
            (Some(pos), Some(kind)) => self.nearest_resource(kind, pos),
            _ => None,
        };
        MemoryContext {
            recent,
            bonds,
            nearest_resource_dist,
        }
    }
}
