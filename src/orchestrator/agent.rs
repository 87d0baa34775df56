//! Per-agent state.
//!
//! `AgentState` is owned exclusively by the agent's orchestrator task; other
//! components see it only through the read-only `AgentSnapshot` or by
//! identity. The external bot framework is never reached through this type.

use crate::actions::{ActionCategory, CATEGORY_COUNT};
use crate::bridge::protocol::ObservationFrame;
use crate::util::dist;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Closed set of role tags. The tag picks the identity prefix, the default
/// goal bias, and the resource kind an agent keeps an eye out for.
pub const ROLE_TAGS: [&str; 30] = [
    "miner",
    "lumberjack",
    "farmer",
    "guard",
    "hunter",
    "fisher",
    "builder",
    "crafter",
    "smith",
    "trader",
    "explorer",
    "scout",
    "shepherd",
    "butcher",
    "baker",
    "brewer",
    "enchanter",
    "librarian",
    "cartographer",
    "mason",
    "carpenter",
    "rancher",
    "warrior",
    "archer",
    "medic",
    "courier",
    "digger",
    "gatherer",
    "tinkerer",
    "wanderer",
];

pub fn is_known_role(role: &str) -> bool {
    ROLE_TAGS.contains(&role)
}

/// The resource kind this role tracks in the knowledge database.
pub fn role_resource(role: &str) -> Option<&'static str> {
    match role {
        "miner" | "digger" | "smith" => Some("iron_ore"),
        "lumberjack" | "carpenter" => Some("oak_log"),
        "farmer" | "baker" => Some("wheat"),
        "mason" => Some("stone"),
        "enchanter" | "librarian" => Some("diamond_ore"),
        _ => None,
    }
}

fn role_goal_bias(role: &str) -> Goal {
    match role {
        "miner" | "digger" | "smith" | "mason" => Goal::Mine,
        "lumberjack" | "gatherer" | "fisher" | "hunter" => Goal::Gather,
        "builder" | "carpenter" | "crafter" | "tinkerer" => Goal::Build,
        "trader" | "shepherd" | "butcher" | "baker" | "brewer" | "medic" | "courier" => {
            Goal::Socialize
        }
        "explorer" | "scout" | "cartographer" | "wanderer" => Goal::Explore,
        _ => Goal::Survive,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Personality {
    pub bravery: f32,
    pub curiosity: f32,
    pub sociability: f32,
    pub diligence: f32,
    pub aggression: f32,
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            bravery: 0.5,
            curiosity: 0.5,
            sociability: 0.5,
            diligence: 0.5,
            aggression: 0.5,
        }
    }
}

impl Personality {
    pub fn random(rng: &mut StdRng) -> Self {
        Self {
            bravery: rng.random(),
            curiosity: rng.random(),
            sociability: rng.random(),
            diligence: rng.random(),
            aggression: rng.random(),
        }
    }

    pub fn as_array(&self) -> [f32; 5] {
        [
            self.bravery,
            self.curiosity,
            self.sociability,
            self.diligence,
            self.aggression,
        ]
    }

    /// Independent per-trait mutation; traits stay in [0, 1].
    pub fn mutated(&self, rate: f32, sigma: f32, rng: &mut StdRng) -> Self {
        let mut traits = self.as_array();
        for t in traits.iter_mut() {
            if rng.random::<f32>() < rate {
                let noise: f32 = (rng.random::<f32>() - 0.5) * 2.0 * sigma;
                *t = (*t + noise).clamp(0.0, 1.0);
            }
        }
        Self {
            bravery: traits[0],
            curiosity: traits[1],
            sociability: traits[2],
            diligence: traits[3],
            aggression: traits[4],
        }
    }
}

/// Homeostatic needs in [0, 1]; low is urgent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Needs {
    pub food: f32,
    pub safety: f32,
    pub social: f32,
    pub rest: f32,
}

impl Default for Needs {
    fn default() -> Self {
        Self {
            food: 1.0,
            safety: 1.0,
            social: 1.0,
            rest: 1.0,
        }
    }
}

impl Needs {
    /// Passive decay per tick; social and rest sag over time, food tracks
    /// the hunger bar, safety tracks nearby hostiles (set in
    /// `observe_frame`).
    fn decay(&mut self, dt_ms: u64) {
        let dt = dt_ms as f32 / 1000.0;
        self.social = (self.social - 0.002 * dt).clamp(0.0, 1.0);
        self.rest = (self.rest - 0.001 * dt).clamp(0.0, 1.0);
    }

    pub fn most_urgent(&self) -> (&'static str, f32) {
        let axes = [
            ("food", self.food),
            ("safety", self.safety),
            ("social", self.social),
            ("rest", self.rest),
        ];
        axes.into_iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or(("food", 1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Mood {
    pub valence: f32,
    pub arousal: f32,
    pub fear: f32,
    pub boredom: f32,
    pub social_satisfaction: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goal {
    Survive,
    Eat,
    Gather,
    Mine,
    Build,
    Socialize,
    Explore,
    Rest,
}

impl Goal {
    pub const COUNT: usize = 8;

    pub fn index(self) -> usize {
        match self {
            Goal::Survive => 0,
            Goal::Eat => 1,
            Goal::Gather => 2,
            Goal::Mine => 3,
            Goal::Build => 4,
            Goal::Socialize => 5,
            Goal::Explore => 6,
            Goal::Rest => 7,
        }
    }
}

/// Need-driven goal with a role bias when nothing is urgent.
pub fn derive_goal(needs: &Needs, role: &str) -> Goal {
    let (axis, level) = needs.most_urgent();
    if level < 0.35 {
        return match axis {
            "food" => Goal::Eat,
            "safety" => Goal::Survive,
            "social" => Goal::Socialize,
            _ => Goal::Rest,
        };
    }
    role_goal_bias(role)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Spawning,
    Active,
    Dying,
    Dead,
}

/// A named sequence of successful actions rewarded as a unit.
#[derive(Debug, Clone)]
pub struct EmergentTask {
    pub name: &'static str,
    pub sequence: &'static [&'static str],
}

pub const EMERGENT_TASKS: [EmergentTask; 4] = [
    EmergentTask {
        name: "gather_wood",
        sequence: &["chop_wood", "chop_wood", "chop_wood"],
    },
    EmergentTask {
        name: "tool_up",
        sequence: &["chop_wood", "craft_planks", "craft_wooden_pickaxe"],
    },
    EmergentTask {
        name: "iron_age",
        sequence: &["mine_iron", "smelt_iron", "craft_iron_pickaxe"],
    },
    EmergentTask {
        name: "homestead",
        sequence: &["till_soil", "plant_seeds", "harvest_crops"],
    },
];

/// Tracks progress through the task catalog. Matching is by ordered
/// subsequence: a successful action advances every task expecting it and
/// leaves the rest untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    progress: HashMap<&'static str, usize>,
    pub completed: u32,
}

impl TaskTracker {
    pub fn on_success(&mut self, action_name: &str) -> Vec<&'static str> {
        let mut finished = Vec::new();
        for task in &EMERGENT_TASKS {
            let cursor = self.progress.entry(task.name).or_insert(0);
            if task.sequence.get(*cursor) == Some(&action_name) {
                *cursor += 1;
                if *cursor >= task.sequence.len() {
                    *cursor = 0;
                    self.completed += 1;
                    finished.push(task.name);
                }
            }
        }
        finished
    }
}

/// Read-only projection consumed by the encoder and the reward shaper.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub name: String,
    pub last_position: Option<(f64, f64, f64)>,
    pub needs: Needs,
    pub mood: Mood,
    pub personality: Personality,
    pub goal: Goal,
    pub category_success: [f32; CATEGORY_COUNT],
    pub idle_ms: u64,
    pub stuck: bool,
}

impl AgentSnapshot {
    /// A blank snapshot; used at spawn and by tests.
    pub fn neutral(name: &str, goal: Goal) -> Self {
        Self {
            name: name.to_string(),
            last_position: None,
            needs: Needs::default(),
            mood: Mood::default(),
            personality: Personality::default(),
            goal,
            category_success: [0.0; CATEGORY_COUNT],
            idle_ms: 0,
            stuck: false,
        }
    }
}

/// Everything the orchestrator task owns for one live agent.
pub struct AgentState {
    pub name: String,
    pub uuid: String,
    pub role: String,
    pub generation: u32,
    pub parent: Option<String>,
    pub lifecycle: Lifecycle,
    pub spawned_at_ms: u64,
    pub last_action_ms: u64,
    pub idle_ms: u64,
    pub cumulative_reward: f32,
    pub survival_ticks: u64,
    pub health: f32,
    pub food: f32,
    pub last_position: Option<(f64, f64, f64)>,
    pub visited_chunks: HashSet<(i32, i32)>,
    pub crafted: HashSet<String>,
    category_attempts: [u32; CATEGORY_COUNT],
    category_successes: [u32; CATEGORY_COUNT],
    pub personality: Personality,
    pub needs: Needs,
    pub mood: Mood,
    pub goal: Goal,
    stuck_streak: u32,
    pub stuck: bool,
    pub tasks: TaskTracker,
    pub rng: StdRng,
}

impl AgentState {
    pub fn spawn(
        name: &str,
        uuid: &str,
        role: &str,
        generation: u32,
        parent: Option<String>,
        personality: Personality,
        now_ms: u64,
        seed: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            uuid: uuid.to_string(),
            role: role.to_string(),
            generation,
            parent,
            lifecycle: Lifecycle::Spawning,
            spawned_at_ms: now_ms,
            last_action_ms: now_ms,
            idle_ms: 0,
            cumulative_reward: 0.0,
            survival_ticks: 0,
            health: 20.0,
            food: 20.0,
            last_position: None,
            visited_chunks: HashSet::new(),
            crafted: HashSet::new(),
            category_attempts: [0; CATEGORY_COUNT],
            category_successes: [0; CATEGORY_COUNT],
            personality,
            needs: Needs::default(),
            mood: Mood::default(),
            goal: derive_goal(&Needs::default(), role),
            stuck_streak: 0,
            stuck: false,
            tasks: TaskTracker::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let mut rates = [0.0f32; CATEGORY_COUNT];
        for i in 0..CATEGORY_COUNT {
            if self.category_attempts[i] > 0 {
                rates[i] = self.category_successes[i] as f32 / self.category_attempts[i] as f32;
            }
        }
        AgentSnapshot {
            name: self.name.clone(),
            last_position: self.last_position,
            needs: self.needs,
            mood: self.mood,
            personality: self.personality,
            goal: self.goal,
            category_success: rates,
            idle_ms: self.idle_ms,
            stuck: self.stuck,
        }
    }

    /// Folds a fresh frame into vitals, needs, exploration and stuck
    /// tracking. Returns whether the frame's chunk is newly visited.
    pub fn observe_frame(
        &mut self,
        frame: &ObservationFrame,
        attempted_movement: bool,
        stuck_radius: f64,
        stuck_ticks: u32,
    ) -> bool {
        let update = &frame.update;
        self.health = update.health.clamp(0.0, 20.0);
        self.food = update.food.clamp(0.0, 20.0);

        let pos = update.location.pos();
        let chunk = ((pos.0 / 16.0).floor() as i32, (pos.2 / 16.0).floor() as i32);
        let new_chunk = self.visited_chunks.insert(chunk);

        if attempted_movement {
            let moved = self
                .last_position
                .map(|last| dist(last, pos))
                .unwrap_or(f64::MAX);
            if moved < stuck_radius {
                self.stuck_streak += 1;
            } else {
                self.stuck_streak = 0;
            }
            self.stuck = self.stuck_streak >= stuck_ticks;
        }
        self.last_position = Some(pos);

        self.needs.food = (self.food / 20.0).clamp(0.0, 1.0);
        let hostiles = update.entities.iter().filter(|e| e.hostile).count();
        self.needs.safety = match hostiles {
            0 => (self.needs.safety + 0.05).min(1.0),
            1 => 0.5,
            _ => 0.2,
        };
        self.mood.fear = (1.0 - self.needs.safety) * (1.0 - self.personality.bravery);
        new_chunk
    }

    /// Per-tick bookkeeping after the reward lands.
    pub fn apply_tick(
        &mut self,
        category: ActionCategory,
        success: bool,
        reward: f32,
        peers_nearby: usize,
        now_ms: u64,
        tick_ms: u64,
    ) {
        self.survival_ticks += 1;
        self.cumulative_reward += reward;
        let c = category.index();
        self.category_attempts[c] += 1;
        if success {
            self.category_successes[c] += 1;
            self.last_action_ms = now_ms;
            self.idle_ms = 0;
        } else {
            self.idle_ms = now_ms.saturating_sub(self.last_action_ms);
        }

        self.needs.decay(tick_ms);
        if peers_nearby > 0 {
            self.needs.social = (self.needs.social + 0.05 * peers_nearby as f32).min(1.0);
        }

        // Mood follows the reward signal with slow relaxation.
        self.mood.valence = (0.9 * self.mood.valence + 0.1 * reward.clamp(-1.0, 1.0))
            .clamp(-1.0, 1.0);
        self.mood.arousal = (0.95 * self.mood.arousal + if success { 0.0 } else { 0.05 })
            .clamp(0.0, 1.0);
        self.mood.boredom = if success {
            (self.mood.boredom - 0.2).max(0.0)
        } else {
            (self.mood.boredom + 0.02 * (1.0 - self.personality.curiosity)).min(1.0)
        };
        self.mood.social_satisfaction = self.needs.social;

        self.goal = derive_goal(&self.needs, &self.role);
    }

    /// First-time crafts this tick, recorded into the craft set.
    pub fn note_first_crafts(&mut self, gained: &[(String, u32)]) -> bool {
        let mut any = false;
        for (name, _) in gained {
            let is_tool = name.contains("pickaxe")
                || name.contains("sword")
                || name.contains("axe")
                || name.contains("shovel")
                || name.contains("hoe");
            if is_tool && self.crafted.insert(name.clone()) {
                any = true;
            }
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Location, SensorUpdate};

    fn frame(x: f64, z: f64, health: f32, food: f32) -> ObservationFrame {
        ObservationFrame {
            update: SensorUpdate {
                bot: "t".to_string(),
                ts: 1,
                location: Location {
                    x,
                    y: 64.0,
                    z,
                    yaw: 0.0,
                    pitch: 0.0,
                    world: "overworld".to_string(),
                },
                health,
                food,
                saturation: 0.0,
                oxygen: 20.0,
                xp: 0.0,
                armor: 0.0,
                blocks: vec![],
                entities: vec![],
                items: vec![],
                weather: Default::default(),
                time: 0,
                chunks: 0,
                mob_ai: vec![],
            },
            received_at_ms: 0,
        }
    }

    fn agent() -> AgentState {
        AgentState::spawn("m1", "u1", "miner", 1, None, Personality::default(), 0, 42)
    }

    #[test]
    fn new_chunk_detection_fires_once_per_chunk() {
        let mut a = agent();
        assert!(a.observe_frame(&frame(0.0, 0.0, 20.0, 20.0), false, 1.5, 10));
        assert!(!a.observe_frame(&frame(5.0, 5.0, 20.0, 20.0), false, 1.5, 10));
        assert!(a.observe_frame(&frame(20.0, 0.0, 20.0, 20.0), false, 1.5, 10));
        assert_eq!(a.visited_chunks.len(), 2);
    }

    #[test]
    fn stuck_trips_after_streak_of_immobile_movement_attempts() {
        let mut a = agent();
        a.observe_frame(&frame(0.0, 0.0, 20.0, 20.0), false, 1.5, 3);
        for _ in 0..2 {
            a.observe_frame(&frame(0.1, 0.0, 20.0, 20.0), true, 1.5, 3);
            assert!(!a.stuck);
        }
        a.observe_frame(&frame(0.1, 0.1, 20.0, 20.0), true, 1.5, 3);
        assert!(a.stuck);
        // Real displacement clears the streak.
        a.observe_frame(&frame(10.0, 0.0, 20.0, 20.0), true, 1.5, 3);
        assert!(!a.stuck);
    }

    #[test]
    fn hunger_drives_the_eat_goal() {
        let mut a = agent();
        assert_eq!(a.goal, Goal::Mine);
        a.observe_frame(&frame(0.0, 0.0, 20.0, 2.0), false, 1.5, 10);
        a.apply_tick(ActionCategory::Movement, true, 0.0, 0, 1000, 1000);
        assert_eq!(a.goal, Goal::Eat);
    }

    #[test]
    fn idle_accumulates_only_without_success() {
        let mut a = agent();
        a.apply_tick(ActionCategory::Movement, false, 0.0, 0, 7000, 1000);
        assert_eq!(a.idle_ms, 7000);
        a.apply_tick(ActionCategory::Movement, true, 0.1, 0, 8000, 1000);
        assert_eq!(a.idle_ms, 0);
        assert_eq!(a.last_action_ms, 8000);
    }

    #[test]
    fn task_tracker_requires_ordered_sequence() {
        let mut tracker = TaskTracker::default();
        assert!(tracker.on_success("craft_planks").is_empty());
        assert!(tracker.on_success("chop_wood").is_empty());
        assert!(tracker.on_success("craft_planks").is_empty());
        let done = tracker.on_success("craft_wooden_pickaxe");
        assert_eq!(done, vec!["tool_up"]);
        assert_eq!(tracker.completed, 1);
    }

    #[test]
    fn gather_wood_completes_on_three_chops() {
        let mut tracker = TaskTracker::default();
        assert!(tracker.on_success("chop_wood").is_empty());
        assert!(tracker.on_success("chop_wood").is_empty());
        let done = tracker.on_success("chop_wood");
        assert_eq!(done, vec!["gather_wood"]);
    }

    #[test]
    fn first_craft_fires_once_per_item() {
        let mut a = agent();
        assert!(a.note_first_crafts(&[("wooden_pickaxe".to_string(), 1)]));
        assert!(!a.note_first_crafts(&[("wooden_pickaxe".to_string(), 1)]));
        assert!(!a.note_first_crafts(&[("oak_log".to_string(), 4)]));
    }

    #[test]
    fn personality_mutation_stays_in_unit_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut p = Personality::default();
        for _ in 0..200 {
            p = p.mutated(1.0, 0.5, &mut rng);
            for t in p.as_array() {
                assert!((0.0..=1.0).contains(&t));
            }
        }
    }
}
