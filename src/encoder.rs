//! Fixed-width state encoding.
//!
//! `encode` is a pure, total projection from (agent snapshot, latest sensor
//! frame, memory context) to a `STATE_DIM`-wide vector. The slot layout below
//! is the public contract between the encoder and every persisted parameter
//! set: moving a boundary invalidates saved brains.

use crate::actions::CATEGORY_COUNT;
use crate::bridge::protocol::{BlockObs, EntityObs, ObservationFrame};
use crate::memory::MemoryContext;
use crate::orchestrator::agent::AgentSnapshot;
use crate::util::{clamp_finite, dist_sq};

/// Run-constant state width. Persisted in the parameter schema header.
pub const STATE_DIM: usize = 629;

/// Hard caps on variable-length frame inputs. Only the nearest `MAX_BLOCKS`
/// blocks and `MAX_ENTITIES` entities contribute, whatever the hub floods.
pub const MAX_BLOCKS: usize = 1000;
pub const MAX_ENTITIES: usize = 64;

/// Entities encoded individually (a subset of the capped set).
pub const ENTITY_SLOTS: usize = 24;
pub const ENTITY_FEATURES: usize = 8;
pub const BLOCK_CLASS_FEATURES: usize = 3;

/// Distances are normalized against the sensor radius, in blocks.
const RANGE: f64 = 32.0;
/// Horizontal world coordinates are squashed against this scale.
const WORLD_SCALE: f64 = 1000.0;

// Slot boundaries. Contiguous, ascending, summing to STATE_DIM; the
// layout test pins all three properties.
pub const KINEMATICS_OFF: usize = 0;
pub const KINEMATICS_LEN: usize = 8;
pub const VITALS_OFF: usize = 8;
pub const VITALS_LEN: usize = 6;
pub const ENV_OFF: usize = 14;
pub const ENV_LEN: usize = 9;
pub const INVENTORY_OFF: usize = 23;
pub const INVENTORY_LEN: usize = ITEM_CLASSES.len();
pub const EQUIPPED_OFF: usize = 119;
pub const EQUIPPED_LEN: usize = 10;
pub const BLOCKS_OFF: usize = 129;
pub const BLOCKS_LEN: usize = BLOCK_CLASSES.len() * BLOCK_CLASS_FEATURES;
pub const ENTITIES_OFF: usize = 321;
pub const ENTITIES_LEN: usize = ENTITY_SLOTS * ENTITY_FEATURES;
pub const NEEDS_OFF: usize = 513;
pub const NEEDS_LEN: usize = 16;
pub const MOOD_OFF: usize = 529;
pub const MOOD_LEN: usize = 12;
pub const MEMORY_OFF: usize = 541;
pub const MEMORY_LEN: usize = MEMORY_SLOTS * MEMORY_FEATURES;
pub const SKILLS_OFF: usize = 573;
pub const SKILLS_LEN: usize = 24;
pub const MOODLES_OFF: usize = 597;
pub const MOODLES_LEN: usize = 32;

pub const MEMORY_SLOTS: usize = 8;
pub const MEMORY_FEATURES: usize = 4;

/// The authoritative layout table: (slot name, offset, length).
pub const LAYOUT: &[(&str, usize, usize)] = &[
    ("kinematics", KINEMATICS_OFF, KINEMATICS_LEN),
    ("vitals", VITALS_OFF, VITALS_LEN),
    ("env", ENV_OFF, ENV_LEN),
    ("inventory", INVENTORY_OFF, INVENTORY_LEN),
    ("equipped", EQUIPPED_OFF, EQUIPPED_LEN),
    ("blocks", BLOCKS_OFF, BLOCKS_LEN),
    ("entities", ENTITIES_OFF, ENTITIES_LEN),
    ("needs", NEEDS_OFF, NEEDS_LEN),
    ("mood", MOOD_OFF, MOOD_LEN),
    ("memory", MEMORY_OFF, MEMORY_LEN),
    ("skills", SKILLS_OFF, SKILLS_LEN),
    ("moodles", MOODLES_OFF, MOODLES_LEN),
];

/// Block vocabulary. One summary triple (present, count, proximity) per
/// class; unknown block names fall off the vector entirely.
pub const BLOCK_CLASSES: [&str; 64] = [
    "oak_log",
    "birch_log",
    "spruce_log",
    "jungle_log",
    "acacia_log",
    "dark_oak_log",
    "oak_leaves",
    "oak_planks",
    "oak_sapling",
    "stone",
    "cobblestone",
    "mossy_cobblestone",
    "deepslate",
    "andesite",
    "diorite",
    "granite",
    "dirt",
    "grass_block",
    "sand",
    "sandstone",
    "gravel",
    "clay",
    "coal_ore",
    "iron_ore",
    "copper_ore",
    "gold_ore",
    "redstone_ore",
    "lapis_ore",
    "diamond_ore",
    "emerald_ore",
    "nether_quartz_ore",
    "obsidian",
    "bedrock",
    "water",
    "lava",
    "ice",
    "snow",
    "crafting_table",
    "furnace",
    "chest",
    "torch",
    "ladder",
    "glass",
    "wheat",
    "carrots",
    "potatoes",
    "beetroots",
    "farmland",
    "hay_block",
    "pumpkin",
    "melon",
    "sugar_cane",
    "cactus",
    "tall_grass",
    "poppy",
    "dandelion",
    "netherrack",
    "soul_sand",
    "glowstone",
    "end_stone",
    "terracotta",
    "spawner",
    "mushroom_stem",
    "amethyst_block",
];

/// Inventory vocabulary, one normalized-count slot per class.
pub const ITEM_CLASSES: [&str; 96] = [
    "oak_log",
    "oak_planks",
    "stick",
    "cobblestone",
    "stone",
    "coal",
    "charcoal",
    "raw_iron",
    "iron_ingot",
    "raw_gold",
    "gold_ingot",
    "diamond",
    "emerald",
    "redstone",
    "lapis_lazuli",
    "flint",
    "wooden_pickaxe",
    "stone_pickaxe",
    "iron_pickaxe",
    "diamond_pickaxe",
    "wooden_axe",
    "stone_axe",
    "iron_axe",
    "wooden_shovel",
    "stone_shovel",
    "iron_shovel",
    "wooden_hoe",
    "stone_hoe",
    "iron_hoe",
    "wooden_sword",
    "stone_sword",
    "iron_sword",
    "diamond_sword",
    "bow",
    "crossbow",
    "arrow",
    "shield",
    "fishing_rod",
    "flint_and_steel",
    "bucket",
    "water_bucket",
    "lava_bucket",
    "apple",
    "golden_apple",
    "bread",
    "wheat",
    "wheat_seeds",
    "carrot",
    "potato",
    "baked_potato",
    "beetroot",
    "beetroot_seeds",
    "beef",
    "cooked_beef",
    "porkchop",
    "cooked_porkchop",
    "chicken",
    "cooked_chicken",
    "mutton",
    "cooked_mutton",
    "cod",
    "cooked_cod",
    "salmon",
    "cooked_salmon",
    "rotten_flesh",
    "bone",
    "bone_meal",
    "string",
    "spider_eye",
    "gunpowder",
    "ender_pearl",
    "leather",
    "feather",
    "egg",
    "sugar",
    "sugar_cane",
    "pumpkin",
    "melon_slice",
    "torch",
    "crafting_table",
    "furnace",
    "chest",
    "ladder",
    "glass",
    "sand",
    "gravel",
    "dirt",
    "clay_ball",
    "brick",
    "paper",
    "book",
    "leather_helmet",
    "iron_helmet",
    "leather_chestplate",
    "iron_chestplate",
    "iron_boots",
];

/// Equipment flag order for the `equipped` slot.
const EQUIPMENT_KINDS: [&str; EQUIPPED_LEN] = [
    "sword",
    "pickaxe",
    "axe",
    "shovel",
    "hoe",
    "shield",
    "helmet",
    "chestplate",
    "leggings",
    "boots",
];

/// Encoded state plus sanitize bookkeeping. `sanitized_fields` counts inputs
/// that arrived non-finite and were zeroed or clamped.
#[derive(Debug, Clone)]
pub struct EncodedState {
    pub vector: Vec<f32>,
    pub sanitized_fields: u32,
}

struct Writer {
    out: Vec<f32>,
    sanitized: u32,
}

impl Writer {
    fn new() -> Self {
        Self {
            out: vec![0.0; STATE_DIM],
            sanitized: 0,
        }
    }

    fn put(&mut self, index: usize, value: f32, lo: f32, hi: f32) {
        if !value.is_finite() {
            self.sanitized += 1;
        }
        // Out-of-bounds writes are an encoder bug; drop rather than panic.
        if let Some(slot) = self.out.get_mut(index) {
            *slot = clamp_finite(value, lo, hi, 0.0);
        } else {
            debug_assert!(false, "encoder slot {index} out of range");
        }
    }

    fn put_unit(&mut self, index: usize, value: f32) {
        self.put(index, value, 0.0, 1.0);
    }

    fn put_signed(&mut self, index: usize, value: f32) {
        self.put(index, value, -1.0, 1.0);
    }

    fn put_flag(&mut self, index: usize, flag: bool) {
        self.put(index, if flag { 1.0 } else { 0.0 }, 0.0, 1.0);
    }
}

/// Normalized block name: strips a `minecraft:` style namespace if present.
fn base_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

pub fn is_food_item(name: &str) -> bool {
    matches!(
        base_name(name),
        "apple"
            | "golden_apple"
            | "bread"
            | "cooked_beef"
            | "cooked_porkchop"
            | "cooked_chicken"
            | "cooked_mutton"
            | "cooked_cod"
            | "cooked_salmon"
            | "baked_potato"
            | "carrot"
            | "beetroot"
            | "melon_slice"
    )
}

/// "axe" must not swallow "pickaxe"; everything else is a plain suffix test.
fn matches_kind(base: &str, kind: &str) -> bool {
    if kind == "axe" {
        base.ends_with("axe") && !base.ends_with("pickaxe")
    } else {
        base.ends_with(kind)
    }
}

fn block_class(name: &str) -> Option<usize> {
    let base = base_name(name);
    BLOCK_CLASSES.iter().position(|c| *c == base)
}

fn item_class(name: &str) -> Option<usize> {
    let base = base_name(name);
    ITEM_CLASSES.iter().position(|c| *c == base)
}

/// Nearest-`n` selection by Euclidean distance, ties broken by id ascending
/// so the encoding is deterministic for identical frames. O(len) selection,
/// O(n log n) ordering of the kept set.
fn nearest_blocks(blocks: &[BlockObs], origin: (f64, f64, f64), n: usize) -> Vec<&BlockObs> {
    let mut keyed: Vec<(f64, u64, &BlockObs)> = blocks
        .iter()
        .map(|b| (dist_sq(origin, (b.x, b.y, b.z)), b.id, b))
        .collect();
    let keep = n.min(keyed.len());
    if keyed.len() > keep && keep > 0 {
        keyed.select_nth_unstable_by(keep - 1, |a, b| {
            a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
        });
        keyed.truncate(keep);
    }
    keyed.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    keyed.into_iter().map(|(_, _, b)| b).collect()
}

fn nearest_entities(entities: &[EntityObs], origin: (f64, f64, f64), n: usize) -> Vec<&EntityObs> {
    let mut keyed: Vec<(f64, u64, &EntityObs)> = entities
        .iter()
        .map(|e| (dist_sq(origin, (e.x, e.y, e.z)), e.id, e))
        .collect();
    let keep = n.min(keyed.len());
    if keyed.len() > keep && keep > 0 {
        keyed.select_nth_unstable_by(keep - 1, |a, b| {
            a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
        });
        keyed.truncate(keep);
    }
    keyed.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    keyed.into_iter().map(|(_, _, e)| e).collect()
}

/// Projects one tick's inputs into the fixed layout. Total: a missing frame
/// or any malformed field contributes its neutral-zero encoding instead of
/// failing.
pub fn encode(
    snapshot: &AgentSnapshot,
    frame: Option<&ObservationFrame>,
    context: &MemoryContext,
) -> EncodedState {
    let mut w = Writer::new();

    if let Some(frame) = frame {
        encode_frame(&mut w, snapshot, frame, context);
    }
    encode_agent(&mut w, snapshot, context);

    debug_assert!(w.out.iter().all(|v| v.is_finite()));
    EncodedState {
        vector: w.out,
        sanitized_fields: w.sanitized,
    }
}

fn encode_frame(
    w: &mut Writer,
    snapshot: &AgentSnapshot,
    frame: &ObservationFrame,
    context: &MemoryContext,
) {
    let update = &frame.update;
    let origin = update.location.pos();

    // kinematics: squashed position, per-tick velocity, view direction
    w.put_signed(KINEMATICS_OFF, (update.location.x / WORLD_SCALE) as f32);
    w.put_signed(KINEMATICS_OFF + 1, (update.location.y / 256.0) as f32);
    w.put_signed(KINEMATICS_OFF + 2, (update.location.z / WORLD_SCALE) as f32);
    let (vx, vy, vz) = match snapshot.last_position {
        Some(last) => (
            origin.0 - last.0,
            origin.1 - last.1,
            origin.2 - last.2,
        ),
        None => (0.0, 0.0, 0.0),
    };
    w.put_signed(KINEMATICS_OFF + 3, (vx / 8.0) as f32);
    w.put_signed(KINEMATICS_OFF + 4, (vy / 8.0) as f32);
    w.put_signed(KINEMATICS_OFF + 5, (vz / 8.0) as f32);
    w.put_signed(KINEMATICS_OFF + 6, update.location.yaw / 180.0);
    w.put_signed(KINEMATICS_OFF + 7, update.location.pitch / 90.0);

    // vitals
    w.put_unit(VITALS_OFF, update.health / 20.0);
    w.put_unit(VITALS_OFF + 1, update.food / 20.0);
    w.put_unit(VITALS_OFF + 2, update.saturation / 20.0);
    w.put_unit(VITALS_OFF + 3, update.oxygen / 20.0);
    w.put_unit(VITALS_OFF + 4, update.xp / 100.0);
    w.put_unit(VITALS_OFF + 5, update.armor / 20.0);

    // env: day-cycle phase, weather, dimension
    let day_ticks = (update.time % 24_000) as f32;
    let phase = day_ticks / 24_000.0 * std::f32::consts::TAU;
    w.put_signed(ENV_OFF, phase.sin());
    w.put_signed(ENV_OFF + 1, phase.cos());
    w.put_flag(ENV_OFF + 2, day_ticks < 12_000.0);
    w.put_flag(ENV_OFF + 3, update.weather.raining);
    w.put_flag(ENV_OFF + 4, update.weather.thundering);
    w.put_unit(ENV_OFF + 5, ((update.time / 24_000) % 8) as f32 / 8.0);
    let world = base_name(&update.location.world);
    w.put_flag(ENV_OFF + 6, !world.contains("nether") && !world.contains("end"));
    w.put_flag(ENV_OFF + 7, world.contains("nether"));
    w.put_flag(ENV_OFF + 8, world.contains("end"));

    // inventory: normalized counts per item class
    for item in &update.items {
        if let Some(class) = item_class(&item.name) {
            let index = INVENTORY_OFF + class;
            let current = w.out.get(index).copied().unwrap_or(0.0);
            w.put_unit(index, current + item.count as f32 / 64.0);
        }
    }

    // equipped flags
    for item in update.items.iter().filter(|i| i.equipped) {
        let base = base_name(&item.name);
        for (k, kind) in EQUIPMENT_KINDS.iter().enumerate() {
            if matches_kind(base, kind) {
                w.put_flag(EQUIPPED_OFF + k, true);
            }
        }
    }

    // block summary over the capped nearest set
    let blocks = nearest_blocks(&update.blocks, origin, MAX_BLOCKS);
    let mut class_count = [0u32; BLOCK_CLASSES.len()];
    let mut class_nearest = [f64::INFINITY; BLOCK_CLASSES.len()];
    for block in &blocks {
        let Some(class) = block_class(&block.name) else {
            continue;
        };
        class_count[class] += 1;
        let d = dist_sq(origin, (block.x, block.y, block.z)).sqrt();
        if d < class_nearest[class] {
            class_nearest[class] = d;
        }
    }
    for class in 0..BLOCK_CLASSES.len() {
        let off = BLOCKS_OFF + class * BLOCK_CLASS_FEATURES;
        let present = class_count[class] > 0;
        w.put_flag(off, present);
        w.put_unit(off + 1, class_count[class] as f32 / 64.0);
        let proximity = if present {
            (1.0 - class_nearest[class] / RANGE).max(0.0) as f32
        } else {
            0.0
        };
        w.put_unit(off + 2, proximity);
    }

    // entity slots over the capped nearest set
    let capped = nearest_entities(&update.entities, origin, MAX_ENTITIES);
    for (slot, entity) in capped.iter().take(ENTITY_SLOTS).enumerate() {
        let off = ENTITIES_OFF + slot * ENTITY_FEATURES;
        let d = dist_sq(origin, (entity.x, entity.y, entity.z)).sqrt();
        w.put_flag(off, true);
        w.put_signed(off + 1, ((entity.x - origin.0) / RANGE) as f32);
        w.put_signed(off + 2, ((entity.y - origin.1) / RANGE) as f32);
        w.put_signed(off + 3, ((entity.z - origin.2) / RANGE) as f32);
        w.put_unit(off + 4, (d / RANGE) as f32);
        w.put_flag(off + 5, entity.hostile);
        w.put_flag(off + 6, entity.player);
        let bond = context.bonds.get(&entity.name).copied().unwrap_or(0.0);
        w.put_signed(off + 7, bond);
    }

    encode_moodles(w, snapshot, frame, context, &capped);
}

fn encode_agent(w: &mut Writer, snapshot: &AgentSnapshot, context: &MemoryContext) {
    // needs: level and urgency per axis, then goal one-hot
    let needs = [
        snapshot.needs.food,
        snapshot.needs.safety,
        snapshot.needs.social,
        snapshot.needs.rest,
    ];
    for (i, level) in needs.iter().enumerate() {
        w.put_unit(NEEDS_OFF + i * 2, *level);
        let urgency = (1.0 - level).max(0.0);
        w.put_unit(NEEDS_OFF + i * 2 + 1, urgency * urgency);
    }
    w.put_flag(NEEDS_OFF + 8 + snapshot.goal.index(), true);

    // mood channel: affect, traits, derived pressures
    w.put_signed(MOOD_OFF, snapshot.mood.valence);
    w.put_unit(MOOD_OFF + 1, snapshot.mood.arousal);
    w.put_unit(MOOD_OFF + 2, snapshot.personality.bravery);
    w.put_unit(MOOD_OFF + 3, snapshot.personality.curiosity);
    w.put_unit(MOOD_OFF + 4, snapshot.personality.sociability);
    w.put_unit(MOOD_OFF + 5, snapshot.personality.diligence);
    w.put_unit(MOOD_OFF + 6, snapshot.personality.aggression);
    w.put_unit(MOOD_OFF + 7, snapshot.mood.fear);
    w.put_unit(MOOD_OFF + 8, snapshot.mood.boredom);
    w.put_unit(MOOD_OFF + 9, snapshot.mood.social_satisfaction);
    w.put_unit(MOOD_OFF + 10, snapshot.idle_ms as f32 / 60_000.0);
    w.put_unit(MOOD_OFF + 11, 0.0);

    // recent-memory digest, most recent first
    for (slot, digest) in context.recent.iter().take(MEMORY_SLOTS).enumerate() {
        let off = MEMORY_OFF + slot * MEMORY_FEATURES;
        w.put_signed(off, digest.valence);
        w.put_unit(off + 1, digest.recency);
        w.put_unit(off + 2, digest.kind_id as f32 / 16.0);
        w.put_signed(off + 3, digest.reward / 10.0);
    }

    // skill vector: per-category success rate, zero-padded tail
    for (i, rate) in snapshot
        .category_success
        .iter()
        .take(CATEGORY_COUNT.min(SKILLS_LEN))
        .enumerate()
    {
        w.put_unit(SKILLS_OFF + i, *rate);
    }
}

fn encode_moodles(
    w: &mut Writer,
    snapshot: &AgentSnapshot,
    frame: &ObservationFrame,
    context: &MemoryContext,
    capped_entities: &[&EntityObs],
) {
    let update = &frame.update;
    let hostiles = capped_entities.iter().filter(|e| e.hostile).count();
    let players = capped_entities.iter().filter(|e| e.player).count();
    let bonded_near = capped_entities
        .iter()
        .any(|e| context.bonds.get(&e.name).copied().unwrap_or(0.0) > 0.2);
    let item_count: u32 = update.items.iter().map(|i| i.count).sum();
    let has_tool = |kind: &str| {
        update
            .items
            .iter()
            .any(|i| matches_kind(base_name(&i.name), kind))
    };
    let has_food = update.items.iter().any(|i| is_food_item(&i.name));
    let day_ticks = update.time % 24_000;
    let world = base_name(&update.location.world);

    let flags: [bool; MOODLES_LEN] = [
        update.food <= 6.0,                            // starving
        update.health <= 6.0,                          // low health
        update.oxygen < 10.0,                          // drowning
        day_ticks >= 12_000,                           // night
        update.weather.raining,                        // rain
        update.weather.thundering,                     // storm
        update.location.y < 50.0,                      // underground
        update.location.y > 100.0,                     // high up
        world.contains("nether"),                      // in nether
        world.contains("end"),                         // in end
        hostiles > 0,                                  // hostile near
        hostiles >= 3,                                 // swarmed
        players > 0,                                   // player near
        bonded_near,                                   // bonded peer near
        has_tool("pickaxe"),                           // has pickaxe
        has_tool("axe"),                               // has axe
        has_tool("sword"),                             // has weapon
        has_tool("shovel"),                            // has shovel
        has_tool("hoe"),                               // has hoe
        has_food,                                      // carries food
        item_count > 256,                              // inventory heavy
        snapshot.stuck,                                // stuck
        snapshot.idle_ms > 30_000,                     // long idle
        update.xp >= 30.0,                             // xp rich
        snapshot.needs.food < 0.3,                     // hungry drive
        snapshot.needs.safety < 0.3,                   // unsafe drive
        snapshot.needs.social < 0.3,                   // lonely drive
        snapshot.needs.rest < 0.3,                     // tired drive
        context.nearest_resource_dist.map(|d| d < RANGE).unwrap_or(false), // deposit near
        snapshot.mood.fear > 0.7,                      // panicking
        snapshot.mood.boredom > 0.7,                   // bored
        false,                                         // unused
    ];
    for (i, flag) in flags.iter().enumerate() {
        w.put_flag(MOODLES_OFF + i, *flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Location, SensorUpdate, Weather};
    use crate::memory::{EpisodicDigest, MemoryContext};
    use crate::orchestrator::agent::{AgentSnapshot, Goal};

    fn snapshot() -> AgentSnapshot {
        AgentSnapshot::neutral("tester", Goal::Gather)
    }

    fn context() -> MemoryContext {
        MemoryContext::default()
    }

    fn frame_with(blocks: Vec<BlockObs>, entities: Vec<EntityObs>) -> ObservationFrame {
        ObservationFrame {
            update: SensorUpdate {
                bot: "tester".to_string(),
                ts: 1,
                location: Location {
                    x: 0.0,
                    y: 64.0,
                    z: 0.0,
                    yaw: 0.0,
                    pitch: 0.0,
                    world: "overworld".to_string(),
                },
                health: 20.0,
                food: 20.0,
                saturation: 5.0,
                oxygen: 20.0,
                xp: 0.0,
                armor: 0.0,
                blocks,
                entities,
                items: vec![],
                weather: Weather::default(),
                time: 1000,
                chunks: 0,
                mob_ai: vec![],
            },
            received_at_ms: 0,
        }
    }

    fn block(id: u64, name: &str, x: f64) -> BlockObs {
        BlockObs {
            id,
            name: name.to_string(),
            x,
            y: 64.0,
            z: 0.0,
        }
    }

    #[test]
    fn layout_is_contiguous_and_covers_state_dim() {
        let mut expected_off = 0;
        for (name, off, len) in LAYOUT {
            assert_eq!(*off, expected_off, "slot {name} is misaligned");
            expected_off += len;
        }
        assert_eq!(expected_off, STATE_DIM);
    }

    #[test]
    fn encode_is_deterministic() {
        let frame = frame_with(
            vec![block(1, "oak_log", 1.0), block(2, "stone", 2.0)],
            vec![],
        );
        let a = encode(&snapshot(), Some(&frame), &context());
        let b = encode(&snapshot(), Some(&frame), &context());
        assert_eq!(a.vector, b.vector);
    }

    #[test]
    fn encode_without_frame_is_all_neutral_frame_slots() {
        let encoded = encode(&snapshot(), None, &context());
        assert_eq!(encoded.vector.len(), STATE_DIM);
        assert!(encoded.vector[VITALS_OFF..VITALS_OFF + VITALS_LEN]
            .iter()
            .all(|v| *v == 0.0));
    }

    #[test]
    fn single_oak_log_sets_block_slot_and_leaves_entities_zero() {
        // Scenario from the contract: one oak_log at (1, 64, 0), nothing else.
        let frame = frame_with(vec![block(1, "oak_log", 1.0)], vec![]);
        let encoded = encode(&snapshot(), Some(&frame), &context());
        let oak_class = BLOCK_CLASSES.iter().position(|c| *c == "oak_log").unwrap();
        let off = BLOCKS_OFF + oak_class * BLOCK_CLASS_FEATURES;
        assert_eq!(encoded.vector[off], 1.0);
        assert!(encoded.vector[off + 2] > 0.9);
        assert!(encoded.vector[ENTITIES_OFF..ENTITIES_OFF + ENTITIES_LEN]
            .iter()
            .all(|v| *v == 0.0));
    }

    #[test]
    fn encode_output_is_always_finite() {
        let mut frame = frame_with(vec![], vec![]);
        frame.update.health = f32::NAN;
        frame.update.food = f32::INFINITY;
        frame.update.location.x = f64::NAN;
        let encoded = encode(&snapshot(), Some(&frame), &context());
        assert!(encoded.vector.iter().all(|v| v.is_finite()));
        assert!(encoded.sanitized_fields >= 2);
    }

    #[test]
    fn flood_depends_only_on_nearest_blocks() {
        // A frame with a large flood must encode identically to the frame
        // holding only its nearest MAX_BLOCKS blocks.
        let mut flood = Vec::new();
        for i in 0..5000u64 {
            flood.push(block(i, "stone", 1.0 + i as f64 * 0.01));
        }
        let nearest: Vec<BlockObs> = {
            let frame = frame_with(flood.clone(), vec![]);
            nearest_blocks(&frame.update.blocks, (0.0, 64.0, 0.0), MAX_BLOCKS)
                .into_iter()
                .cloned()
                .collect()
        };
        let full = encode(&snapshot(), Some(&frame_with(flood, vec![])), &context());
        let capped = encode(&snapshot(), Some(&frame_with(nearest, vec![])), &context());
        assert_eq!(full.vector, capped.vector);
    }

    #[test]
    fn nearest_selection_breaks_ties_by_id() {
        let blocks = vec![block(7, "stone", 3.0), block(3, "stone", 3.0)];
        let picked = nearest_blocks(&blocks, (0.0, 64.0, 0.0), 1);
        assert_eq!(picked[0].id, 3);
    }

    #[test]
    fn memory_digest_lands_in_memory_slots() {
        let mut ctx = context();
        ctx.recent.push(EpisodicDigest {
            valence: 0.8,
            recency: 1.0,
            kind_id: 2,
            reward: 5.0,
        });
        let encoded = encode(&snapshot(), None, &ctx);
        assert_eq!(encoded.vector[MEMORY_OFF], 0.8);
        assert_eq!(encoded.vector[MEMORY_OFF + 1], 1.0);
        assert_eq!(encoded.vector[MEMORY_OFF + 3], 0.5);
    }

    #[test]
    fn goal_one_hot_is_exclusive() {
        let encoded = encode(&snapshot(), None, &context());
        let goals = &encoded.vector[NEEDS_OFF + 8..NEEDS_OFF + 16];
        assert_eq!(goals.iter().filter(|v| **v == 1.0).count(), 1);
    }
}
