//! Reward shaping.
//!
//! `RewardShaper::compute` is a pure function of explicit inputs; it never
//! reaches for shared state. The weight table below is the single
//! authoritative pricing source for the whole system, and every unbounded
//! term carries its own cap so a single tick's reward stays inside
//! `RewardShaper::bounds` by construction.

use crate::actions::executor::ActionOutcome;
use crate::actions::{ActionCategory, CATEGORY_COUNT};
use crate::encoder::is_food_item;
use crate::orchestrator::agent::{Needs, Personality};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    /// Per-tick bonus while alive.
    pub survival_tick: f32,
    /// Success bonus per action category, indexed by `ActionCategory::index`.
    pub category: [f32; CATEGORY_COUNT],
    /// Price of a failed action. Invalid actions are not pruned up front;
    /// this is how the agent learns preconditions.
    pub action_failure: f32,
    pub item_common: f32,
    pub item_uncommon: f32,
    pub item_rare: f32,
    pub item_epic: f32,
    /// Total cap on the inventory-delta term per tick.
    pub inventory_cap: f32,
    pub first_craft: f32,
    pub task_complete: f32,
    pub exploration_chunk: f32,
    pub movement_per_block: f32,
    pub movement_cap: f32,
    /// Cooperation bonus scale; multiplied by bond strength per bonded peer
    /// inside `social_radius`.
    pub social_cooperation: f32,
    pub social_radius: f64,
    pub social_cap: f32,
    pub idle_penalty: f32,
    pub stuck_penalty: f32,
    pub death_penalty: f32,
    /// Multiplier applied to the positive sum when health is critical.
    pub low_health_modifier: f32,
    /// Extra multiplier on food-item gains while the food need is low.
    pub hungry_food_boost: f32,
}

impl Default for RewardWeights {
    fn default() -> Self {
        let mut category = [0.5; CATEGORY_COUNT];
        category[ActionCategory::Movement.index()] = 0.1;
        category[ActionCategory::Combat.index()] = 0.8;
        category[ActionCategory::Resource.index()] = 1.0;
        category[ActionCategory::Build.index()] = 0.6;
        category[ActionCategory::Craft.index()] = 1.2;
        category[ActionCategory::Inventory.index()] = 0.2;
        category[ActionCategory::AdvancedCraft.index()] = 2.0;
        category[ActionCategory::Container.index()] = 0.3;
        category[ActionCategory::Enchant.index()] = 2.5;
        category[ActionCategory::Trade.index()] = 1.5;
        category[ActionCategory::Agriculture.index()] = 0.9;
        category[ActionCategory::Redstone.index()] = 1.0;
        category[ActionCategory::Bed.index()] = 0.4;
        category[ActionCategory::AdvancedCombat.index()] = 1.2;
        category[ActionCategory::Navigation.index()] = 0.3;
        category[ActionCategory::Optimization.index()] = 0.2;
        category[ActionCategory::Communication.index()] = 0.3;
        Self {
            survival_tick: 0.02,
            category,
            action_failure: -0.1,
            item_common: 0.1,
            item_uncommon: 0.3,
            item_rare: 1.0,
            item_epic: 3.0,
            inventory_cap: 8.0,
            first_craft: 2.0,
            task_complete: 5.0,
            exploration_chunk: 1.0,
            movement_per_block: 0.02,
            movement_cap: 0.3,
            social_cooperation: 0.5,
            social_radius: 16.0,
            social_cap: 1.5,
            idle_penalty: -2.0,
            stuck_penalty: -0.5,
            death_penalty: -10.0,
            low_health_modifier: 0.5,
            hungry_food_boost: 2.0,
        }
    }
}

/// Item rarity classes for inventory-delta pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
}

pub fn classify_rarity(name: &str) -> Rarity {
    let base = name.rsplit(':').next().unwrap_or(name);
    match base {
        "diamond" | "emerald" | "golden_apple" | "ender_pearl" | "diamond_pickaxe"
        | "diamond_sword" => Rarity::Epic,
        "iron_ingot" | "raw_iron" | "gold_ingot" | "raw_gold" | "redstone" | "lapis_lazuli"
        | "iron_pickaxe" | "iron_sword" | "iron_axe" | "iron_shovel" | "iron_hoe" => Rarity::Rare,
        "coal" | "charcoal" | "flint" | "leather" | "string" | "bow" | "shield"
        | "stone_pickaxe" | "stone_sword" | "stone_axe" => Rarity::Uncommon,
        _ => Rarity::Common,
    }
}

/// Read-only view of the agents near the rewarded one. Built by the caller
/// from its population snapshot; the shaper never dereferences shared state.
#[derive(Debug, Clone)]
pub struct NearbyPeer {
    pub name: String,
    pub distance: f64,
    pub bond: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TickFlags {
    pub entered_new_chunk: bool,
    pub first_craft: bool,
    pub task_completed: bool,
    pub idle_breach: bool,
    pub stuck_triggered: bool,
    pub died: bool,
}

pub struct RewardInputs<'a> {
    pub outcome: &'a ActionOutcome,
    pub health: f32,
    pub needs: &'a Needs,
    pub personality: &'a Personality,
    pub peers: &'a [NearbyPeer],
    pub flags: TickFlags,
}

/// Per-term decomposition; `total` is the shaped scalar.
#[derive(Debug, Clone, Default)]
pub struct RewardBreakdown {
    pub survival: f32,
    pub action: f32,
    pub inventory: f32,
    pub crafting: f32,
    pub task: f32,
    pub exploration: f32,
    pub movement: f32,
    pub social: f32,
    pub idle: f32,
    pub stuck: f32,
    pub death: f32,
    pub total: f32,
}

pub struct RewardShaper {
    weights: RewardWeights,
}

impl RewardShaper {
    pub fn new(weights: RewardWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    pub fn compute(&self, inputs: &RewardInputs<'_>) -> RewardBreakdown {
        let w = &self.weights;
        let mut b = RewardBreakdown::default();
        let hungry = inputs.needs.food < 0.3;

        if !inputs.flags.died {
            b.survival = w.survival_tick;
        }

        b.action = if inputs.outcome.success {
            w.category[inputs.outcome.category.index()]
        } else {
            w.action_failure
        };

        let mut inventory = 0.0f32;
        for (name, count) in &inputs.outcome.items_gained {
            let unit = match classify_rarity(name) {
                Rarity::Common => w.item_common,
                Rarity::Uncommon => w.item_uncommon,
                Rarity::Rare => w.item_rare,
                Rarity::Epic => w.item_epic,
            };
            let mut gain = unit * *count as f32;
            if hungry && is_food_item(name) {
                gain *= w.hungry_food_boost;
            }
            inventory += gain;
        }
        b.inventory = inventory.min(w.inventory_cap);

        if inputs.flags.first_craft {
            b.crafting = w.first_craft;
        }
        if inputs.flags.task_completed {
            b.task = w.task_complete;
        }
        if inputs.flags.entered_new_chunk {
            // Curious agents value novelty more; the factor spans 0.5..1.5.
            b.exploration = w.exploration_chunk * (0.5 + inputs.personality.curiosity);
        }

        b.movement = (inputs.outcome.displacement as f32 * w.movement_per_block)
            .min(w.movement_cap);

        let mut social = 0.0f32;
        for peer in inputs.peers {
            if peer.distance <= w.social_radius && peer.bond > 0.0 {
                social += w.social_cooperation * peer.bond * (0.5 + inputs.personality.sociability);
            }
        }
        b.social = social.min(w.social_cap);

        if inputs.flags.idle_breach {
            b.idle = w.idle_penalty;
        }
        if inputs.flags.stuck_triggered {
            b.stuck = w.stuck_penalty;
        }
        if inputs.flags.died {
            b.death = w.death_penalty;
        }

        let mut positive = b.survival
            + b.action.max(0.0)
            + b.inventory
            + b.crafting
            + b.task
            + b.exploration
            + b.movement
            + b.social;
        if inputs.health <= 6.0 {
            positive *= w.low_health_modifier;
        }
        let negative = b.action.min(0.0) + b.idle + b.stuck + b.death;

        b.total = positive + negative;
        if !b.total.is_finite() {
            b.total = 0.0;
        }
        b
    }

    /// Analytic (worst, best) single-tick bounds implied by the table. The
    /// test suite pins `compute` inside this envelope.
    pub fn bounds(&self) -> (f32, f32) {
        let w = &self.weights;
        let category_max = w
            .category
            .iter()
            .copied()
            .fold(f32::MIN, f32::max)
            .max(0.0);
        let best = w.survival_tick
            + category_max
            + w.inventory_cap
            + w.first_craft
            + w.task_complete
            + w.exploration_chunk * 1.5
            + w.movement_cap
            + w.social_cap;
        let worst = w.action_failure + w.idle_penalty + w.stuck_penalty + w.death_penalty;
        (worst, best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::executor::ActionOutcome;
    use crate::actions::ActionCategory;
    use crate::orchestrator::agent::Needs;

    fn outcome(success: bool, category: ActionCategory) -> ActionOutcome {
        ActionOutcome {
            action_index: 0,
            category,
            success,
            failure: None,
            items_gained: vec![],
            items_lost: vec![],
            displacement: 0.0,
            frame_after: None,
        }
    }

    fn shaper() -> RewardShaper {
        RewardShaper::new(RewardWeights::default())
    }

    #[test]
    fn successful_chop_pays_survival_action_and_inventory() {
        let mut out = outcome(true, ActionCategory::Resource);
        out.items_gained = vec![("oak_log".to_string(), 1)];
        let needs = Needs::default();
        let b = shaper().compute(&RewardInputs {
            outcome: &out,
            health: 20.0,
            needs: &needs,
            personality: &Personality::default(),
            peers: &[],
            flags: TickFlags::default(),
        });
        let w = RewardWeights::default();
        let expected =
            w.survival_tick + w.category[ActionCategory::Resource.index()] + w.item_common;
        assert!((b.total - expected).abs() < 1e-6);
    }

    #[test]
    fn failure_is_priced_negative() {
        let out = outcome(false, ActionCategory::Resource);
        let needs = Needs::default();
        let b = shaper().compute(&RewardInputs {
            outcome: &out,
            health: 20.0,
            needs: &needs,
            personality: &Personality::default(),
            peers: &[],
            flags: TickFlags::default(),
        });
        assert!(b.action < 0.0);
        assert!(b.total < RewardWeights::default().survival_tick);
    }

    #[test]
    fn hungry_agents_get_boosted_food_reward() {
        let mut out = outcome(true, ActionCategory::Resource);
        out.items_gained = vec![("bread".to_string(), 1)];
        let full = Needs::default();
        let hungry = Needs {
            food: 0.1,
            ..Needs::default()
        };
        let s = shaper();
        let fed = s.compute(&RewardInputs {
            outcome: &out,
            health: 20.0,
            needs: &full,
            personality: &Personality::default(),
            peers: &[],
            flags: TickFlags::default(),
        });
        let starved = s.compute(&RewardInputs {
            outcome: &out,
            health: 20.0,
            needs: &hungry,
            personality: &Personality::default(),
            peers: &[],
            flags: TickFlags::default(),
        });
        assert!(starved.inventory > fed.inventory);
    }

    #[test]
    fn low_health_dampens_positive_reward() {
        let out = outcome(true, ActionCategory::Resource);
        let needs = Needs::default();
        let s = shaper();
        let healthy = s.compute(&RewardInputs {
            outcome: &out,
            health: 20.0,
            needs: &needs,
            personality: &Personality::default(),
            peers: &[],
            flags: TickFlags::default(),
        });
        let wounded = s.compute(&RewardInputs {
            outcome: &out,
            health: 3.0,
            needs: &needs,
            personality: &Personality::default(),
            peers: &[],
            flags: TickFlags::default(),
        });
        assert!(wounded.total < healthy.total);
    }

    #[test]
    fn social_bonus_scales_with_bond_and_is_capped() {
        let out = outcome(true, ActionCategory::Movement);
        let needs = Needs::default();
        let peers: Vec<NearbyPeer> = (0..20)
            .map(|i| NearbyPeer {
                name: format!("peer{i}"),
                distance: 4.0,
                bond: 1.0,
            })
            .collect();
        let b = shaper().compute(&RewardInputs {
            outcome: &out,
            health: 20.0,
            needs: &needs,
            personality: &Personality::default(),
            peers: &peers,
            flags: TickFlags::default(),
        });
        assert_eq!(b.social, RewardWeights::default().social_cap);
    }

    #[test]
    fn every_tick_stays_inside_analytic_bounds() {
        let s = shaper();
        let (worst, best) = s.bounds();
        let needs = Needs {
            food: 0.0,
            ..Needs::default()
        };
        // Adversarial best-case tick.
        let mut rich = outcome(true, ActionCategory::Enchant);
        rich.items_gained = vec![("diamond".to_string(), 640)];
        rich.displacement = 500.0;
        let peers: Vec<NearbyPeer> = (0..50)
            .map(|i| NearbyPeer {
                name: format!("p{i}"),
                distance: 1.0,
                bond: 1.0,
            })
            .collect();
        let flags = TickFlags {
            entered_new_chunk: true,
            first_craft: true,
            task_completed: true,
            ..Default::default()
        };
        let hi = s.compute(&RewardInputs {
            outcome: &rich,
            health: 20.0,
            needs: &needs,
            personality: &Personality::default(),
            peers: &peers,
            flags,
        });
        assert!(hi.total <= best + 1e-4, "{} > {}", hi.total, best);

        // Adversarial worst-case tick.
        let poor = outcome(false, ActionCategory::Movement);
        let flags = TickFlags {
            idle_breach: true,
            stuck_triggered: true,
            died: true,
            ..Default::default()
        };
        let lo = s.compute(&RewardInputs {
            outcome: &poor,
            health: 1.0,
            needs: &needs,
            personality: &Personality::default(),
            peers: &[],
            flags,
        });
        assert!(lo.total >= worst - 1e-4, "{} < {}", lo.total, worst);
        assert!(lo.total.is_finite() && hi.total.is_finite());
    }
}
