use serde::{Deserialize, Serialize};

pub mod executor;

/// Canonical action count for a run, recorded in the parameter schema
/// header. The catalog below must stay exactly this long.
pub const ACTION_DIM: usize = 76;

pub const CATEGORY_COUNT: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Movement,
    Combat,
    Resource,
    Build,
    Craft,
    Inventory,
    AdvancedCraft,
    Container,
    Enchant,
    Trade,
    Agriculture,
    Redstone,
    Bed,
    AdvancedCombat,
    Navigation,
    Optimization,
    Communication,
}

impl ActionCategory {
    pub const ALL: [ActionCategory; CATEGORY_COUNT] = [
        ActionCategory::Movement,
        ActionCategory::Combat,
        ActionCategory::Resource,
        ActionCategory::Build,
        ActionCategory::Craft,
        ActionCategory::Inventory,
        ActionCategory::AdvancedCraft,
        ActionCategory::Container,
        ActionCategory::Enchant,
        ActionCategory::Trade,
        ActionCategory::Agriculture,
        ActionCategory::Redstone,
        ActionCategory::Bed,
        ActionCategory::AdvancedCombat,
        ActionCategory::Navigation,
        ActionCategory::Optimization,
        ActionCategory::Communication,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ActionDef {
    pub index: usize,
    pub name: &'static str,
    pub category: ActionCategory,
    /// Movement intent; feeds unstuck detection.
    pub is_movement: bool,
}

/// The full action table. Indices are positional and stable: reordering this
/// table invalidates saved parameters the same way changing `ACTION_DIM`
/// does.
const ACTION_TABLE: [(&str, ActionCategory); ACTION_DIM] = [
    // movement
    ("move_forward", ActionCategory::Movement),
    ("move_back", ActionCategory::Movement),
    ("strafe_left", ActionCategory::Movement),
    ("strafe_right", ActionCategory::Movement),
    ("jump", ActionCategory::Movement),
    ("sprint", ActionCategory::Movement),
    ("sneak", ActionCategory::Movement),
    ("random_move", ActionCategory::Movement),
    // combat
    ("attack_nearest_hostile", ActionCategory::Combat),
    ("attack_nearest_animal", ActionCategory::Combat),
    ("retreat", ActionCategory::Combat),
    ("strafe_attack", ActionCategory::Combat),
    ("shield_block", ActionCategory::Combat),
    // resource
    ("chop_wood", ActionCategory::Resource),
    ("mine_stone", ActionCategory::Resource),
    ("mine_coal", ActionCategory::Resource),
    ("mine_iron", ActionCategory::Resource),
    ("mine_gold", ActionCategory::Resource),
    ("mine_diamond", ActionCategory::Resource),
    ("collect_drops", ActionCategory::Resource),
    ("dig_down_safe", ActionCategory::Resource),
    // build
    ("place_block", ActionCategory::Build),
    ("build_pillar", ActionCategory::Build),
    ("build_bridge", ActionCategory::Build),
    ("build_shelter", ActionCategory::Build),
    ("break_block", ActionCategory::Build),
    // craft
    ("craft_planks", ActionCategory::Craft),
    ("craft_sticks", ActionCategory::Craft),
    ("craft_crafting_table", ActionCategory::Craft),
    ("craft_wooden_pickaxe", ActionCategory::Craft),
    ("craft_stone_pickaxe", ActionCategory::Craft),
    ("craft_furnace", ActionCategory::Craft),
    // inventory
    ("equip_best_tool", ActionCategory::Inventory),
    ("equip_best_weapon", ActionCategory::Inventory),
    ("store_items", ActionCategory::Inventory),
    ("toss_junk", ActionCategory::Inventory),
    // advanced craft
    ("craft_iron_pickaxe", ActionCategory::AdvancedCraft),
    ("craft_iron_sword", ActionCategory::AdvancedCraft),
    ("smelt_iron", ActionCategory::AdvancedCraft),
    ("craft_torches", ActionCategory::AdvancedCraft),
    // container
    ("open_chest", ActionCategory::Container),
    ("deposit_chest", ActionCategory::Container),
    ("withdraw_chest", ActionCategory::Container),
    ("close_container", ActionCategory::Container),
    // enchant
    ("enchant_item", ActionCategory::Enchant),
    ("brew_potion", ActionCategory::Enchant),
    ("use_anvil", ActionCategory::Enchant),
    // trade
    ("trade_with_villager", ActionCategory::Trade),
    ("offer_item", ActionCategory::Trade),
    ("accept_trade", ActionCategory::Trade),
    // agriculture
    ("till_soil", ActionCategory::Agriculture),
    ("plant_seeds", ActionCategory::Agriculture),
    ("harvest_crops", ActionCategory::Agriculture),
    ("breed_animals", ActionCategory::Agriculture),
    ("fish", ActionCategory::Agriculture),
    // redstone
    ("place_lever", ActionCategory::Redstone),
    ("toggle_lever", ActionCategory::Redstone),
    ("place_redstone", ActionCategory::Redstone),
    // bed
    ("place_bed", ActionCategory::Bed),
    ("sleep_in_bed", ActionCategory::Bed),
    // advanced combat
    ("bow_attack", ActionCategory::AdvancedCombat),
    ("crossbow_attack", ActionCategory::AdvancedCombat),
    ("throw_potion", ActionCategory::AdvancedCombat),
    ("flee_to_safety", ActionCategory::AdvancedCombat),
    // navigation
    ("goto_nearest_tree", ActionCategory::Navigation),
    ("goto_nearest_ore", ActionCategory::Navigation),
    ("goto_spawn", ActionCategory::Navigation),
    ("goto_bonded_peer", ActionCategory::Navigation),
    ("explore_new_chunk", ActionCategory::Navigation),
    ("follow_nearest_player", ActionCategory::Navigation),
    // optimization
    ("optimize_inventory", ActionCategory::Optimization),
    ("rest", ActionCategory::Optimization),
    // communication
    ("chat_greet", ActionCategory::Communication),
    ("chat_share_location", ActionCategory::Communication),
    ("chat_call_help", ActionCategory::Communication),
    ("chat_socialize", ActionCategory::Communication),
];

fn movement_intent(category: ActionCategory) -> bool {
    matches!(
        category,
        ActionCategory::Movement | ActionCategory::Navigation
    )
}

/// Immutable, index-stable action catalog. Built once at startup and shared.
pub struct ActionCatalog {
    defs: Vec<ActionDef>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        let defs = ACTION_TABLE
            .iter()
            .enumerate()
            .map(|(index, (name, category))| ActionDef {
                index,
                name,
                category: *category,
                is_movement: movement_intent(*category),
            })
            .collect();
        Self { defs }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ActionDef> {
        self.defs.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&ActionDef> {
        self.defs.iter().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionDef> {
        self.defs.iter()
    }
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_matches_declared_action_dim() {
        let catalog = ActionCatalog::new();
        assert_eq!(catalog.len(), ACTION_DIM);
    }

    #[test]
    fn action_names_are_unique() {
        let names: HashSet<&str> = ACTION_TABLE.iter().map(|(n, _)| *n).collect();
        assert_eq!(names.len(), ACTION_DIM);
    }

    #[test]
    fn every_category_has_at_least_one_action() {
        let catalog = ActionCatalog::new();
        for category in ActionCategory::ALL {
            assert!(
                catalog.iter().any(|d| d.category == category),
                "category {category:?} has no actions"
            );
        }
    }

    #[test]
    fn indices_are_positional() {
        let catalog = ActionCatalog::new();
        for (i, def) in catalog.iter().enumerate() {
            assert_eq!(def.index, i);
        }
        assert_eq!(catalog.by_name("chop_wood").map(|d| d.index), Some(13));
    }

    #[test]
    fn category_index_round_trips() {
        for (i, category) in ActionCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }
}
