use crate::actions::{ActionCatalog, ActionCategory, ActionDef};
use crate::bridge::protocol::{ActionRequest, ObservationFrame, WireMessage};
use crate::bridge::SensorBridge;
use crate::util::dist;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No post-action frame arrived within the wall-clock budget.
    Timeout,
    /// The action ran but had no observable effect (missing tool, target out
    /// of reach, pathfind dead end).
    Precondition,
    /// The outbound queue refused the action.
    Rejected,
}

/// Structured outcome of one action attempt, rich enough for the reward
/// shaper to price without re-deriving deltas.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action_index: usize,
    pub category: ActionCategory,
    pub success: bool,
    pub failure: Option<FailureKind>,
    /// (item name, count) newly present after the action.
    pub items_gained: Vec<(String, u32)>,
    pub items_lost: Vec<(String, u32)>,
    /// Euclidean displacement over the action, in blocks.
    pub displacement: f64,
    /// Post-action frame when one arrived in budget.
    pub frame_after: Option<ObservationFrame>,
}

impl ActionOutcome {
    fn failed(def: &ActionDef, kind: FailureKind) -> Self {
        Self {
            action_index: def.index,
            category: def.category,
            success: false,
            failure: Some(kind),
            items_gained: Vec::new(),
            items_lost: Vec::new(),
            displacement: 0.0,
            frame_after: None,
        }
    }
}

/// Realizes catalog actions against the hub and reports what actually
/// happened. Success is judged from the observed next frame, never assumed
/// from the send; the hub does not acknowledge actions.
pub struct ActionExecutor {
    bridge: Arc<SensorBridge>,
    catalog: Arc<ActionCatalog>,
    budget: Duration,
}

impl ActionExecutor {
    pub fn new(bridge: Arc<SensorBridge>, catalog: Arc<ActionCatalog>, budget: Duration) -> Self {
        Self {
            bridge,
            catalog,
            budget,
        }
    }

    /// Attempts `action_index` for `bot`. Errors only on an out-of-range
    /// index, which is an integrity fault that aborts the calling agent task;
    /// every runtime failure is folded into the outcome.
    pub async fn execute(
        &self,
        bot: &str,
        action_index: usize,
        before: &ObservationFrame,
    ) -> Result<ActionOutcome> {
        let def = self
            .catalog
            .get(action_index)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "action index {action_index} out of range (catalog size {})",
                    self.catalog.len()
                )
            })?;

        let request = WireMessage::Action(ActionRequest {
            target: bot.to_string(),
            action: def.name.to_string(),
            params: serde_json::Map::new(),
        });
        if self.bridge.send(request).is_err() {
            return Ok(ActionOutcome::failed(def, FailureKind::Rejected));
        }

        let Some(after) = self
            .bridge
            .await_frame_after(bot, before.seq(), self.budget)
            .await
        else {
            debug!("{bot}: no frame within budget after {}", def.name);
            return Ok(ActionOutcome::failed(def, FailureKind::Timeout));
        };

        let (gained, lost) = inventory_delta(before, &after);
        let displacement = dist(
            before.update.location.pos(),
            after.update.location.pos(),
        );
        let success = judge_success(def, &gained, &lost, displacement, before, &after);

        Ok(ActionOutcome {
            action_index: def.index,
            category: def.category,
            success,
            failure: if success {
                None
            } else {
                Some(FailureKind::Precondition)
            },
            items_gained: gained,
            items_lost: lost,
            displacement,
            frame_after: Some(after),
        })
    }
}

/// Per-category effect test. Invalid actions are not pruned up front; they
/// land here as "no effect" and earn the shaper's failure price.
fn judge_success(
    def: &ActionDef,
    gained: &[(String, u32)],
    lost: &[(String, u32)],
    displacement: f64,
    before: &ObservationFrame,
    after: &ObservationFrame,
) -> bool {
    match def.category {
        ActionCategory::Movement | ActionCategory::Navigation => displacement > 0.5,
        ActionCategory::Resource | ActionCategory::Agriculture | ActionCategory::Trade => {
            !gained.is_empty()
        }
        ActionCategory::Craft | ActionCategory::AdvancedCraft | ActionCategory::Enchant => {
            !gained.is_empty()
        }
        ActionCategory::Combat | ActionCategory::AdvancedCombat => {
            let hostiles_before = count_hostiles(before);
            let hostiles_after = count_hostiles(after);
            hostiles_after < hostiles_before || displacement > 0.5
        }
        ActionCategory::Build | ActionCategory::Redstone | ActionCategory::Bed => {
            !lost.is_empty() || displacement > 0.5
        }
        ActionCategory::Inventory | ActionCategory::Container | ActionCategory::Optimization => {
            !gained.is_empty() || !lost.is_empty() || equipment_changed(before, after)
        }
        // Chat intents hand off to the dialogue pipeline; the send itself is
        // the effect.
        ActionCategory::Communication => true,
    }
}

fn count_hostiles(frame: &ObservationFrame) -> usize {
    frame.update.entities.iter().filter(|e| e.hostile).count()
}

fn equipment_changed(before: &ObservationFrame, after: &ObservationFrame) -> bool {
    let equipped = |f: &ObservationFrame| -> Vec<String> {
        let mut names: Vec<String> = f
            .update
            .items
            .iter()
            .filter(|i| i.equipped)
            .map(|i| i.name.clone())
            .collect();
        names.sort();
        names
    };
    equipped(before) != equipped(after)
}

/// Item-count difference between two frames: (gained, lost).
pub fn inventory_delta(
    before: &ObservationFrame,
    after: &ObservationFrame,
) -> (Vec<(String, u32)>, Vec<(String, u32)>) {
    let tally = |frame: &ObservationFrame| -> HashMap<String, i64> {
        let mut counts: HashMap<String, i64> = HashMap::new();
        for item in &frame.update.items {
            *counts.entry(item.name.clone()).or_default() += item.count as i64;
        }
        counts
    };
    let before_counts = tally(before);
    let after_counts = tally(after);

    let mut gained = Vec::new();
    let mut lost = Vec::new();
    for (name, after_n) in &after_counts {
        let before_n = before_counts.get(name).copied().unwrap_or(0);
        if *after_n > before_n {
            gained.push((name.clone(), (*after_n - before_n) as u32));
        }
    }
    for (name, before_n) in &before_counts {
        let after_n = after_counts.get(name).copied().unwrap_or(0);
        if after_n < *before_n {
            lost.push((name.clone(), (*before_n - after_n) as u32));
        }
    }
    gained.sort();
    lost.sort();
    (gained, lost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ItemObs, Location, SensorUpdate};
    use crate::config::SensorConfig;

    fn frame(ts: u64, items: Vec<ItemObs>, x: f64) -> ObservationFrame {
        ObservationFrame {
            update: SensorUpdate {
                bot: "b".to_string(),
                ts,
                location: Location {
                    x,
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
                blocks: vec![],
                entities: vec![],
                items,
                weather: Default::default(),
                time: 0,
                chunks: 0,
                mob_ai: vec![],
            },
            received_at_ms: 0,
        }
    }

    fn item(name: &str, count: u32) -> ItemObs {
        ItemObs {
            name: name.to_string(),
            count,
            slot: 0,
            equipped: false,
        }
    }

    fn executor() -> ActionExecutor {
        let bridge = SensorBridge::new(SensorConfig::default());
        ActionExecutor::new(
            bridge,
            Arc::new(ActionCatalog::new()),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn inventory_delta_reports_gains_and_losses() {
        let before = frame(1, vec![item("oak_log", 2), item("stick", 4)], 0.0);
        let after = frame(2, vec![item("oak_log", 5), item("stick", 1)], 0.0);
        let (gained, lost) = inventory_delta(&before, &after);
        assert_eq!(gained, vec![("oak_log".to_string(), 3)]);
        assert_eq!(lost, vec![("stick".to_string(), 3)]);
    }

    #[tokio::test]
    async fn out_of_range_index_is_an_error() {
        let exec = executor();
        let before = frame(1, vec![], 0.0);
        assert!(exec.execute("b", 9999, &before).await.is_err());
    }

    #[tokio::test]
    async fn no_next_frame_is_a_timeout_failure() {
        let exec = executor();
        let before = frame(1, vec![], 0.0);
        let outcome = exec.execute("b", 0, &before).await.expect("outcome");
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn resource_success_requires_item_gain() {
        let bridge = SensorBridge::new(SensorConfig::default());
        let exec = ActionExecutor::new(
            bridge.clone(),
            Arc::new(ActionCatalog::new()),
            Duration::from_millis(500),
        );
        let before = frame(1, vec![], 0.0);
        bridge.inject_frame(before.update.clone()).await;

        let worker = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                bridge
                    .inject_frame(frame(2, vec![item("oak_log", 1)], 0.0).update)
                    .await;
            }
        });

        // chop_wood is index 13 in the catalog.
        let outcome = exec.execute("b", 13, &before).await.expect("outcome");
        worker.await.expect("join");
        assert!(outcome.success);
        assert_eq!(outcome.items_gained, vec![("oak_log".to_string(), 1)]);
    }

    #[tokio::test]
    async fn movement_without_displacement_fails_precondition() {
        let bridge = SensorBridge::new(SensorConfig::default());
        let exec = ActionExecutor::new(
            bridge.clone(),
            Arc::new(ActionCatalog::new()),
            Duration::from_millis(500),
        );
        let before = frame(1, vec![], 0.0);
        bridge.inject_frame(before.update.clone()).await;
        bridge.inject_frame(frame(2, vec![], 0.1).update).await;

        let outcome = exec.execute("b", 0, &before).await.expect("outcome");
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Precondition));
    }
}
