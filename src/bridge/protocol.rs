use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// Every message on the sensor hub stream, both directions. The wire format
/// is length-framed JSON: a 4-byte big-endian length prefix followed by one
/// JSON object with a `type` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    // --- handshake ---
    AuthRequired,
    Auth { token: String },
    AuthSuccess,
    RegisterBot { bot: String },
    RegistrationSuccess { bot: String },

    // --- hub → core stream ---
    SensorUpdate(SensorUpdate),
    ServerTick(ServerTick),
    Checkpoint { tick: u64 },
    Evolution { tick: u64 },
    ServerShutdown,
    Error { message: String },
    SpawnConfirm(SpawnConfirm),
    AgentDeath(AgentDeath),

    // --- core → hub (v2) ---
    SpawnAgent(SpawnAgent),
    RemoveAgent { name: String, reason: String },
    Action(ActionRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorUpdate {
    pub bot: String,
    /// Monotonic per-bot sequence stamp. Out-of-order updates are dropped.
    pub ts: u64,
    pub location: Location,
    #[serde(default)]
    pub health: f32,
    #[serde(default)]
    pub food: f32,
    #[serde(default)]
    pub saturation: f32,
    #[serde(default)]
    pub oxygen: f32,
    #[serde(default)]
    pub xp: f32,
    #[serde(default)]
    pub armor: f32,
    #[serde(default)]
    pub blocks: Vec<BlockObs>,
    #[serde(default)]
    pub entities: Vec<EntityObs>,
    #[serde(default)]
    pub items: Vec<ItemObs>,
    #[serde(default)]
    pub weather: Weather,
    /// World time in game ticks (0..24000 per day).
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub chunks: u32,
    #[serde(default, rename = "mobAI")]
    pub mob_ai: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTick {
    pub tick: u64,
    pub tps: f64,
    #[serde(rename = "onlinePlayers")]
    pub online_players: u32,
    #[serde(rename = "loadedChunks")]
    pub loaded_chunks: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub yaw: f32,
    #[serde(default)]
    pub pitch: f32,
    #[serde(default)]
    pub world: String,
}

impl Location {
    pub fn pos(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockObs {
    /// Stable numeric id within the frame, ascending order breaks
    /// nearest-distance ties deterministically.
    pub id: u64,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityObs {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub hostile: bool,
    #[serde(default)]
    pub player: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemObs {
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub slot: u32,
    #[serde(default)]
    pub equipped: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Weather {
    #[serde(default)]
    pub raining: bool,
    #[serde(default)]
    pub thundering: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnAgent {
    pub name: String,
    #[serde(rename = "agentType")]
    pub agent_type: String,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnConfirm {
    pub name: String,
    #[serde(rename = "entityUuid")]
    pub entity_uuid: String,
    pub location: Location,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeath {
    pub name: String,
    pub cause: String,
    #[serde(default)]
    pub killer: Option<String>,
    pub location: Location,
}

/// Action descriptor sent to the hub. `name` is the catalog name; params are
/// free-form and interpreted by the hub-side dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub target: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// One observation frame as held by the bridge cache: the decoded sensor
/// payload plus receipt bookkeeping. Never mutated after publish.
#[derive(Debug, Clone)]
pub struct ObservationFrame {
    pub update: SensorUpdate,
    /// Wall-clock receipt time, drives the stale window.
    pub received_at_ms: u64,
}

impl ObservationFrame {
    pub fn seq(&self) -> u64 {
        self.update.ts
    }

    pub fn bot(&self) -> &str {
        &self.update.bot
    }
}

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(16 * 1024 * 1024)
        .new_codec()
}

pub fn encode_message(msg: &WireMessage) -> Result<tokio_util::bytes::Bytes> {
    Ok(tokio_util::bytes::Bytes::from(serde_json::to_vec(msg)?))
}

pub fn decode_message(payload: &[u8]) -> Result<WireMessage> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_update_round_trips_with_missing_fields() {
        let raw = r#"{
            "type": "sensor_update",
            "bot": "miner_7",
            "ts": 42,
            "location": {"x": 1.0, "y": 64.0, "z": -3.5, "world": "overworld"}
        }"#;
        let msg = decode_message(raw.as_bytes()).expect("decode");
        match msg {
            WireMessage::SensorUpdate(update) => {
                assert_eq!(update.bot, "miner_7");
                assert_eq!(update.ts, 42);
                assert!(update.blocks.is_empty());
                assert!(update.entities.is_empty());
                assert_eq!(update.health, 0.0);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn action_request_omits_empty_params() {
        let msg = WireMessage::Action(ActionRequest {
            target: "miner_7".to_string(),
            action: "chop_wood".to_string(),
            params: serde_json::Map::new(),
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(!json.contains("params"));
        assert!(json.contains("\"type\":\"action\""));
    }

    #[test]
    fn server_tick_uses_camel_case_fields() {
        let raw = r#"{"type":"server_tick","tick":100,"tps":19.8,"onlinePlayers":3,"loadedChunks":812}"#;
        let msg = decode_message(raw.as_bytes()).expect("decode");
        match msg {
            WireMessage::ServerTick(tick) => {
                assert_eq!(tick.tick, 100);
                assert_eq!(tick.online_players, 3);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn auth_handshake_messages_round_trip() {
        for msg in [
            WireMessage::AuthRequired,
            WireMessage::Auth {
                token: "tok".to_string(),
            },
            WireMessage::AuthSuccess,
            WireMessage::RegisterBot {
                bot: "lumberjack_2".to_string(),
            },
        ] {
            let encoded = encode_message(&msg).expect("encode");
            let decoded = decode_message(&encoded).expect("decode");
            assert_eq!(
                serde_json::to_string(&msg).expect("json"),
                serde_json::to_string(&decoded).expect("json")
            );
        }
    }
}
