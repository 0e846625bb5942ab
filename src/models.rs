//! Core data models used throughout convo-evidence.
//!
//! These types represent the items, exchanges, messages and evidence records
//! that flow through the reveal → extract → assemble → persist pipeline. The
//! serialized field names are the evidence file format.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Current evidence file format.
pub const FORMAT_VERSION: &str = "1.0";

/// Version of the structured derivation written into `structured.derivation`.
pub const DERIVATION_VERSION: &str = "1";

/// One element of a batch (one conversation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Identity as provided by the catalog; normalized by the orchestrator.
    pub identity: String,
    pub title: Option<String>,
    /// Where the item lives (URL, fixture path).
    pub locator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserInput,
    Thinking,
    AssistantResponse,
}

impl MessageType {
    pub fn speaker(&self) -> Speaker {
        match self {
            MessageType::UserInput => Speaker::User,
            MessageType::Thinking | MessageType::AssistantResponse => Speaker::Assistant,
        }
    }
}

/// A named segment of revealed reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThinkingStage {
    pub name: String,
    pub text: String,
}

/// A single message inside an exchange.
///
/// Thinking messages carry `stages` and a null `text`; every other type
/// carries `text` and null `stages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub message_index: usize,
    pub speaker: Speaker,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub text: Option<String>,
    pub stages: Option<Vec<ThinkingStage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_position: Option<usize>,
}

impl Message {
    pub fn text(
        message_index: usize,
        message_type: MessageType,
        text: String,
        duplicate_position: Option<usize>,
    ) -> Self {
        Self {
            message_index,
            speaker: message_type.speaker(),
            message_type,
            text: Some(text),
            stages: None,
            duplicate_position,
        }
    }

    pub fn thinking(message_index: usize, stages: Vec<ThinkingStage>) -> Self {
        Self {
            message_index,
            speaker: Speaker::Assistant,
            message_type: MessageType::Thinking,
            text: None,
            stages: Some(stages),
            duplicate_position: None,
        }
    }

    /// Thinking-xor-text rule.
    pub fn is_well_formed(&self) -> bool {
        match self.message_type {
            MessageType::Thinking => self.text.is_none() && self.stages.is_some(),
            _ => self.text.is_some() && self.stages.is_none(),
        }
    }
}

/// One user/assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Exchange {
    pub exchange_index: usize,
    pub container_identity: String,
    pub messages: Vec<Message>,
}

/// Stable identity → revealed stages, built once per item by the sweep.
pub type RevealedContentMap = HashMap<String, Vec<ThinkingStage>>;

// ═══════════════════════════════════════════════════════════════════════
// Evidence record
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub name: String,
    pub version: String,
    pub adapter_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Derivation {
    pub source: String,
    pub version: String,
    pub parsed_at: String,
}

/// The structured derivation of a raw snapshot. This whole section is the
/// input of `hash_structured`, so it and everything inside it reject unknown
/// fields: anything a typed round trip would drop must fail verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredData {
    pub item_id: String,
    pub title: String,
    pub url: String,
    pub exchange_count: usize,
    pub message_count: usize,
    pub exchanges: Vec<Exchange>,
    pub derivation: Derivation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityProof {
    pub hash_raw: String,
    pub hash_structured: String,
    pub algorithm: String,
    pub computed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub item_id: String,
    pub url: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os: String,
    pub arch: String,
    pub family: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionParameters {
    pub strategy: String,
    pub revealed_count: usize,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub timestamp: String,
    pub collector: CollectorInfo,
    pub source: SourceInfo,
    pub environment: EnvironmentInfo,
    pub extraction_parameters: ExtractionParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub location: String,
    pub format: String,
    pub compression: String,
}

/// Provenance documentation; not covered by the content hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Custody {
    pub collection: Collection,
    pub storage: StorageInfo,
}

/// Immutable package of raw snapshot, structured derivation, integrity proof
/// and provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: String,
    pub format_version: String,
    pub platform: PlatformInfo,
    pub exported_at: String,
    pub raw_snapshot: String,
    pub structured: StructuredData,
    pub integrity: IntegrityProof,
    pub custody: Custody,
}

// ═══════════════════════════════════════════════════════════════════════
// Batch state
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Idle,
    Selecting,
    Revealing,
    Extracting,
    Persisting,
    Scheduling,
    Paused,
    Completed,
    Failed,
}

impl MachineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MachineState::Completed)
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MachineState::Idle => "idle",
            MachineState::Selecting => "selecting",
            MachineState::Revealing => "revealing",
            MachineState::Extracting => "extracting",
            MachineState::Persisting => "persisting",
            MachineState::Scheduling => "scheduling",
            MachineState::Paused => "paused",
            MachineState::Completed => "completed",
            MachineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Process-wide batch state. Mutated only by the orchestrator.
#[derive(Debug, Clone)]
pub struct BatchState {
    pub current_index: usize,
    pub identity_to_sequence: HashMap<String, usize>,
    pub machine_state: MachineState,
}

impl Default for BatchState {
    fn default() -> Self {
        Self {
            current_index: 0,
            identity_to_sequence: HashMap::new(),
            machine_state: MachineState::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_message_serializes_null_text() {
        let msg = Message::thinking(
            1,
            vec![ThinkingStage {
                name: "Planning".into(),
                text: "step".into(),
            }],
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "thinking");
        assert!(v["text"].is_null());
        assert_eq!(v["stages"][0]["name"], "Planning");
        assert!(v.get("duplicate_position").is_none());
        assert!(msg.is_well_formed());
    }

    #[test]
    fn text_message_has_null_stages() {
        let msg = Message::text(0, MessageType::UserInput, "hi".into(), Some(1));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["speaker"], "user");
        assert_eq!(v["type"], "user_input");
        assert!(v["stages"].is_null());
        assert_eq!(v["duplicate_position"], 1);
        assert!(msg.is_well_formed());
    }

    #[test]
    fn malformed_message_detected() {
        let mut msg = Message::text(0, MessageType::AssistantResponse, "x".into(), None);
        msg.stages = Some(vec![]);
        assert!(!msg.is_well_formed());
    }
}
