pub(crate) mod driver;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;
use uuid::Uuid;

pub use driver::{ConversationDriver, DriverSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversationState {
    Started,
    InProgress,
    /// The persona said GOODBYE.
    EndedGoodbye,
    /// The persona gave up with END_CALL.
    EndedEndCall,
    EndedMaxTurns,
    /// The pathway itself reported completion.
    PathwayCompleted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Speaker {
    Persona,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// Append-only record of who said what.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn push(&mut self, speaker: Speaker, text: impl Into<String>, node: Option<String>) {
        self.turns.push(Turn {
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
            node,
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }
}

/// Variables the pathway captured so far. Values only ever get added or
/// overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedVariables(BTreeMap<String, String>);

impl ExtractedVariables {
    pub fn merge(&mut self, variables: &Map<String, Value>) {
        for (name, value) in variables {
            let value = match value {
                Value::Null => continue,
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            self.0.insert(name.clone(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ExtractedVariables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationResult {
    pub persona_id: Uuid,
    pub chat_id: Option<String>,
    pub pathway_id: String,
    pub state: ConversationState,
    /// Whether the platform flagged the pathway as completed.
    pub completed: bool,
    pub total_turns: usize,
    pub final_node: Option<String>,
    pub visited_nodes: Vec<String>,
    pub final_variables: ExtractedVariables,
    pub transcript: Transcript,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ConversationResult {
    pub fn ended_naturally(&self) -> bool {
        self.state == ConversationState::EndedGoodbye
    }
}
