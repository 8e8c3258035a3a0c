pub(crate) mod generator;

use std::collections::BTreeMap;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

pub use generator::{GeneratorSettings, PersonaGenerator};

const COMMUNICATION_STYLES: &[&str] = &["Direct", "Verbose", "Hesitant", "Friendly", "Formal"];
const PATIENCE_LEVELS: &[&str] = &[
    "Very Patient",
    "Patient",
    "Neutral",
    "Impatient",
    "Very Impatient",
];
const TECH_SAVVINESS: &[&str] = &["Low", "Medium", "High"];
const ATTITUDES: &[&str] = &[
    "Cooperative",
    "Skeptical",
    "Enthusiastic",
    "Indifferent",
    "Difficult",
];
const PRECISION_LEVELS: &[&str] = &[
    "Very Precise",
    "Precise",
    "Average",
    "Imprecise",
    "Careless",
];
const ERROR_PRONENESS: &[&str] = &[
    "Rarely Makes Mistakes",
    "Occasionally Makes Mistakes",
    "Often Makes Mistakes",
    "Frequently Needs Corrections",
];
const DECISIVENESS: &[&str] = &[
    "Very Decisive",
    "Decisive",
    "Neutral",
    "Indecisive",
    "Frequently Changes Mind",
];
const DETAIL_ORIENTATION: &[&str] = &[
    "Highly Detail-Oriented",
    "Detail-Oriented",
    "Moderate",
    "Big Picture Only",
    "Overlooks Details",
];
const CONSISTENCY: &[&str] = &[
    "Very Consistent",
    "Consistent",
    "Somewhat Consistent",
    "Inconsistent",
    "Contradicts Themselves",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub persona_id: Uuid,
    pub personality: Personality,
    pub goal: Goal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Personality {
    pub communication_style: String,
    pub patience_level: String,
    pub tech_savviness: String,
    pub attitude: String,
    pub precision_level: String,
    pub error_prone: String,
    pub decisiveness: String,
    pub detail_orientation: String,
    pub consistency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub extracted_vars_expected: BTreeMap<String, String>,
    pub call_context: CallContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_end_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_end_node_id: Option<String>,
}

/// Who placed the call, from the persona's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Direction {
    /// The persona calls the business.
    Outbound,
    /// The business calls the persona.
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub direction: Direction,
    pub entity_type: String,
    pub entity_context: String,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            direction: Direction::Outbound,
            entity_type: "business".to_owned(),
            entity_context: "You are contacting a business or service.".to_owned(),
        }
    }
}

fn pick<R: Rng + ?Sized>(rng: &mut R, options: &[&str]) -> String {
    options
        .choose(rng)
        .copied()
        .unwrap_or_default()
        .to_owned()
}

impl Personality {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            communication_style: pick(rng, COMMUNICATION_STYLES),
            patience_level: pick(rng, PATIENCE_LEVELS),
            tech_savviness: pick(rng, TECH_SAVVINESS),
            attitude: pick(rng, ATTITUDES),
            precision_level: pick(rng, PRECISION_LEVELS),
            error_prone: pick(rng, ERROR_PRONENESS),
            decisiveness: pick(rng, DECISIVENESS),
            detail_orientation: pick(rng, DETAIL_ORIENTATION),
            consistency: pick(rng, CONSISTENCY),
        }
    }

    pub fn headline(&self) -> String {
        format!(
            "{}, {}, {}",
            self.communication_style, self.patience_level, self.attitude
        )
    }
}

impl Persona {
    /// Instructions for the model that plays this persona during a call.
    pub fn system_prompt(&self) -> String {
        let personality = &self.personality;
        let context = &self.goal.call_context;

        let initiator = match context.direction {
            Direction::Outbound => "You are calling/contacting them (you initiated this interaction)",
            Direction::Inbound => "You are receiving this call (they contacted you)",
        };

        let goal = serde_json::to_string_pretty(&self.goal.extracted_vars_expected)
            .unwrap_or_else(|_| "{}".to_owned());

        format!(
            r#"You are roleplaying as a CUSTOMER in a conversation. You are calling or interacting with a business/service.

IMPORTANT: You are the CUSTOMER, not the business representative. Respond as someone who needs service.

Call Context:
- {initiator}
- {entity_context}

Personality:
- Communication Style: {communication_style}
- Patience Level: {patience_level}
- Tech Savviness: {tech_savviness}
- Attitude: {attitude}
- Precision Level: {precision_level}
- Error Prone: {error_prone}
- Decisiveness: {decisiveness}
- Detail Orientation: {detail_orientation}
- Consistency: {consistency}

Your Goal:
You need to provide the following information during this conversation:
{goal}

Instructions:
- You are the CUSTOMER calling/chatting with a business
- Stay in character based on your personality traits
- Provide the information naturally when asked
- Respond naturally to questions - don't dump all information at once
- Keep responses conversational and realistic (1-2 sentences typically)
- Embody your personality traits in how you communicate
- DO NOT act as if you work for the business - you are seeking their service

Ending the conversation:
- When you successfully complete your goal and are satisfied, say "GOODBYE" to end naturally
- If you get frustrated, confused, or feel the conversation isn't going anywhere, say "END_CALL" to end unsuccessfully
- Use your personality traits to decide when to give up (impatient personas give up faster, patient ones persist longer)"#,
            entity_context = context.entity_context,
            communication_style = personality.communication_style,
            patience_level = personality.patience_level,
            tech_savviness = personality.tech_savviness,
            attitude = personality.attitude,
            precision_level = personality.precision_level,
            error_prone = personality.error_prone,
            decisiveness = personality.decisiveness,
            detail_orientation = personality.detail_orientation,
            consistency = personality.consistency,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    pub(crate) fn persona_with_goal(goal: &[(&str, &str)]) -> Persona {
        Persona {
            persona_id: Uuid::new_v4(),
            personality: Personality::random(&mut StdRng::seed_from_u64(7)),
            goal: Goal {
                extracted_vars_expected: goal
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect(),
                call_context: CallContext::default(),
                target_end_node: None,
                target_end_node_id: None,
            },
        }
    }

    #[test]
    fn random_personality_draws_from_vocabulary() {
        let personality = Personality::random(&mut StdRng::seed_from_u64(42));

        assert!(COMMUNICATION_STYLES.contains(&personality.communication_style.as_str()));
        assert!(ERROR_PRONENESS.contains(&personality.error_prone.as_str()));
        assert!(CONSISTENCY.contains(&personality.consistency.as_str()));
    }

    #[test]
    fn direction_parses_case_insensitively() {
        assert_eq!("Inbound".parse::<Direction>().unwrap(), Direction::Inbound);
        assert_eq!(Direction::Outbound.to_string(), "outbound");
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn system_prompt_carries_goal_and_context() {
        let mut persona = persona_with_goal(&[("reservation_time", "7pm")]);
        persona.goal.call_context.direction = Direction::Inbound;
        persona.goal.call_context.entity_context = "The clinic confirms an appointment.".into();

        let prompt = persona.system_prompt();

        assert!(prompt.contains("\"reservation_time\": \"7pm\""));
        assert!(prompt.contains("You are receiving this call"));
        assert!(prompt.contains("The clinic confirms an appointment."));
        assert!(prompt.contains(&persona.personality.attitude));
    }
}
