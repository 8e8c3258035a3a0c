use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::{ConversationResult, ConversationState, ExtractedVariables, Speaker, Transcript};
use crate::llm::{ChatCompletion, CompletionOptions, LlmError, Message};
use crate::persona::Persona;
use crate::platform::{Platform, PlatformError, PlatformReply};

pub const GOODBYE: &str = "GOODBYE";
pub const END_CALL: &str = "END_CALL";

const NUDGE: &str = "Hello? Are you still there?";
const FALLBACK_UTTERANCE: &str = "Sorry, could you repeat that?";

static SPEAKER_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(user|assistant|\(bland\)\s*assistant)\s*:\s*")
        .expect("speaker prefix pattern is valid")
});

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("Failed to generate the persona's reply")]
    Persona(#[from] LlmError),
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    pub max_turns: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_tokens: 150,
            temperature: 0.8,
        }
    }
}

/// Keeps a single customer utterance: the first non-empty line, without any
/// transcript-style speaker label the model may have invented.
pub fn sanitize_utterance(raw: &str) -> String {
    let Some(first_line) = raw.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return FALLBACK_UTTERANCE.to_owned();
    };

    let cleaned = SPEAKER_PREFIX.replace(first_line, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        FALLBACK_UTTERANCE.to_owned()
    } else {
        cleaned.to_owned()
    }
}

/// `END_CALL` wins over `GOODBYE` when an utterance carries both.
pub fn termination(utterance: &str) -> Option<ConversationState> {
    let upper = utterance.to_uppercase();
    if upper.contains(END_CALL) {
        Some(ConversationState::EndedEndCall)
    } else if upper.contains(GOODBYE) {
        Some(ConversationState::EndedGoodbye)
    } else {
        None
    }
}

struct Session<'p> {
    persona: &'p Persona,
    state: ConversationState,
    chat_id: Option<String>,
    transcript: Transcript,
    variables: ExtractedVariables,
    visited_nodes: Vec<String>,
    /// What the persona model sees: the agent speaks as `user`, the persona
    /// as `assistant`.
    history: Vec<Message>,
    turns: usize,
    completed: bool,
    final_node: Option<String>,
    failure: Option<String>,
}

impl<'p> Session<'p> {
    fn new(persona: &'p Persona) -> Self {
        Self {
            persona,
            state: ConversationState::Started,
            chat_id: None,
            transcript: Transcript::default(),
            variables: ExtractedVariables::default(),
            visited_nodes: Vec::new(),
            history: Vec::new(),
            turns: 0,
            completed: false,
            final_node: None,
            failure: None,
        }
    }

    fn absorb(&mut self, reply: &PlatformReply) {
        self.variables.merge(&reply.variables);
        self.completed = reply.completed;
        if let Some(node) = &reply.current_node_name {
            if !self.visited_nodes.contains(node) {
                self.visited_nodes.push(node.clone());
            }
            self.final_node = Some(node.clone());
        }
    }

    fn record_agent(&mut self, reply: &PlatformReply) {
        for response in &reply.assistant_responses {
            tracing::debug!(persona = %self.persona.persona_id, "agent: {response}");
            self.transcript
                .push(Speaker::Agent, response, reply.current_node_name.clone());
            self.history.push(Message::user(response.as_str()));
        }
    }

    fn record_persona(&mut self, utterance: &str) {
        tracing::debug!(persona = %self.persona.persona_id, "persona: {utterance}");
        self.transcript.push(Speaker::Persona, utterance, None);
        self.history.push(Message::assistant(utterance));
    }

    fn into_result(self, pathway_id: &str) -> ConversationResult {
        ConversationResult {
            persona_id: self.persona.persona_id,
            chat_id: self.chat_id,
            pathway_id: pathway_id.to_owned(),
            state: self.state,
            completed: self.completed,
            total_turns: self.turns,
            final_node: self.final_node,
            visited_nodes: self.visited_nodes,
            final_variables: self.variables,
            transcript: self.transcript,
            failure: self.failure,
        }
    }
}

/// Plays one persona against one pathway until somebody hangs up.
pub struct ConversationDriver<'a, P, C> {
    platform: &'a P,
    model: &'a C,
    settings: DriverSettings,
}

impl<'a, P: Platform, C: ChatCompletion> ConversationDriver<'a, P, C> {
    pub fn new(platform: &'a P, model: &'a C, settings: DriverSettings) -> Self {
        Self {
            platform,
            model,
            settings,
        }
    }

    /// Never fails: API errors end the conversation in
    /// [`ConversationState::Failed`] with the partial transcript kept.
    pub async fn run(&self, persona: &Persona, pathway_id: &str) -> ConversationResult {
        tracing::info!(persona = %persona.persona_id, pathway_id, "starting conversation");

        let mut session = Session::new(persona);
        session.state = match self.drive(&mut session, pathway_id).await {
            Ok(state) => state,
            Err(error) => {
                let error = anyhow::Error::from(error);
                tracing::error!(persona = %persona.persona_id, "conversation failed: {error:#}");
                session.failure = Some(format!("{error:#}"));
                ConversationState::Failed
            }
        };

        tracing::info!(
            persona = %persona.persona_id,
            state = %session.state,
            turns = session.turns,
            "conversation ended"
        );
        session.into_result(pathway_id)
    }

    async fn drive(
        &self,
        session: &mut Session<'_>,
        pathway_id: &str,
    ) -> Result<ConversationState, DriverError> {
        let chat_id = self.platform.create_chat(pathway_id).await?;
        session.chat_id = Some(chat_id.clone());
        session.state = ConversationState::InProgress;

        let mut reply = self.platform.send_message(&chat_id, None).await?;
        session.absorb(&reply);
        let mut silent_turns = 0;

        loop {
            if reply.completed {
                session.record_agent(&reply);
                return Ok(ConversationState::PathwayCompleted);
            }
            if session.turns >= self.settings.max_turns {
                session.record_agent(&reply);
                return Ok(ConversationState::EndedMaxTurns);
            }

            session.turns += 1;
            session.record_agent(&reply);

            if reply.assistant_responses.is_empty() {
                silent_turns += 1;
            } else {
                silent_turns = 0;
            }

            // A silent pathway would otherwise make the persona model invent
            // both sides of the conversation.
            let utterance = if silent_turns >= 2 {
                END_CALL.to_owned()
            } else if silent_turns == 1 && session.turns > 1 {
                NUDGE.to_owned()
            } else {
                self.persona_reply(session).await?
            };

            session.record_persona(&utterance);
            let ending = termination(&utterance);

            // Delivered even when hanging up so last-moment variables land.
            reply = self.platform.send_message(&chat_id, Some(&utterance)).await?;
            session.absorb(&reply);

            if let Some(state) = ending {
                if !reply.assistant_responses.is_empty() {
                    tracing::debug!(
                        responses = ?reply.assistant_responses,
                        "agent replied after the persona hung up"
                    );
                }
                return Ok(state);
            }
        }
    }

    async fn persona_reply(&self, session: &Session<'_>) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(session.history.len() + 1);
        messages.push(Message::system(session.persona.system_prompt()));
        messages.extend(session.history.iter().cloned());

        let raw = self
            .model
            .complete(
                &messages,
                CompletionOptions {
                    max_tokens: Some(self.settings.max_tokens),
                    temperature: Some(self.settings.temperature),
                    json: false,
                },
            )
            .await?;

        Ok(sanitize_utterance(&raw))
    }
}
