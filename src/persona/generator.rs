use std::collections::{BTreeMap, HashMap};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::{CallContext, Direction, Goal, Persona, Personality};
use crate::cache::{OptionsCache, OptionsCacheKey, VariableOptions};
use crate::llm::{self, ChatCompletion, CompletionOptions, LlmError, Message};
use crate::platform::Pathway;
use crate::platform::pathway::{EndNode, VariableSpec};

#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("Pathway `{0}` declares no extractable variables")]
    NoVariables(String),
    #[error("Model returned unusable variable options after {attempts} attempt(s): {reason}")]
    Malformed { attempts: usize, reason: String },
    #[error("Persona {index} has no goal variables: the model produced no usable options")]
    EmptyGoal { index: usize },
    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub options_per_variable: usize,
    /// Attempts at the batched options request before giving up.
    pub max_attempts: usize,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            options_per_variable: 10,
            max_attempts: 3,
        }
    }
}

/// Personas that could be built, plus the ones that could not.
#[derive(Debug, Default)]
pub struct GenerationReport {
    pub personas: Vec<Persona>,
    pub failures: Vec<PersonaError>,
}

/// Everything needed to draw personas for one pathway without further
/// network calls.
#[derive(Debug, Clone)]
pub struct Blueprint {
    pub(crate) call_context: CallContext,
    pub(crate) variables: Vec<String>,
    pub(crate) options: VariableOptions,
    pub(crate) end_nodes: Vec<EndNode>,
}

pub struct PersonaGenerator<'a, C> {
    model: &'a C,
    cache: Option<&'a OptionsCache>,
    settings: GeneratorSettings,
}

#[derive(Deserialize)]
struct RawCallContext {
    direction: Option<String>,
    entity_type: Option<String>,
    entity_context: Option<String>,
}

impl TryFrom<RawCallContext> for CallContext {
    type Error = String;

    fn try_from(raw: RawCallContext) -> Result<Self, Self::Error> {
        let fallback = CallContext::default();
        let direction = raw.direction.unwrap_or_default();
        let direction = direction
            .trim()
            .parse::<Direction>()
            .map_err(|_| format!("unknown call direction `{direction}`"))?;
        let non_blank = |text: Option<String>| text.filter(|text| !text.trim().is_empty());

        Ok(CallContext {
            direction,
            entity_type: non_blank(raw.entity_type).unwrap_or(fallback.entity_type),
            entity_context: non_blank(raw.entity_context).unwrap_or(fallback.entity_context),
        })
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_owned(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Tolerant parse of `{variable: [options...]}`: keys are matched to the
/// pathway's variables ignoring case, scalars are stringified and blanks dropped.
fn validate_options(value: Value, variables: &[VariableSpec]) -> Result<VariableOptions, String> {
    let Value::Object(fields) = value else {
        return Err("expected a JSON object keyed by variable name".to_owned());
    };

    let by_lowercase: HashMap<String, &Value> = fields
        .iter()
        .map(|(name, options)| (name.to_lowercase(), options))
        .collect();

    let mut options = VariableOptions::new();
    for variable in variables {
        let Some(candidates) = fields
            .get(&variable.name)
            .or_else(|| by_lowercase.get(&variable.name.to_lowercase()).copied())
        else {
            continue;
        };

        let values: Vec<String> = match candidates {
            Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
            scalar => scalar_text(scalar).into_iter().collect(),
        };
        if !values.is_empty() {
            options.insert(variable.name.clone(), values);
        }
    }

    if options.is_empty() {
        return Err("no usable options for any pathway variable".to_owned());
    }
    Ok(options)
}

fn call_context_prompt(pathway: &Pathway) -> String {
    let prompts = serde_json::to_string_pretty(&pathway.prompt_excerpt(3))
        .unwrap_or_else(|_| "[]".to_owned());

    format!(
        r#"Analyze who INITIATED this phone call.

Pathway Name: {name}
AI Assistant Prompts:
{prompts}

WHO STARTED THE CALL?

If you see these phrases, the PERSONA called the business:
- "thank you for calling"
- "thanks for calling"
- "they have called"
- "how can I help you today"
-> Answer: "outbound" (persona called them)

If you see these phrases, the BUSINESS called the persona:
- "I'm calling about"
- "is this [name]?"
- "calling to inform"
-> Answer: "inbound" (they called persona)

Return JSON:
{{
  "direction": "outbound" or "inbound",
  "entity_type": "business type (e.g., reception, restaurant, bank)",
  "entity_context": "what this call is about (1 sentence)"
}}"#,
        name = pathway.name.as_deref().unwrap_or_default(),
    )
}

fn options_prompt(variables: &[VariableSpec], per_variable: usize) -> String {
    let described: Vec<Value> = variables
        .iter()
        .map(|variable| {
            serde_json::json!({
                "name": variable.name,
                "type": variable.kind,
                "description": variable.description,
            })
        })
        .collect();
    let described = serde_json::to_string_pretty(&described).unwrap_or_else(|_| "[]".to_owned());

    format!(
        r#"You are generating realistic test data for variables in a conversation pathway.

For each variable below, generate {per_variable} diverse, realistic options that someone might use in a real conversation.

Variables:
{described}

Return a JSON object where each key is the variable name and each value is an array of {per_variable} realistic options.

IMPORTANT:
- Use reasonable values based on context
- Be creative and diverse with the options

Return ONLY valid JSON, no additional text."#
    )
}

impl<'a, C: ChatCompletion> PersonaGenerator<'a, C> {
    pub fn new(model: &'a C, settings: GeneratorSettings) -> Self {
        Self {
            model,
            cache: None,
            settings,
        }
    }

    pub fn with_cache(mut self, cache: &'a OptionsCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Runs the model requests a pathway needs before personas can be drawn.
    pub async fn prepare(&self, pathway: &Pathway) -> Result<Blueprint, PersonaError> {
        let variables = pathway.extract_variables();
        if variables.is_empty() {
            return Err(PersonaError::NoVariables(
                pathway.display_name().to_owned(),
            ));
        }

        for (first, second) in pathway.semantic_duplicates() {
            tracing::warn!(
                "Variables '{first}' and '{second}' may represent the same information; personas may get conflicting values"
            );
        }

        let call_context = self.call_context(pathway).await;
        let options = self.variable_options(&variables).await?;
        tracing::info!(
            variables = options.len(),
            direction = %call_context.direction,
            "prepared persona blueprint"
        );

        Ok(Blueprint {
            call_context,
            variables: variables.into_iter().map(|variable| variable.name).collect(),
            options,
            end_nodes: pathway.end_nodes(),
        })
    }

    async fn call_context(&self, pathway: &Pathway) -> CallContext {
        let prompt = call_context_prompt(pathway);
        let determined = llm::complete_json::<_, RawCallContext>(self.model, &prompt)
            .await
            .map_err(|error| error.to_string())
            .and_then(CallContext::try_from);

        determined.unwrap_or_else(|problem| {
            tracing::warn!(%problem, "could not determine call context, assuming an outbound call");
            CallContext::default()
        })
    }

    async fn variable_options(
        &self,
        variables: &[VariableSpec],
    ) -> Result<VariableOptions, PersonaError> {
        let prompt = options_prompt(variables, self.settings.options_per_variable);
        let key = OptionsCacheKey::new(self.model.model(), &prompt);

        if let Some(cache) = self.cache {
            if let Some(options) = cache.get(&key).await {
                tracing::info!("using cached variable options");
                return Ok(options);
            }
        }

        let attempts = self.settings.max_attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            let reply = self
                .model
                .complete(
                    &[Message::user(prompt.as_str())],
                    CompletionOptions {
                        json: true,
                        ..Default::default()
                    },
                )
                .await?;

            match llm::parse_json_reply(&reply)
                .map_err(|error| error.to_string())
                .and_then(|value| validate_options(value, variables))
            {
                Ok(options) => {
                    if let Some(cache) = self.cache {
                        cache.insert(&key, &options).await;
                    }
                    return Ok(options);
                }
                Err(problem) => {
                    tracing::warn!(attempt, %problem, "model returned unusable variable options");
                    reason = problem;
                }
            }
        }

        Err(PersonaError::Malformed { attempts, reason })
    }
}

impl Blueprint {
    pub fn call_context(&self) -> &CallContext {
        &self.call_context
    }

    /// Draws `count` personas. A persona that ends up without goal variables
    /// is reported as a failure rather than aborting the batch.
    pub fn generate<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> GenerationReport {
        let mut report = GenerationReport::default();

        for index in 0..count {
            match self.persona(index, rng) {
                Ok(persona) => report.personas.push(persona),
                Err(error) => {
                    tracing::warn!(%error, "persona generation failed");
                    report.failures.push(error);
                }
            }
        }

        report
    }

    fn persona<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<Persona, PersonaError> {
        let extracted_vars_expected: BTreeMap<String, String> = self
            .variables
            .iter()
            .filter_map(|name| {
                let value = self.options.get(name)?.choose(rng)?;
                Some((name.clone(), value.clone()))
            })
            .collect();

        if extracted_vars_expected.is_empty() {
            return Err(PersonaError::EmptyGoal { index });
        }

        let target = self.end_nodes.choose(rng);

        Ok(Persona {
            persona_id: Uuid::new_v4(),
            personality: Personality::random(rng),
            goal: Goal {
                extracted_vars_expected,
                call_context: self.call_context.clone(),
                target_end_node: target.map(|node| node.name.clone()),
                target_end_node_id: target.map(|node| node.id.clone()),
            },
        })
    }
}
