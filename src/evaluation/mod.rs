pub(crate) mod compare;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::conversation::{ConversationResult, ConversationState, ExtractedVariables};
use crate::persona::Persona;
use crate::platform::Pathway;

pub use compare::{MatchKind, compare};

/// Platform bookkeeping that never counts as an extra variable.
const SYSTEM_VARIABLES: [&str; 5] = ["callID", "channel", "call_id", "chat_id", "BlandStatusCode"];

/// When a conversation counts as a pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationPolicy {
    /// Minimum full-match percentage.
    pub pass_threshold: f64,
    /// Also require the persona to have said GOODBYE.
    pub require_goodbye: bool,
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self {
            pass_threshold: 80.0,
            require_goodbye: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMatch {
    pub expected: String,
    pub actual: Option<String>,
    /// `None` when the variable does not apply to the path taken.
    pub matched: Option<bool>,
    pub match_type: MatchKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub total_expected: usize,
    pub total_matched: usize,
    pub total_partial: usize,
    pub total_missing: usize,
    pub total_extra: usize,
    pub total_not_on_path: usize,
    pub match_percentage: f64,
    pub partial_match_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub persona_id: Uuid,
    pub chat_id: Option<String>,
    pub state: ConversationState,
    pub pathway_completed: bool,
    pub total_turns: usize,
    pub visited_nodes: Vec<String>,
    pub expected_variables_for_path: BTreeMap<String, String>,
    pub all_persona_expected_variables: BTreeMap<String, String>,
    pub extracted_variables: ExtractedVariables,
    pub variable_matches: BTreeMap<String, VariableMatch>,
    pub match_summary: MatchSummary,
    pub verdict: Verdict,
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        100.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Scores a finished conversation against the persona's goal.
///
/// With a pathway definition, only the goal variables extracted by nodes the
/// conversation actually visited are expected; the rest are reported as
/// `not_on_path`. Without one, or when the visited nodes extract nothing,
/// every goal variable is expected.
///
/// The result depends only on the inputs, so re-evaluating is idempotent.
pub fn evaluate(
    result: &ConversationResult,
    persona: &Persona,
    pathway: Option<&Pathway>,
    policy: &EvaluationPolicy,
) -> Evaluation {
    let all_expected = &persona.goal.extracted_vars_expected;
    let actual = &result.final_variables;

    let path_variables = pathway
        .map(|pathway| pathway.variables_for_nodes(result.visited_nodes.as_slice()))
        .filter(|variables| !variables.is_empty());

    let relevant: BTreeMap<String, String> = all_expected
        .iter()
        .filter(|(name, _)| {
            path_variables
                .as_ref()
                .is_none_or(|variables| variables.contains(&name.trim().to_lowercase()))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut summary = MatchSummary {
        total_expected: relevant.len(),
        total_not_on_path: all_expected.len() - relevant.len(),
        ..Default::default()
    };
    let mut variable_matches = BTreeMap::new();

    for (name, expected) in all_expected {
        let observed = actual.get(name);
        let match_type = if !relevant.contains_key(name) {
            MatchKind::NotOnPath
        } else {
            match observed {
                Some(observed) => compare(expected, observed),
                None => MatchKind::NotExtracted,
            }
        };

        if match_type != MatchKind::NotOnPath {
            if match_type.is_full_match() {
                summary.total_matched += 1;
            } else if match_type == MatchKind::Partial {
                summary.total_partial += 1;
            } else {
                summary.total_missing += 1;
            }
        }

        variable_matches.insert(
            name.clone(),
            VariableMatch {
                expected: expected.clone(),
                actual: observed.map(str::to_owned),
                matched: (match_type != MatchKind::NotOnPath).then(|| match_type.is_match()),
                match_type,
            },
        );
    }

    summary.total_extra = actual
        .names()
        .filter(|name| !SYSTEM_VARIABLES.contains(name) && !relevant.contains_key(*name))
        .count();
    summary.match_percentage = percentage(summary.total_matched, summary.total_expected);
    summary.partial_match_percentage = percentage(
        summary.total_matched + summary.total_partial,
        summary.total_expected,
    );

    let passed = summary.match_percentage >= policy.pass_threshold
        && (!policy.require_goodbye || result.ended_naturally());

    Evaluation {
        persona_id: result.persona_id,
        chat_id: result.chat_id.clone(),
        state: result.state,
        pathway_completed: result.completed,
        total_turns: result.total_turns,
        visited_nodes: result.visited_nodes.clone(),
        expected_variables_for_path: relevant,
        all_persona_expected_variables: all_expected.clone(),
        extracted_variables: actual.clone(),
        variable_matches,
        match_summary: summary,
        verdict: if passed { Verdict::Pass } else { Verdict::Fail },
    }
}

/// Scores of a whole batch of conversations.
#[derive(Debug, Default)]
pub struct BatchEvaluation {
    pub evaluations: Vec<Evaluation>,
    /// Runs that aborted on an API error. They have no evaluation.
    pub failed_runs: usize,
    /// Results whose persona is not among the given personas.
    pub orphaned: Vec<Uuid>,
}

/// Scores every result that ran to an ending, in order.
pub fn evaluate_batch<'p>(
    results: &[ConversationResult],
    personas: &[Persona],
    pathway_for: impl Fn(&str) -> Option<&'p Pathway>,
    policy: &EvaluationPolicy,
) -> BatchEvaluation {
    let mut batch = BatchEvaluation::default();

    for result in results {
        if result.state == ConversationState::Failed {
            batch.failed_runs += 1;
            continue;
        }
        let Some(persona) = personas
            .iter()
            .find(|persona| persona.persona_id == result.persona_id)
        else {
            batch.orphaned.push(result.persona_id);
            continue;
        };

        batch.evaluations.push(evaluate(
            result,
            persona,
            pathway_for(&result.pathway_id),
            policy,
        ));
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Transcript;
    use crate::persona::tests::persona_with_goal;
    use crate::platform::pathway::tests::restaurant_pathway;
    use crate::report::{BatchSummary, FinalVerdict};
    use pretty_assertions::assert_eq;

    fn finished(
        persona: &Persona,
        state: ConversationState,
        variables: &[(&str, &str)],
        visited: &[&str],
    ) -> ConversationResult {
        ConversationResult {
            persona_id: persona.persona_id,
            chat_id: Some("chat-1".into()),
            pathway_id: "pathway-1".into(),
            state,
            completed: false,
            total_turns: 4,
            final_node: visited.last().map(|node| node.to_string()),
            visited_nodes: visited.iter().map(|node| node.to_string()).collect(),
            final_variables: variables.iter().copied().collect(),
            transcript: Transcript::default(),
            failure: None,
        }
    }

    #[test]
    fn format_tolerant_time_scores_full_marks() {
        let persona = persona_with_goal(&[("reservation_time", "7pm")]);
        let result = finished(
            &persona,
            ConversationState::EndedGoodbye,
            &[("reservation_time", "7:00 PM")],
            &[],
        );

        let evaluation = evaluate(&result, &persona, None, &EvaluationPolicy::default());

        assert_eq!(evaluation.match_summary.match_percentage, 100.0);
        assert_eq!(
            evaluation.variable_matches["reservation_time"].match_type,
            MatchKind::Time
        );
        assert_eq!(evaluation.verdict, Verdict::Pass);
    }

    #[test]
    fn missing_variable_fails_a_strict_threshold() {
        let persona = persona_with_goal(&[
            ("name", "Ada"),
            ("party_size", "4"),
            ("reservation_time", "7pm"),
        ]);
        let result = finished(
            &persona,
            ConversationState::EndedGoodbye,
            &[("name", "ada"), ("party_size", "4")],
            &[],
        );
        let policy = EvaluationPolicy {
            pass_threshold: 100.0,
            require_goodbye: false,
        };

        let evaluation = evaluate(&result, &persona, None, &policy);
        let summary = &evaluation.match_summary;

        assert_eq!(summary.total_expected, 3);
        assert_eq!(summary.total_matched, 2);
        assert_eq!(summary.total_missing, 1);
        assert_eq!(format!("{:.1}", summary.match_percentage), "66.7");
        assert_eq!(evaluation.verdict, Verdict::Fail);
        assert_eq!(
            evaluation.variable_matches["reservation_time"],
            VariableMatch {
                expected: "7pm".into(),
                actual: None,
                matched: Some(false),
                match_type: MatchKind::NotExtracted,
            }
        );
    }

    #[test]
    fn evaluation_is_idempotent() {
        let persona = persona_with_goal(&[("name", "Ada"), ("party_size", "4")]);
        let result = finished(
            &persona,
            ConversationState::EndedMaxTurns,
            &[("name", "Ada L."), ("party_size", "five")],
            &[],
        );
        let policy = EvaluationPolicy::default();

        let first = evaluate(&result, &persona, None, &policy);
        let second = evaluate(&result, &persona, None, &policy);

        assert_eq!(first, second);
        assert_eq!(first.match_summary.total_partial, 1);
        assert_eq!(first.match_summary.match_percentage, 0.0);
        assert_eq!(first.match_summary.partial_match_percentage, 50.0);
    }

    #[test]
    fn only_variables_on_the_visited_path_are_expected() {
        let persona = persona_with_goal(&[("name", "Ada"), ("party_size", "4")]);
        let result = finished(
            &persona,
            ConversationState::EndedEndCall,
            &[("name", "Ada"), ("callID", "x"), ("mood", "happy")],
            &["Greeting"],
        );
        let pathway = restaurant_pathway();

        let evaluation = evaluate(&result, &persona, Some(&pathway), &EvaluationPolicy::default());
        let summary = &evaluation.match_summary;

        assert_eq!(summary.total_expected, 1);
        assert_eq!(summary.total_not_on_path, 1);
        assert_eq!(summary.total_extra, 1);
        assert_eq!(summary.match_percentage, 100.0);
        assert_eq!(evaluation.variable_matches["party_size"].matched, None);
        assert_eq!(
            evaluation.variable_matches["party_size"].match_type,
            MatchKind::NotOnPath
        );
    }

    #[test]
    fn path_variables_match_regardless_of_spelling() {
        let persona = persona_with_goal(&[("name", "Ada"), ("reservation_time", "7pm")]);
        let result = finished(
            &persona,
            ConversationState::EndedGoodbye,
            &[("name", "Ada"), ("reservation_time", "7pm")],
            &["Booking"],
        );
        let pathway = restaurant_pathway();

        let evaluation = evaluate(&result, &persona, Some(&pathway), &EvaluationPolicy::default());

        assert_eq!(evaluation.match_summary.total_expected, 2);
        assert_eq!(evaluation.match_summary.total_not_on_path, 0);
        assert_eq!(evaluation.variable_matches["name"].match_type, MatchKind::Exact);
    }

    #[test]
    fn unknown_path_falls_back_to_every_goal_variable() {
        let persona = persona_with_goal(&[("name", "Ada"), ("party_size", "4")]);
        let result = finished(
            &persona,
            ConversationState::EndedGoodbye,
            &[("name", "Ada")],
            &["Some node the pathway does not have"],
        );
        let pathway = restaurant_pathway();

        let evaluation = evaluate(&result, &persona, Some(&pathway), &EvaluationPolicy::default());

        assert_eq!(evaluation.match_summary.total_expected, 2);
        assert_eq!(evaluation.match_summary.match_percentage, 50.0);
    }

    #[test]
    fn batch_skips_aborted_runs() {
        let persona = persona_with_goal(&[("name", "Ada")]);
        let aborted_persona = persona_with_goal(&[("name", "Grace")]);
        let mut aborted = finished(&aborted_persona, ConversationState::Failed, &[], &[]);
        aborted.failure = Some("chat expired".into());
        let results = vec![
            finished(&persona, ConversationState::EndedGoodbye, &[("name", "Ada")], &[]),
            aborted,
        ];

        let batch = evaluate_batch(
            &results,
            &[persona.clone(), aborted_persona],
            |_| None,
            &EvaluationPolicy::default(),
        );

        assert_eq!(batch.failed_runs, 1);
        assert_eq!(batch.evaluations.len(), 1);
        assert_eq!(batch.evaluations[0].persona_id, persona.persona_id);
        assert_eq!(batch.evaluations[0].match_summary.match_percentage, 100.0);
        assert!(batch.orphaned.is_empty());

        let summary = BatchSummary::new(&batch.evaluations, batch.failed_runs);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.failed_runs, 1);
        assert_eq!(summary.verdict(), FinalVerdict::Pass);
    }

    #[test]
    fn batch_reports_results_without_a_persona() {
        let persona = persona_with_goal(&[("name", "Ada")]);
        let results = vec![finished(
            &persona,
            ConversationState::EndedGoodbye,
            &[("name", "Ada")],
            &[],
        )];

        let batch = evaluate_batch(&results, &[], |_| None, &EvaluationPolicy::default());

        assert!(batch.evaluations.is_empty());
        assert_eq!(batch.orphaned, vec![persona.persona_id]);
    }

    #[test]
    fn goodbye_can_be_required_to_pass() {
        let persona = persona_with_goal(&[("name", "Ada")]);
        let result = finished(&persona, ConversationState::EndedEndCall, &[("name", "Ada")], &[]);
        let policy = EvaluationPolicy {
            pass_threshold: 100.0,
            require_goodbye: true,
        };

        assert_eq!(evaluate(&result, &persona, None, &policy).verdict, Verdict::Fail);
        assert_eq!(
            evaluate(&result, &persona, None, &EvaluationPolicy::default()).verdict,
            Verdict::Pass
        );
    }
}
