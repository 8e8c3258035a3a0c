use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::conversation::{ConversationResult, ConversationState, Speaker};
use crate::evaluation::{Evaluation, MatchKind, Verdict};
use crate::persona::Persona;
use crate::platform::Pathway;

pub const RESULTS_FILE: &str = "pathway_results.json";
pub const EVALUATIONS_FILE: &str = "pathway_evaluations.json";
pub const PERSONAS_FILE: &str = "test_personas.json";

/// Saved personas together with the pathway they were generated for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaFile {
    pub pathway_id: String,
    pub pathway_name: String,
    pub generated_at: DateTime<Utc>,
    pub total_personas: usize,
    pub personas: Vec<Persona>,
}

impl PersonaFile {
    pub fn new(pathway_id: &str, pathway: &Pathway, personas: Vec<Persona>) -> Self {
        Self {
            pathway_id: pathway_id.to_owned(),
            pathway_name: pathway.display_name().to_owned(),
            generated_at: Utc::now(),
            total_personas: personas.len(),
            personas,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Band {
    Success,
    Partial,
    Failed,
}

impl Band {
    pub fn of(match_percentage: f64) -> Self {
        if match_percentage >= 80.0 {
            Self::Success
        } else if match_percentage >= 50.0 {
            Self::Partial
        } else {
            Self::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FinalVerdict {
    #[strum(serialize = "PASS - Pathway performing well")]
    Pass,
    #[strum(serialize = "NEEDS IMPROVEMENT - Some issues detected")]
    NeedsImprovement,
    #[strum(serialize = "FAIL - Significant issues found")]
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub natural_endings: usize,
    pub give_up_endings: usize,
    pub failed_runs: usize,
    pub passed: usize,
    pub average_match: f64,
    pub average_turns: f64,
}

fn count(evaluations: &[Evaluation], predicate: impl Fn(&Evaluation) -> bool) -> usize {
    evaluations.iter().filter(|&evaluation| predicate(evaluation)).count()
}

impl BatchSummary {
    /// `failed_runs` counts conversations that aborted on an API error and
    /// therefore have no evaluation.
    pub fn new(evaluations: &[Evaluation], failed_runs: usize) -> Self {
        let total = evaluations.len();
        if total == 0 {
            return Self {
                failed_runs,
                ..Default::default()
            };
        }

        Self {
            total,
            completed: count(evaluations, |e| {
                e.pathway_completed
                    || matches!(
                        e.state,
                        ConversationState::EndedGoodbye | ConversationState::PathwayCompleted
                    )
            }),
            natural_endings: count(evaluations, |e| e.state == ConversationState::EndedGoodbye),
            give_up_endings: count(evaluations, |e| e.state == ConversationState::EndedEndCall),
            failed_runs,
            passed: count(evaluations, |e| e.verdict == Verdict::Pass),
            average_match: evaluations
                .iter()
                .map(|e| e.match_summary.match_percentage)
                .sum::<f64>()
                / total as f64,
            average_turns: evaluations.iter().map(|e| e.total_turns as f64).sum::<f64>()
                / total as f64,
        }
    }

    pub fn completion_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }

    pub fn verdict(&self) -> FinalVerdict {
        if self.total == 0 {
            FinalVerdict::Fail
        } else if self.average_match >= 80.0 && self.completion_rate() >= 80.0 {
            FinalVerdict::Pass
        } else if self.average_match >= 50.0 {
            FinalVerdict::NeedsImprovement
        } else {
            FinalVerdict::Fail
        }
    }
}

pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    tokio::fs::write(path, serialized)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn print_banner(text: &str) {
    println!("\n{}", "=".repeat(70));
    println!("  {text}");
    println!("{}", "=".repeat(70));
}

pub fn print_persona(persona: &Persona) {
    println!("Personality: {}", persona.personality.headline());
    println!(
        "Goal: {}",
        persona.goal.extracted_vars_expected.keys().join(", ")
    );
}

pub fn print_transcript(result: &ConversationResult) {
    for turn in result.transcript.turns() {
        match turn.speaker {
            Speaker::Agent => println!("Agent: {}", turn.text),
            Speaker::Persona => println!("Persona: {}", turn.text),
        }
    }
}

pub fn print_outcome(evaluation: &Evaluation) {
    let percentage = evaluation.match_summary.match_percentage;
    println!(
        "\n{}: {percentage:.1}% match - {} ({})",
        Band::of(percentage),
        evaluation.state,
        evaluation.verdict
    );
}

fn print_missing(evaluation: &Evaluation) {
    let missing = evaluation.variable_matches.iter().filter(|(_, variable)| {
        variable.matched == Some(false) && variable.match_type != MatchKind::NotOnPath
    });

    for (name, variable) in missing {
        println!(
            "         - {name}: expected '{}', got '{}'",
            variable.expected,
            variable.actual.as_deref().unwrap_or("NOT EXTRACTED")
        );
    }
}

pub fn print_summary(summary: &BatchSummary, evaluations: &[Evaluation]) {
    print_banner("SUMMARY");

    println!("\nOverall Stats:");
    println!("   Total Tests: {}", summary.total);
    println!(
        "   Completed: {}/{} ({:.1}%)",
        summary.completed,
        summary.total,
        summary.completion_rate()
    );
    println!("   Natural Endings: {}", summary.natural_endings);
    println!("   Failed Endings: {}", summary.give_up_endings);
    println!("   Aborted Runs: {}", summary.failed_runs);
    println!("   Passed: {}/{}", summary.passed, summary.total);
    println!("   Avg Match Rate: {:.1}%", summary.average_match);
    println!("   Avg Turns: {:.1}", summary.average_turns);

    println!("\nIndividual Results:");
    for (index, evaluation) in evaluations.iter().enumerate() {
        let match_summary = &evaluation.match_summary;
        println!(
            "\n   [{}] Persona {}:",
            Band::of(match_summary.match_percentage),
            index + 1
        );
        println!(
            "      Match: {:.1}% ({}/{})",
            match_summary.match_percentage, match_summary.total_matched, match_summary.total_expected
        );
        println!("      End: {}", evaluation.state);
        println!("      Turns: {}", evaluation.total_turns);

        if !evaluation.visited_nodes.is_empty() {
            let ellipsis = if evaluation.visited_nodes.len() > 3 { "..." } else { "" };
            println!(
                "      Path: {}{ellipsis}",
                evaluation.visited_nodes.iter().take(3).join(" -> ")
            );
        }
        if match_summary.total_not_on_path > 0 {
            println!(
                "      {} variable(s) not required for path taken",
                match_summary.total_not_on_path
            );
        }
        if match_summary.total_missing > 0 {
            println!("      Missing variables (expected for this path):");
            print_missing(evaluation);
        }
    }

    print_banner("FINAL VERDICT");
    println!("{}", summary.verdict());
    println!("\nOverall Match Rate: {:.1}%", summary.average_match);
    println!("Success Rate: {:.1}%\n", summary.completion_rate());
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::conversation::ExtractedVariables;
    use crate::evaluation::MatchSummary;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn scored(state: ConversationState, match_percentage: f64, turns: usize) -> Evaluation {
        Evaluation {
            persona_id: Uuid::new_v4(),
            chat_id: None,
            state,
            pathway_completed: false,
            total_turns: turns,
            visited_nodes: Vec::new(),
            expected_variables_for_path: BTreeMap::new(),
            all_persona_expected_variables: BTreeMap::new(),
            extracted_variables: ExtractedVariables::default(),
            variable_matches: BTreeMap::new(),
            match_summary: MatchSummary {
                match_percentage,
                ..Default::default()
            },
            verdict: if match_percentage >= 80.0 {
                Verdict::Pass
            } else {
                Verdict::Fail
            },
        }
    }

    #[test]
    fn bands_follow_percentage_cutoffs() {
        assert_eq!(Band::of(80.0), Band::Success);
        assert_eq!(Band::of(66.7), Band::Partial);
        assert_eq!(Band::of(49.9), Band::Failed);
    }

    #[test]
    fn summarizes_a_healthy_batch() {
        let evaluations = vec![
            scored(ConversationState::EndedGoodbye, 100.0, 6),
            scored(ConversationState::PathwayCompleted, 100.0, 8),
            scored(ConversationState::EndedGoodbye, 75.0, 4),
            scored(ConversationState::EndedGoodbye, 100.0, 6),
            scored(ConversationState::EndedEndCall, 50.0, 6),
        ];

        let summary = BatchSummary::new(&evaluations, 1);

        assert_eq!(summary.total, 5);
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.natural_endings, 3);
        assert_eq!(summary.give_up_endings, 1);
        assert_eq!(summary.failed_runs, 1);
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.average_match, 85.0);
        assert_eq!(summary.average_turns, 6.0);
        assert_eq!(summary.verdict(), FinalVerdict::Pass);
    }

    #[test]
    fn low_completion_needs_improvement() {
        let evaluations = vec![
            scored(ConversationState::EndedMaxTurns, 100.0, 50),
            scored(ConversationState::EndedGoodbye, 60.0, 5),
        ];

        assert_eq!(
            BatchSummary::new(&evaluations, 0).verdict(),
            FinalVerdict::NeedsImprovement
        );
    }

    #[test]
    fn empty_batch_fails() {
        let summary = BatchSummary::new(&[], 3);

        assert_eq!(summary.failed_runs, 3);
        assert_eq!(summary.verdict(), FinalVerdict::Fail);
    }

    #[tokio::test]
    async fn json_files_round_trip_through_disk() {
        let path = std::env::temp_dir().join(format!("pathway-harness-{}.json", Uuid::new_v4()));
        let evaluations = vec![scored(ConversationState::EndedGoodbye, 100.0, 3)];

        write_json(&path, &evaluations).await.unwrap();
        let read: Vec<Evaluation> = read_json(&path).await.unwrap();

        assert_eq!(read, evaluations);
        let _ = tokio::fs::remove_file(path).await;
    }
}
