mod cache;
mod config;
mod conversation;
mod evaluation;
mod llm;
mod persona;
mod platform;
mod report;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use futures_util::StreamExt;
use serde::Deserialize;
use structopt::StructOpt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cache::OptionsCache;
use config::Settings;
use conversation::{ConversationDriver, ConversationResult, ConversationState};
use evaluation::{Evaluation, EvaluationPolicy};
use llm::ChatClient;
use persona::{GeneratorSettings, Persona, PersonaGenerator};
use platform::{Pathway, PlatformClient};
use report::{BatchSummary, PersonaFile};

#[derive(Deserialize, Debug)]
struct Environment {
    bland_api_key: Option<String>,
    openrouter_api_key: Option<String>,
    openrouter_base_url: Option<String>,
}

impl Environment {
    fn bland_api_key(&self) -> anyhow::Result<&str> {
        self.bland_api_key
            .as_deref()
            .context("BLAND_API_KEY environment variable not set")
    }

    fn chat_client(&self, settings: &Settings) -> anyhow::Result<ChatClient> {
        let api_key = self
            .openrouter_api_key
            .as_deref()
            .context("OPENROUTER_API_KEY environment variable not set")?;
        let base_url = self
            .openrouter_base_url
            .as_deref()
            .unwrap_or(llm::DEFAULT_BASE_URL);
        Ok(ChatClient::new(base_url, api_key, &settings.llm.model))
    }

    fn platform_client(&self, settings: &Settings) -> anyhow::Result<PlatformClient> {
        Ok(PlatformClient::new(
            self.bland_api_key()?,
            &settings.platform.api_base,
            &settings.platform.chat_base,
        ))
    }
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "pathway-harness",
    about = "Regression-test conversational pathways with simulated personas"
)]
struct Args {
    /// Path to a harness configuration TOML file
    #[structopt(short = "c", long)]
    config: Option<PathBuf>,

    /// Directory for exported personas, results and evaluations
    #[structopt(short, long, default_value = ".")]
    output_dir: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Generate personas, run them against a pathway and score the results
    Run {
        pathway_id: String,

        /// Number of personas to generate
        persona_count: Option<usize>,

        /// Turn ceiling per conversation
        #[structopt(long)]
        max_turns: Option<usize>,

        /// Conversations to run at the same time
        #[structopt(long)]
        parallel: Option<usize>,

        #[structopt(flatten)]
        scoring: ScoringArgs,

        /// Always ask the model for fresh variable options
        #[structopt(long)]
        no_cache: bool,
    },
    /// Generate personas for a pathway and save them
    Personas {
        pathway_id: String,

        /// Number of personas to generate
        #[structopt(default_value = "10")]
        count: usize,

        /// Output file (defaults to personas_<timestamp>.json)
        #[structopt(long)]
        output: Option<PathBuf>,

        /// Always ask the model for fresh variable options
        #[structopt(long)]
        no_cache: bool,
    },
    /// Re-score saved conversation results against their personas
    Evaluate {
        #[structopt(long, default_value = "pathway_results.json")]
        results: PathBuf,

        #[structopt(long, default_value = "test_personas.json")]
        personas: PathBuf,

        #[structopt(flatten)]
        scoring: ScoringArgs,
    },
}

#[derive(StructOpt, Debug)]
struct ScoringArgs {
    /// Minimum match percentage for a conversation to pass
    #[structopt(long)]
    threshold: Option<f64>,

    /// Only pass conversations the persona ended with GOODBYE
    #[structopt(long)]
    require_goodbye: bool,
}

impl ScoringArgs {
    fn apply(&self, mut policy: EvaluationPolicy) -> EvaluationPolicy {
        if let Some(threshold) = self.threshold {
            policy.pass_threshold = threshold;
        }
        policy.require_goodbye |= self.require_goodbye;
        policy
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pathway_harness=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let environment = envy::from_env::<Environment>()?;
    let args = Args::from_args();
    let mut settings = Settings::load(args.config.as_deref()).await?;

    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .context("Failed to create output directory")?;

    match args.command {
        Command::Run {
            pathway_id,
            persona_count,
            max_turns,
            parallel,
            scoring,
            no_cache,
        } => {
            if let Some(max_turns) = max_turns {
                settings.conversation.max_turns = max_turns;
            }
            if let Some(parallel) = parallel {
                settings.run.parallel = parallel;
            }
            settings.evaluation = scoring.apply(settings.evaluation);
            let count = persona_count.unwrap_or(settings.run.persona_count);

            run(&environment, &settings, &args.output_dir, &pathway_id, count, !no_cache).await
        }
        Command::Personas {
            pathway_id,
            count,
            output,
            no_cache,
        } => {
            let output = output.unwrap_or_else(|| {
                args.output_dir.join(format!(
                    "personas_{}.json",
                    chrono::Local::now().format("%Y%m%d_%H%M%S")
                ))
            });

            generate_and_save(&environment, &settings, &pathway_id, count, &output, !no_cache)
                .await
        }
        Command::Evaluate {
            results,
            personas,
            scoring,
        } => {
            settings.evaluation = scoring.apply(settings.evaluation);
            evaluate_saved(&environment, &settings, &args.output_dir, &results, &personas).await
        }
    }
}

async fn generate_personas(
    model: &ChatClient,
    pathway: &Pathway,
    count: usize,
    settings: GeneratorSettings,
    use_cache: bool,
) -> anyhow::Result<Vec<Persona>> {
    let cache = if use_cache {
        OptionsCache::new()
            .await
            .inspect_err(|error| tracing::warn!("Variable options cache unavailable: {error:#}"))
            .ok()
    } else {
        None
    };

    let mut generator = PersonaGenerator::new(model, settings);
    if let Some(cache) = &cache {
        generator = generator.with_cache(cache);
    }

    println!("Generating personas…");
    let blueprint = generator
        .prepare(pathway)
        .await
        .context("Failed to prepare persona generation")?;
    println!(
        "   Call direction: {} ({})",
        blueprint.call_context().direction,
        blueprint.call_context().entity_type
    );
    let report = blueprint.generate(count, &mut rand::thread_rng());

    for failure in &report.failures {
        println!("   Persona generation failed: {failure}");
    }
    println!("   Generated {} personas", report.personas.len());

    Ok(report.personas)
}

async fn run(
    environment: &Environment,
    settings: &Settings,
    output_dir: &Path,
    pathway_id: &str,
    count: usize,
    use_cache: bool,
) -> anyhow::Result<()> {
    let platform = environment.platform_client(settings)?;
    let model = environment.chat_client(settings)?;

    report::print_banner("Pathway Regression Test");
    println!("Pathway ID: {pathway_id}");
    println!("Personas: {count}");

    let pathway = platform
        .fetch_pathway(pathway_id)
        .await
        .context("Failed to fetch pathway")?;
    println!("Pathway: {}", pathway.display_name());

    let personas =
        generate_personas(&model, &pathway, count, settings.generation, use_cache).await?;
    report::write_json(
        &output_dir.join(report::PERSONAS_FILE),
        &PersonaFile::new(pathway_id, &pathway, personas.clone()),
    )
    .await?;

    let driver = ConversationDriver::new(&platform, &model, settings.conversation);
    println!("Running conversations…");
    let results: Vec<ConversationResult> = futures_util::stream::iter(&personas)
        .map(|persona| driver.run(persona, pathway_id))
        .buffered(settings.run.parallel.max(1))
        .collect()
        .await;

    let batch =
        evaluation::evaluate_batch(&results, &personas, |_| Some(&pathway), &settings.evaluation);

    for (index, (persona, result)) in personas.iter().zip(&results).enumerate() {
        report::print_banner(&format!("Persona {}/{}", index + 1, personas.len()));
        report::print_persona(persona);
        println!();
        report::print_transcript(result);

        if let Some(failure) = &result.failure {
            println!("\nError: {failure}");
        }
        if let Some(evaluation) = batch
            .evaluations
            .iter()
            .find(|evaluation| evaluation.persona_id == persona.persona_id)
        {
            report::print_outcome(evaluation);
        }
    }

    save_outputs(output_dir, Some(results.as_slice()), &batch.evaluations).await?;

    let summary = BatchSummary::new(&batch.evaluations, batch.failed_runs);
    report::print_summary(&summary, &batch.evaluations);

    Ok(())
}

async fn generate_and_save(
    environment: &Environment,
    settings: &Settings,
    pathway_id: &str,
    count: usize,
    output: &Path,
    use_cache: bool,
) -> anyhow::Result<()> {
    let platform = environment.platform_client(settings)?;
    let model = environment.chat_client(settings)?;

    let pathway = platform
        .fetch_pathway(pathway_id)
        .await
        .context("Failed to fetch pathway")?;
    println!("Pathway: {}", pathway.display_name());

    let personas =
        generate_personas(&model, &pathway, count, settings.generation, use_cache).await?;
    report::write_json(output, &PersonaFile::new(pathway_id, &pathway, personas)).await?;
    println!("Saved personas to {}", output.display());

    Ok(())
}

async fn evaluate_saved(
    environment: &Environment,
    settings: &Settings,
    output_dir: &Path,
    results_path: &Path,
    personas_path: &Path,
) -> anyhow::Result<()> {
    let results: Vec<ConversationResult> = report::read_json(results_path).await?;
    let persona_file: PersonaFile = report::read_json(personas_path).await?;

    // Scoring per visited path needs the pathway definition; without
    // credentials every goal variable is expected.
    let platform = environment.platform_client(settings).ok();
    let mut pathways: HashMap<String, Pathway> = HashMap::new();
    if let Some(platform) = &platform {
        let pathway_ids: HashSet<&str> = results
            .iter()
            .filter(|result| result.state != ConversationState::Failed)
            .map(|result| result.pathway_id.as_str())
            .collect();
        for pathway_id in pathway_ids {
            match platform.fetch_pathway(pathway_id).await {
                Ok(pathway) => {
                    pathways.insert(pathway_id.to_owned(), pathway);
                }
                Err(error) => tracing::warn!("Could not fetch pathway {pathway_id}: {error}"),
            }
        }
    }

    let batch = evaluation::evaluate_batch(
        &results,
        &persona_file.personas,
        |pathway_id| pathways.get(pathway_id),
        &settings.evaluation,
    );

    for persona_id in &batch.orphaned {
        println!("No persona found for result {persona_id}, skipping");
    }
    for evaluation in &batch.evaluations {
        println!("\nPersona: {}", evaluation.persona_id);
        report::print_outcome(evaluation);
    }

    save_outputs(output_dir, None, &batch.evaluations).await?;
    report::print_summary(
        &BatchSummary::new(&batch.evaluations, batch.failed_runs),
        &batch.evaluations,
    );

    Ok(())
}

async fn save_outputs(
    output_dir: &Path,
    results: Option<&[ConversationResult]>,
    evaluations: &[Evaluation],
) -> anyhow::Result<()> {
    println!("\nSaving results…");
    if let Some(results) = results {
        let path = output_dir.join(report::RESULTS_FILE);
        report::write_json(&path, results).await?;
        println!("   {}", path.display());
    }

    let path = output_dir.join(report::EVALUATIONS_FILE);
    report::write_json(&path, evaluations).await?;
    println!("   {}", path.display());

    Ok(())
}
