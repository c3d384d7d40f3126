use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intentflow_classifier::{
    ConfidenceRouter, ModelKind, RouterCache, TrainingConfig, UtteranceCorpus, WorkflowTrainer,
};
use intentflow_routing::{ModuleType, Prediction, RoutingDefinition, RoutingOptions, Telemetry};
use serde::Serialize;
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "intentflow", version, about = "Workflow command routing and intent classification")]
struct Cli {
    /// JSON-lines log file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// JSON-lines event file.
    #[arg(long, global = true)]
    event_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scans a workflow and writes its routing sidecars.
    Build {
        #[arg(long)]
        workflow: PathBuf,
    },
    /// Lists the commands callable in a context.
    Commands {
        #[arg(long)]
        workflow: PathBuf,
        #[arg(long)]
        context: String,
        /// Print qualified names, wildcard included.
        #[arg(long)]
        qualified: bool,
    },
    /// Resolves the implementation class of a command.
    Class {
        #[arg(long)]
        workflow: PathBuf,
        #[arg(long)]
        command: String,
        /// parameter_input, parameters or response_generation.
        #[arg(long, default_value = "response_generation")]
        module_type: ModuleType,
    },
    /// Trains the classifier of one context or of every context.
    Train {
        #[arg(long)]
        workflow: PathBuf,
        #[arg(long)]
        context: Option<String>,
        /// Training configuration JSON.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Utterance corpus; defaults to ___command_info/utterances.json.
        #[arg(long)]
        corpus: Option<PathBuf>,
    },
    /// Classifies an utterance within a context.
    Predict {
        #[arg(long)]
        workflow: PathBuf,
        #[arg(long)]
        context: String,
        utterance: String,
    },
}

#[derive(Debug, Serialize)]
struct PredictionView<'a> {
    context: &'a str,
    utterance: &'a str,
    prediction: Prediction,
    model: ModelKind,
    confidence: f32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = build_telemetry(cli.log_file.as_deref(), cli.event_log.as_deref())?;
    let options = RoutingOptions {
        telemetry: telemetry.clone(),
        ..RoutingOptions::default()
    };
    match cli.command {
        Commands::Build { workflow } => {
            let definition = RoutingDefinition::build_with(&workflow, &options)
                .with_context(|| format!("building routing definition for {}", workflow.display()))?;
            let failures: Vec<_> = definition
                .directory()
                .load_failures()
                .iter()
                .map(|failure| json!({ "command": failure.command, "reason": failure.reason }))
                .collect();
            print_json(&json!({
                "workflow": definition.root(),
                "contexts": definition.contexts(),
                "skipped_commands": failures,
            }))
        }
        Commands::Commands {
            workflow,
            context,
            qualified,
        } => {
            let definition = load_definition(&workflow, &options)?;
            let names = if qualified {
                definition.get_qualified_command_names(&context)?.to_vec()
            } else {
                definition.get_command_names(&context)?
            };
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Class {
            workflow,
            command,
            module_type,
        } => {
            let definition = load_definition(&workflow, &options)?;
            match definition.get_command_class(&command, module_type) {
                Some(class) => print_json(&class),
                None => {
                    println!("{command} has no {module_type} class");
                    Ok(())
                }
            }
        }
        Commands::Train {
            workflow,
            context,
            config,
            corpus,
        } => {
            let definition = Arc::new(load_definition(&workflow, &options)?);
            let config = match config {
                Some(path) => TrainingConfig::load(&path)
                    .with_context(|| format!("reading training config {}", path.display()))?,
                None => TrainingConfig::default(),
            };
            let corpus_path =
                corpus.unwrap_or_else(|| UtteranceCorpus::default_path(definition.root()));
            let corpus = UtteranceCorpus::load(&corpus_path)
                .with_context(|| format!("reading corpus {}", corpus_path.display()))?;
            let mut trainer = WorkflowTrainer::new(Arc::clone(&definition), corpus, config);
            if let Some(telemetry) = &telemetry {
                trainer = trainer.with_telemetry(telemetry.scoped("intentflow.training"));
            }
            match context {
                Some(context) => {
                    let trained = trainer
                        .train_context(&context)
                        .with_context(|| format!("training context {context}"))?;
                    print_json(&trained)
                }
                None => {
                    let report = trainer.train_workflow()?;
                    for skipped in &report.skipped {
                        eprintln!("skipped {}: {}", skipped.context, skipped.reason);
                    }
                    print_json(&report)
                }
            }
        }
        Commands::Predict {
            workflow,
            context,
            utterance,
        } => {
            let definition = Arc::new(load_definition(&workflow, &options)?);
            let mut router = ConfidenceRouter::new(definition, Arc::new(RouterCache::default()));
            if let Some(telemetry) = &telemetry {
                router = router.with_telemetry(telemetry.scoped("intentflow.router"));
            }
            let outcome = router
                .classify(&context, &utterance)
                .with_context(|| format!("classifying in context {context}"))?;
            print_json(&PredictionView {
                context: &context,
                utterance: &utterance,
                prediction: outcome.prediction,
                model: outcome.model,
                confidence: outcome.confidence,
            })
        }
    }
}

fn build_telemetry(log_file: Option<&Path>, event_log: Option<&Path>) -> Result<Option<Telemetry>> {
    if log_file.is_none() && event_log.is_none() {
        return Ok(None);
    }
    let mut builder = Telemetry::builder("intentflow").min_level(LogLevel::Info);
    if let Some(path) = log_file {
        builder = builder.log_path(path);
    }
    if let Some(path) = event_log {
        let publisher = FileEventPublisher::new(path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        builder = builder.event_publisher(Arc::new(publisher));
    }
    builder.build().map(Some)
}

fn load_definition(workflow: &Path, options: &RoutingOptions) -> Result<RoutingDefinition> {
    RoutingDefinition::load_with(workflow, options)
        .with_context(|| format!("loading routing definition for {}", workflow.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
