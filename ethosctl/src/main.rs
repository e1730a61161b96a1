// Ethos Control CLI
// Drives a local decision engine: status, value weights, training,
// alignment labels, single decisions and the background trainers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "ethosctl")]
#[command(about = "Ethos decision engine control", version)]
struct Cli {
    /// Engine configuration (TOML); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status as JSON
    Status,

    /// Inspect or change value weights
    Weights {
        #[command(subcommand)]
        action: WeightsAction,
    },

    /// Re-ingest the event log, then run training steps
    Train {
        /// Number of batches
        #[arg(short = 'n', long, default_value = "1")]
        steps: usize,
    },

    /// Alignment classifier management
    Alignment {
        #[command(subcommand)]
        action: AlignmentAction,
    },

    /// Run one decision cycle
    Act {
        /// State vector, comma separated
        #[arg(short, long, required = true, value_delimiter = ',', allow_hyphen_values = true)]
        state: Vec<f32>,

        /// JSON file with an array of candidate actions
        #[arg(long)]
        candidates: PathBuf,

        /// Next state, comma separated; completes the stored transition
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        next_state: Option<Vec<f32>>,

        /// Mark the transition terminal
        #[arg(long)]
        done: bool,

        /// User feedback in [-1, 1]
        #[arg(long, allow_hyphen_values = true)]
        feedback: Option<f64>,

        /// Approve every prompt raised during the cycle
        #[arg(long)]
        auto_approve: bool,

        /// Choose without executing
        #[arg(long)]
        decide_only: bool,
    },

    /// Re-ingest the event log and run the configured trainers until interrupted
    Run,
}

#[derive(Subcommand)]
enum WeightsAction {
    /// Print the normalized weights
    Show,
    /// Set one virtue's raw weight and renormalize
    Set {
        /// Virtue name, e.g. morality
        virtue: String,
        /// Raw weight
        value: f64,
    },
}

#[derive(Subcommand)]
enum AlignmentAction {
    /// Dataset and classifier summary
    Status,
    /// Train the classifier on the stored dataset
    Train {
        /// Epochs; configured default when omitted
        #[arg(long)]
        epochs: Option<usize>,
        /// Mini-batch size; configured default when omitted
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Label an action as aligned or misaligned
    Label {
        /// JSON file with one action definition
        action: PathBuf,
        /// Record a misaligned label instead of an aligned one
        #[arg(long)]
        misaligned: bool,
        /// Free-form note stored with the sample
        #[arg(long)]
        note: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = ethos_core::EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let engine = commands::open_engine(config).await?;

    match cli.command {
        Commands::Status => commands::status(&engine.engine).await,
        Commands::Weights { action } => match action {
            WeightsAction::Show => commands::print_json(&engine.engine.weights()),
            WeightsAction::Set { virtue, value } => commands::set_weight(&engine.engine, &virtue, value).await,
        },
        Commands::Train { steps } => commands::train(&engine.engine, steps).await,
        Commands::Alignment { action } => match action {
            AlignmentAction::Status => commands::print_json(&engine.engine.alignment().status().await),
            AlignmentAction::Train { epochs, batch_size } => {
                commands::train_alignment(&engine.engine, epochs, batch_size).await
            }
            AlignmentAction::Label {
                action,
                misaligned,
                note,
            } => commands::label(&engine.engine, &action, !misaligned, note).await,
        },
        Commands::Act {
            state,
            candidates,
            next_state,
            done,
            feedback,
            auto_approve,
            decide_only,
        } => {
            let options = commands::ActOptions {
                next_state,
                done,
                feedback,
                auto_approve,
                decide_only,
            };
            commands::act(&engine, state, &candidates, options).await
        }
        Commands::Run => commands::run(&engine.engine).await,
    }
}
