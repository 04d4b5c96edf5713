//! Command surface for the evaluator feedback calibration engine.
//!
//! Embedders can reuse the parsed command graph through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteCalibrationStore`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use ulid::Ulid;

use eval_calibration_core::{
    CalibrationState, EvaluationId, EvaluatorId, FeedbackInput, FeedbackTarget, FeedbackType,
    ParameterId, ScoringParameter, VoiceMetric,
};
use eval_calibration_store_sqlite::{CalibrationHistoryView, SqliteCalibrationStore};

pub const STATE_REPORT_CONTRACT: &str = "calibration_state.v1";
pub const HISTORY_REPORT_CONTRACT: &str = "calibration_history.v1";

#[derive(Debug, Parser)]
#[command(name = "evalcal")]
#[command(about = "Evaluator feedback calibration CLI")]
pub struct Cli {
    #[arg(long, default_value = "./eval_calibration.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Score {
        #[command(subcommand)]
        command: Box<ScoreCommand>,
    },
    Voice {
        #[command(subcommand)]
        command: Box<VoiceCommand>,
    },
    Evaluator {
        #[command(subcommand)]
        command: Box<EvaluatorCommand>,
    },
    Feedback {
        #[command(subcommand)]
        command: Box<FeedbackCommand>,
    },
    Calibrate {
        #[command(subcommand)]
        command: Box<CalibrateCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ScoreCommand {
    Set(ScoreSetArgs),
    Show(ScoreShowArgs),
}

#[derive(Debug, Args)]
pub struct ScoreSetArgs {
    #[arg(long)]
    evaluation: String,
    #[arg(long)]
    parameter: String,
    #[arg(long)]
    value: u8,
    #[arg(long, default_value = "")]
    note: String,
}

#[derive(Debug, Args)]
pub struct ScoreShowArgs {
    #[arg(long)]
    evaluation: String,
    #[arg(long)]
    parameter: String,
}

#[derive(Debug, Subcommand)]
pub enum VoiceCommand {
    Set(VoiceSetArgs),
    Show(VoiceShowArgs),
}

#[derive(Debug, Args)]
pub struct VoiceSetArgs {
    #[arg(long)]
    evaluation: String,
    #[arg(long)]
    metric: VoiceMetricArg,
    #[arg(long)]
    value: f64,
}

#[derive(Debug, Args)]
pub struct VoiceShowArgs {
    #[arg(long)]
    evaluation: String,
}

#[derive(Debug, Subcommand)]
pub enum EvaluatorCommand {
    Add(EvaluatorAddArgs),
}

#[derive(Debug, Args)]
pub struct EvaluatorAddArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
pub enum FeedbackCommand {
    Submit(FeedbackSubmitArgs),
    Delete(FeedbackDeleteArgs),
    List(FeedbackListArgs),
}

#[derive(Debug, Args)]
pub struct FeedbackSubmitArgs {
    #[arg(long)]
    evaluation: String,
    #[arg(long)]
    evaluator: String,
    #[arg(long = "type")]
    feedback_type: FeedbackTypeArg,
    #[arg(long)]
    score_id: Option<String>,
    #[arg(long)]
    parameter: Option<String>,
    #[arg(long)]
    metric: Option<VoiceMetricArg>,
    #[arg(long)]
    original: Option<f64>,
    #[arg(long)]
    adjusted: Option<f64>,
    #[arg(long)]
    comment: String,
}

#[derive(Debug, Args)]
pub struct FeedbackDeleteArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    requester: String,
    #[arg(long)]
    admin: bool,
}

#[derive(Debug, Args)]
pub struct FeedbackListArgs {
    #[arg(long)]
    evaluation: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum CalibrateCommand {
    Run(CalibrateRunArgs),
    State(CalibrateStateArgs),
    History(CalibrateHistoryArgs),
}

#[derive(Debug, Args)]
pub struct CalibrateRunArgs {
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long)]
    period_days: Option<u32>,
}

#[derive(Debug, Args)]
pub struct CalibrateStateArgs {
    #[arg(long)]
    catalog: PathBuf,
}

#[derive(Debug, Args)]
pub struct CalibrateHistoryArgs {
    #[arg(long)]
    parameter: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FeedbackTypeArg {
    Score,
    VoiceQuality,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VoiceMetricArg {
    Clarity,
    Volume,
    Pace,
    Tone,
    Overall,
}

fn map_metric(metric: VoiceMetricArg) -> VoiceMetric {
    match metric {
        VoiceMetricArg::Clarity => VoiceMetric::Clarity,
        VoiceMetricArg::Volume => VoiceMetric::Volume,
        VoiceMetricArg::Pace => VoiceMetric::Pace,
        VoiceMetricArg::Tone => VoiceMetric::Tone,
        VoiceMetricArg::Overall => VoiceMetric::Overall,
    }
}

#[derive(Debug, Serialize)]
struct StateReport {
    contract_version: &'static str,
    states: Vec<CalibrationState>,
}

#[derive(Debug, Serialize)]
struct HistoryReport {
    contract_version: &'static str,
    entries: Vec<CalibrationHistoryView>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteCalibrationStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, authorization, or persistence fails.
pub fn run_command(command: Command, store: &mut SqliteCalibrationStore) -> Result<()> {
    match command {
        Command::Score { command } => run_score(*command, store),
        Command::Voice { command } => run_voice(*command, store),
        Command::Evaluator { command } => run_evaluator(*command, store),
        Command::Feedback { command } => run_feedback(*command, store),
        Command::Calibrate { command } => run_calibrate(*command, store),
    }
}

fn run_score(command: ScoreCommand, store: &mut SqliteCalibrationStore) -> Result<()> {
    match command {
        ScoreCommand::Set(args) => {
            let score = store.upsert_score(
                &EvaluationId::new(args.evaluation),
                &ParameterId::new(args.parameter),
                args.value,
                &args.note,
            )?;
            println!("{}", serde_json::to_string_pretty(&score)?);
            Ok(())
        }
        ScoreCommand::Show(args) => {
            let evaluation_id = EvaluationId::new(args.evaluation);
            let parameter_id = ParameterId::new(args.parameter);
            let score = store
                .get_score(&evaluation_id, &parameter_id)?
                .ok_or_else(|| {
                    anyhow!("no score found for evaluation {evaluation_id} and parameter {parameter_id}")
                })?;
            println!("{}", serde_json::to_string_pretty(&score)?);
            Ok(())
        }
    }
}

fn run_voice(command: VoiceCommand, store: &mut SqliteCalibrationStore) -> Result<()> {
    match command {
        VoiceCommand::Set(args) => {
            let snapshot = store.set_voice_metric(
                &EvaluationId::new(args.evaluation),
                map_metric(args.metric),
                args.value,
            )?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        VoiceCommand::Show(args) => {
            let evaluation_id = EvaluationId::new(args.evaluation);
            let snapshot = store
                .get_voice_snapshot(&evaluation_id)?
                .ok_or_else(|| anyhow!("no voice snapshot found for evaluation {evaluation_id}"))?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
    }
}

fn run_evaluator(command: EvaluatorCommand, store: &mut SqliteCalibrationStore) -> Result<()> {
    match command {
        EvaluatorCommand::Add(args) => {
            let evaluator_id = EvaluatorId::new(args.id);
            store.upsert_evaluator(&evaluator_id, &args.name)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "evaluator_id": evaluator_id,
                    "display_name": args.name,
                }))?
            );
            Ok(())
        }
    }
}

fn run_feedback(command: FeedbackCommand, store: &mut SqliteCalibrationStore) -> Result<()> {
    match command {
        FeedbackCommand::Submit(args) => {
            let feedback_type = match args.feedback_type {
                FeedbackTypeArg::Score => FeedbackType::Score,
                FeedbackTypeArg::VoiceQuality => FeedbackType::VoiceQuality,
            };
            let target = match feedback_type {
                FeedbackType::Score => match (&args.score_id, &args.parameter) {
                    (Some(raw), _) => FeedbackTarget::ScoreById(parse_ulid("score id", raw)?),
                    (None, Some(parameter)) => {
                        FeedbackTarget::ScoreByParameter(ParameterId::new(parameter.clone()))
                    }
                    (None, None) => {
                        return Err(anyhow!(
                            "score feedback requires --score-id or --parameter"
                        ))
                    }
                },
                FeedbackType::VoiceQuality => {
                    let metric = args
                        .metric
                        .ok_or_else(|| anyhow!("voice-quality feedback requires --metric"))?;
                    FeedbackTarget::VoiceMetric(map_metric(metric))
                }
            };

            let input = FeedbackInput {
                evaluation_id: EvaluationId::new(args.evaluation),
                evaluator_id: EvaluatorId::new(args.evaluator),
                feedback_type,
                target,
                original_score: args.original,
                adjusted_score: args.adjusted,
                comment: args.comment,
            };
            let record = store.submit_feedback(&input)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        FeedbackCommand::Delete(args) => {
            let feedback_id = parse_ulid("feedback id", &args.id)?;
            let deletion = store.delete_feedback(
                feedback_id,
                &EvaluatorId::new(args.requester),
                args.admin,
            )?;
            println!("{}", serde_json::to_string_pretty(&deletion)?);
            Ok(())
        }
        FeedbackCommand::List(args) => {
            let evaluation_id = args.evaluation.map(EvaluationId::new);
            let records = store.list_feedback(evaluation_id.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

fn run_calibrate(command: CalibrateCommand, store: &mut SqliteCalibrationStore) -> Result<()> {
    match command {
        CalibrateCommand::Run(args) => {
            let catalog = load_catalog(&args.catalog)?;
            let report = store.analyze(&catalog, args.period_days)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        CalibrateCommand::State(args) => {
            let catalog = load_catalog(&args.catalog)?;
            let states = store.get_calibration_state(&catalog)?;
            let report = StateReport {
                contract_version: STATE_REPORT_CONTRACT,
                states,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        CalibrateCommand::History(args) => {
            let parameter_id = args.parameter.map(ParameterId::new);
            let entries = store.get_calibration_history(parameter_id.as_ref(), args.limit)?;
            let report = HistoryReport {
                contract_version: HISTORY_REPORT_CONTRACT,
                entries,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn parse_ulid(label: &str, raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).map_err(|err| anyhow!("invalid {label} {raw}: {err}"))
}

fn load_catalog(path: &Path) -> Result<Vec<ScoringParameter>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read parameter catalog {}", path.display()))?;
    let catalog: Vec<ScoringParameter> = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse parameter catalog {}", path.display()))?;
    if catalog.is_empty() {
        return Err(anyhow!(
            "parameter catalog {} is empty",
            path.display()
        ));
    }
    Ok(catalog)
}
