use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use srs_kernel_api::{
    AddCardsRequest, CompleteWrongAnswerRequest, CreateFolderRequest, EnrollRequest,
    SrsKernelApi, SubmitAnswerRequest,
};
use srs_kernel_core::{CardId, Clock, FolderId, ItemKind, ItemRef, LearningCurve, UserId};
use srs_kernel_store_sqlite::SqliteStore;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "srsk")]
#[command(about = "SRS scheduling kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./srs_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Card {
        #[command(subcommand)]
        command: CardCommand,
    },
    Folder {
        #[command(subcommand)]
        command: FolderCommand,
    },
    Answer(AnswerArgs),
    Streak(UserArgs),
    Wrong {
        #[command(subcommand)]
        command: WrongCommand,
    },
    Time {
        #[command(subcommand)]
        command: TimeCommand,
    },
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
}

#[derive(Debug, Subcommand)]
enum CardCommand {
    Enroll(EnrollArgs),
    Unenroll(CardArgs),
    Status(UserArgs),
}

#[derive(Debug, Subcommand)]
enum FolderCommand {
    Create(FolderCreateArgs),
    Add(FolderAddArgs),
    Queue(FolderQueueArgs),
}

#[derive(Debug, Subcommand)]
enum WrongCommand {
    List(WrongListArgs),
    Complete(WrongCompleteArgs),
    Quiz(WrongQuizArgs),
}

#[derive(Debug, Subcommand)]
enum TimeCommand {
    Status,
    SetFactor { factor: u32 },
    SetOffset { days: i32 },
    Reset,
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    Sweep,
    Notify,
    Rollup,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ItemKindArg {
    Vocab,
    Idiom,
}

impl From<ItemKindArg> for ItemKind {
    fn from(value: ItemKindArg) -> Self {
        match value {
            ItemKindArg::Vocab => Self::Vocab,
            ItemKindArg::Idiom => Self::Idiom,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CurveArg {
    Short,
    ForgettingCurve,
}

impl From<CurveArg> for LearningCurve {
    fn from(value: CurveArg) -> Self {
        match value {
            CurveArg::Short => Self::Short,
            CurveArg::ForgettingCurve => Self::ForgettingCurve,
        }
    }
}

#[derive(Debug, Args)]
struct UserArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
}

#[derive(Debug, Args)]
struct EnrollArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
    #[arg(long = "item-id", required = true, num_args = 1..)]
    item_ids: Vec<i64>,
    #[arg(long, value_enum, default_value_t = ItemKindArg::Vocab)]
    kind: ItemKindArg,
}

#[derive(Debug, Args)]
struct CardArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
    #[arg(long, value_parser = parse_card_id)]
    card: CardId,
}

#[derive(Debug, Args)]
struct FolderCreateArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
    #[arg(long)]
    name: String,
    #[arg(long, value_parser = parse_folder_id)]
    parent: Option<FolderId>,
    #[arg(long, value_enum)]
    curve: Option<CurveArg>,
    #[arg(long, default_value_t = false)]
    no_alarm: bool,
}

#[derive(Debug, Args)]
struct FolderAddArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
    #[arg(long, value_parser = parse_folder_id)]
    folder: FolderId,
    #[arg(long = "card", required = true, num_args = 1.., value_parser = parse_card_id)]
    cards: Vec<CardId>,
}

#[derive(Debug, Args)]
struct FolderQueueArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
    #[arg(long, value_parser = parse_folder_id)]
    folder: FolderId,
}

#[derive(Debug, Args)]
struct AnswerArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
    #[arg(long, value_parser = parse_card_id)]
    card: CardId,
    #[arg(long, value_parser = parse_folder_id)]
    folder: Option<FolderId>,
    #[arg(long, default_value_t = false)]
    correct: bool,
}

#[derive(Debug, Args)]
struct WrongListArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
    #[arg(long, default_value_t = false)]
    include_completed: bool,
}

#[derive(Debug, Args)]
struct WrongCompleteArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
    #[arg(long = "item-id")]
    item_id: i64,
    #[arg(long, value_enum, default_value_t = ItemKindArg::Vocab)]
    kind: ItemKindArg,
}

#[derive(Debug, Args)]
struct WrongQuizArgs {
    #[arg(long, value_parser = parse_user_id)]
    user: UserId,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

fn parse_user_id(value: &str) -> Result<UserId, String> {
    Ulid::from_str(value).map(UserId).map_err(|err| format!("invalid user id: {err}"))
}

fn parse_card_id(value: &str) -> Result<CardId, String> {
    Ulid::from_str(value).map(CardId).map_err(|err| format!("invalid card id: {err}"))
}

fn parse_folder_id(value: &str) -> Result<FolderId, String> {
    Ulid::from_str(value).map(FolderId).map_err(|err| format!("invalid folder id: {err}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

/// Glossless placeholder catalog: quiz generation needs dictionary content,
/// which lives outside this kernel. The CLI only surfaces the open entries.
struct EmptyCatalog;

impl srs_kernel_core::ItemCatalog for EmptyCatalog {
    fn gloss(&self, _item: ItemRef) -> Option<String> {
        None
    }

    fn distractors(&self, _item: ItemRef, _count: usize, _exclude: &[ItemRef]) -> Vec<String> {
        Vec::new()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let api = SrsKernelApi::new(cli.db.clone(), Arc::new(Clock::system()));

    match cli.command {
        Command::Db { command } => run_db(command, &cli.db),
        Command::Card { command } => run_card(command, &api),
        Command::Folder { command } => run_folder(command, &api),
        Command::Answer(args) => {
            let outcome = api.submit_answer(SubmitAnswerRequest {
                user_id: args.user,
                folder_id: args.folder,
                card_id: args.card,
                correct: args.correct,
            })?;
            emit_json(serde_json::to_value(outcome)?)
        }
        Command::Streak(args) => {
            let info = api.get_streak_info(args.user)?;
            emit_json(serde_json::to_value(info)?)
        }
        Command::Wrong { command } => run_wrong(command, &api),
        Command::Time { command } => run_time(command, &api),
        Command::Jobs { command } => run_jobs(command, &api),
    }
}

fn run_db(command: DbCommand, db: &Path) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let store = SqliteStore::open(db)?;
            let status = store.schema_status()?;
            emit_json(serde_json::to_value(status)?)
        }
        DbCommand::Migrate => {
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            let status = store.schema_status()?;
            emit_json(serde_json::to_value(status)?)
        }
    }
}

fn run_card(command: CardCommand, api: &SrsKernelApi) -> Result<()> {
    match command {
        CardCommand::Enroll(args) => {
            let items = args
                .item_ids
                .iter()
                .map(|item_id| ItemRef { kind: args.kind.into(), item_id: *item_id })
                .collect();
            let cards = api.enroll(EnrollRequest { user_id: args.user, items })?;
            emit_json(serde_json::json!({ "cards": cards }))
        }
        CardCommand::Unenroll(args) => {
            api.unenroll(args.user, args.card)?;
            emit_json(serde_json::json!({ "removed": true }))
        }
        CardCommand::Status(args) => {
            let status = api.srs_status(args.user)?;
            emit_json(serde_json::to_value(status)?)
        }
    }
}

fn run_folder(command: FolderCommand, api: &SrsKernelApi) -> Result<()> {
    match command {
        FolderCommand::Create(args) => {
            let folder = api.create_folder(CreateFolderRequest {
                user_id: args.user,
                name: args.name,
                date: None,
                parent_id: args.parent,
                kind: None,
                alarm_on: Some(!args.no_alarm),
                learning_curve: args.curve.map(Into::into),
            })?;
            emit_json(serde_json::to_value(folder)?)
        }
        FolderCommand::Add(args) => {
            let result = api.add_cards_to_folder(AddCardsRequest {
                user_id: args.user,
                folder_id: args.folder,
                card_ids: args.cards,
            })?;
            emit_json(serde_json::to_value(result)?)
        }
        FolderCommand::Queue(args) => {
            let queue = api.get_queue(args.user, args.folder)?;
            emit_json(serde_json::json!({ "items": queue }))
        }
    }
}

fn run_wrong(command: WrongCommand, api: &SrsKernelApi) -> Result<()> {
    match command {
        WrongCommand::List(args) => {
            let entries = api.get_wrong_answers(args.user, args.include_completed)?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
        WrongCommand::Complete(args) => {
            let result = api.complete_wrong_answer(CompleteWrongAnswerRequest {
                user_id: args.user,
                item: ItemRef { kind: args.kind.into(), item_id: args.item_id },
            })?;
            emit_json(serde_json::to_value(result)?)
        }
        WrongCommand::Quiz(args) => {
            let quiz = api.generate_wrong_answer_quiz(args.user, args.limit, &EmptyCatalog)?;
            emit_json(serde_json::json!({ "items": quiz }))
        }
    }
}

fn run_time(command: TimeCommand, api: &SrsKernelApi) -> Result<()> {
    match command {
        TimeCommand::Status => emit_json(serde_json::to_value(api.time_status())?),
        TimeCommand::SetFactor { factor } => {
            let report = api.set_acceleration_factor(factor)?;
            emit_json(serde_json::to_value(report)?)
        }
        TimeCommand::SetOffset { days } => {
            let report = api.set_day_offset(days)?;
            emit_json(serde_json::to_value(report)?)
        }
        TimeCommand::Reset => {
            let report = api.reset_time()?;
            emit_json(serde_json::to_value(report)?)
        }
    }
}

fn run_jobs(command: JobsCommand, api: &SrsKernelApi) -> Result<()> {
    match command {
        JobsCommand::Sweep => {
            let counts = api.sweep_overdue()?;
            emit_json(serde_json::to_value(counts)?)
        }
        JobsCommand::Notify => {
            let report = api.six_hourly_notify()?;
            emit_json(serde_json::to_value(report)?)
        }
        JobsCommand::Rollup => {
            let report = api.midnight_rollup()?;
            emit_json(serde_json::to_value(report)?)
        }
    }
}
