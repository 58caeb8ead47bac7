use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use demo_archive_core::{DemonstrationRecord, FieldValue, PlaybackCursor, StepValue, Timestamp};
use demo_archive_store_sqlite::{Archive, ArchiveConfig};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "demo-archive")]
#[command(about = "Demonstration archive CLI")]
struct Cli {
    /// Archive root directory; overrides the config file.
    #[arg(long, env = "DEMO_ARCHIVE_ROOT")]
    root: Option<PathBuf>,

    /// YAML file with archive settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    List(ListArgs),
    Show(EntryArgs),
    Replay(ReplayArgs),
    Import(ImportArgs),
    Export(ExportArgs),
    Delete(EntryArgs),
    Envs,
    Tasks(TasksArgs),
    IntegrityCheck(TaskArgs),
}

#[derive(Debug, Args)]
struct TaskArgs {
    #[arg(long = "env")]
    environment: String,
    #[arg(long)]
    task: String,
}

#[derive(Debug, Args)]
struct EntryArgs {
    #[command(flatten)]
    task: TaskArgs,
    #[arg(long)]
    timestamp: Timestamp,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[command(flatten)]
    task: TaskArgs,
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long, default_value_t = 10)]
    page_size: usize,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    #[command(flatten)]
    entry: EntryArgs,
    /// Only include these fields (repeatable).
    #[arg(long = "field")]
    fields: Vec<String>,
    #[arg(long, default_value_t = 0)]
    from: usize,
    /// Last step to include; defaults to the final step.
    #[arg(long)]
    to: Option<usize>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[command(flatten)]
    task: TaskArgs,
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    timestamp: Option<Timestamp>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(flatten)]
    entry: EntryArgs,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct TasksArgs {
    #[arg(long = "env")]
    environment: String,
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

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_config(cli: &Cli) -> Result<ArchiveConfig> {
    let mut config = match &cli.config {
        Some(path) => ArchiveConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ArchiveConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root.clone_from(root);
    }
    debug!(root = %config.root.display(), "resolved archive config");
    Ok(config)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let archive = Archive::open(resolve_config(&cli)?).context("failed to open archive")?;

    match cli.command {
        Command::List(args) => run_list(&args, &archive),
        Command::Show(args) => run_show(&args, &archive),
        Command::Replay(args) => run_replay(&args, &archive),
        Command::Import(args) => run_import(&args, &archive),
        Command::Export(args) => run_export(&args, &archive),
        Command::Delete(args) => run_delete(&args, &archive),
        Command::Envs => run_envs(&archive),
        Command::Tasks(args) => run_tasks(&args, &archive),
        Command::IntegrityCheck(args) => run_integrity_check(&args, &archive),
    }
}

fn run_list(args: &ListArgs, archive: &Archive) -> Result<()> {
    let page = archive.list(&args.task.environment, &args.task.task, args.page, args.page_size)?;
    let entries = page.items.iter().map(ToString::to_string).collect::<Vec<_>>();
    emit_json(serde_json::json!({
        "environment": args.task.environment,
        "task": args.task.task,
        "page": page.page,
        "page_size": page.page_size,
        "total_count": page.total_count,
        "total_pages": page.total_pages,
        "timestamps": page.items.iter().map(|entry| entry.timestamp.as_str()).collect::<Vec<_>>(),
        "entries": entries,
    }))
}

fn run_show(args: &EntryArgs, archive: &Archive) -> Result<()> {
    let record = load_entry(args, archive)?;
    let fields = record
        .fields()
        .map(|(name, value)| (name.to_string(), describe_field(value)))
        .collect::<BTreeMap<_, _>>();
    emit_json(serde_json::json!({
        "environment": args.task.environment,
        "task": args.task.task,
        "timestamp": args.timestamp,
        "steps": record.step_count(),
        "instruction": record.instruction(),
        "fields": fields,
    }))
}

fn run_replay(args: &ReplayArgs, archive: &Archive) -> Result<()> {
    let record = load_entry(&args.entry, archive)?;
    for field in &args.fields {
        if record.get(field).is_none() {
            return Err(anyhow!("record has no field `{field}`"));
        }
    }

    let last = args.to.unwrap_or(usize::MAX);
    let mut cursor = PlaybackCursor::new(record.step_count());
    let mut frames = Vec::new();
    while let Some(index) = cursor.advance() {
        if index < args.from {
            continue;
        }
        if index > last {
            break;
        }
        let Some(view) = record.step(index) else {
            break;
        };
        let values = view
            .into_iter()
            .filter(|(name, _)| {
                args.fields.is_empty() || args.fields.iter().any(|field| field.as_str() == *name)
            })
            .collect::<BTreeMap<&str, StepValue<'_>>>();
        frames.push(serde_json::json!({ "step": index, "values": values }));
    }

    emit_json(serde_json::json!({
        "environment": args.entry.task.environment,
        "task": args.entry.task.task,
        "timestamp": args.entry.timestamp,
        "steps": record.step_count(),
        "frames": frames,
    }))
}

fn run_import(args: &ImportArgs, archive: &Archive) -> Result<()> {
    let body = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read record file {}", args.file.display()))?;
    let record: DemonstrationRecord = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse record file {}", args.file.display()))?;

    let entry = match &args.timestamp {
        Some(timestamp) => {
            archive.save_at(&args.task.environment, &args.task.task, &record, timestamp.clone())?
        }
        None => archive.save(&args.task.environment, &args.task.task, &record)?,
    };
    let stored = archive.load(&entry.environment, &entry.task, &entry.timestamp)?;

    emit_json(serde_json::json!({
        "entry": entry.to_string(),
        "timestamp": entry.timestamp,
        "steps": stored.step_count(),
    }))
}

fn run_export(args: &ExportArgs, archive: &Archive) -> Result<()> {
    let record = load_entry(&args.entry, archive)?;
    write_record(&args.out, &record)?;
    emit_json(serde_json::json!({
        "status": "exported",
        "out": args.out.display().to_string(),
        "steps": record.step_count(),
    }))
}

fn run_delete(args: &EntryArgs, archive: &Archive) -> Result<()> {
    archive.delete(&args.task.environment, &args.task.task, &args.timestamp)?;
    emit_json(serde_json::json!({
        "status": "deleted",
        "environment": args.task.environment,
        "task": args.task.task,
        "timestamp": args.timestamp,
    }))
}

fn run_envs(archive: &Archive) -> Result<()> {
    emit_json(serde_json::json!({ "environments": archive.environments()? }))
}

fn run_tasks(args: &TasksArgs, archive: &Archive) -> Result<()> {
    let tasks = archive
        .tasks(&args.environment)?
        .into_iter()
        .map(|task| {
            let count = archive.count(&args.environment, &task)?;
            Ok(serde_json::json!({ "task": task, "demonstrations": count }))
        })
        .collect::<Result<Vec<_>>>()?;
    emit_json(serde_json::json!({ "environment": args.environment, "tasks": tasks }))
}

fn run_integrity_check(args: &TaskArgs, archive: &Archive) -> Result<()> {
    let report = archive.integrity_check(&args.environment, &args.task)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn load_entry(args: &EntryArgs, archive: &Archive) -> Result<DemonstrationRecord> {
    Ok(archive.load(&args.task.environment, &args.task.task, &args.timestamp)?)
}

fn describe_field(value: &FieldValue) -> Value {
    let mut summary = serde_json::json!({ "kind": value.kind().as_str() });
    match value {
        FieldValue::ScalarText(_) => {}
        FieldValue::NumericSequence(values) => {
            summary["length"] = values.len().into();
            if let Some(first) = values.first() {
                summary["dtype"] = first.dtype().as_str().into();
            }
        }
        FieldValue::ArraySequence(values) => {
            summary["length"] = values.len().into();
            if let Some(first) = values.first() {
                summary["dtype"] = first.dtype().as_str().into();
                summary["shape"] = first.shape.clone().into();
            }
        }
        FieldValue::DictSequence(values) => {
            summary["length"] = values.len().into();
            if let Some(first) = values.first() {
                let sub_fields = first
                    .iter()
                    .map(|(name, tensor)| {
                        (
                            name.clone(),
                            serde_json::json!({
                                "dtype": tensor.dtype().as_str(),
                                "shape": tensor.shape,
                            }),
                        )
                    })
                    .collect::<serde_json::Map<_, _>>();
                summary["sub_fields"] = Value::Object(sub_fields);
            }
        }
    }
    summary
}

fn write_record(path: &Path, record: &DemonstrationRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(record).context("failed to serialize record")?;
    fs::write(path, body).with_context(|| format!("failed to write record file {}", path.display()))
}
