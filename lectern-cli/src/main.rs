use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lectern_cache::{ByteRange, CacheKey, LocalFolderProvider};
use lectern_core::{now_ms, EntityKind, LectureBody, NoteBody};
use lectern_sync::{CycleOutcome, JobEvent, SchedulerConfig, SyncScheduler};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod app;
mod table;

use app::{App, Overrides};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Table format (default)
    Table,
    /// Pretty JSON
    Json,
}

#[derive(Parser)]
#[command(name = "lectern")]
#[command(about = "Lectern offline-first sync and media cache", long_about = None)]
struct Cli {
    /// Config file (JSON). Defaults to ./lectern.json when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Local database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Directory backing the remote store
    #[arg(long, global = true)]
    remote: Option<PathBuf>,

    /// Signed-in user id
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage lectures
    Lecture {
        #[command(subcommand)]
        command: LectureCommands,
    },
    /// Manage notes
    Note {
        #[command(subcommand)]
        command: NoteCommands,
    },
    /// Sync with the remote store
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Media cache operations
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum LectureCommands {
    /// Create a lecture
    Add {
        name: String,
        /// Cloud file id of the video
        #[arg(long)]
        video: Option<String>,
        /// Cloud file id of the slides
        #[arg(long)]
        pdf: Option<String>,
        /// Folder the lecture belongs to
        #[arg(long)]
        folder: Option<String>,
    },
    /// List lectures
    List,
    /// Delete a lecture
    Delete { id: String },
}

#[derive(Subcommand)]
enum NoteCommands {
    /// Add a note to a lecture
    Add {
        lecture_id: String,
        content: String,
        /// Video position in milliseconds
        #[arg(short, long, default_value = "0")]
        position: i64,
        /// PDF page the note refers to
        #[arg(long)]
        page: Option<u32>,
    },
    /// List notes of a lecture
    List { lecture_id: String },
    /// Replace the content of a note
    Edit { id: String, content: String },
    /// Delete a note
    Delete { id: String },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Run one sync cycle
    Run,
    /// Show the watermark and pending local changes
    Status,
    /// Run the background scheduler until interrupted
    Watch,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Read a byte range through the cache
    Fetch {
        /// Upstream URL or path, or a file id when --folder is given
        source: String,
        /// Resolve SOURCE as a file id in this local folder
        #[arg(long)]
        folder: Option<PathBuf>,
        /// First byte
        #[arg(long, default_value = "0")]
        start: u64,
        /// Number of bytes
        #[arg(long, default_value = "1048576")]
        len: u64,
        /// Write the bytes to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show cache usage
    Stats,
    /// Remove every cached span
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the default configuration to a file
    Init {
        #[arg(default_value = app::DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let overrides = Overrides {
        config: cli.config,
        database: cli.db,
        remote: cli.remote,
        user: cli.user,
    };
    let output = cli.output;

    match cli.command {
        Commands::Lecture { command } => handle_lecture_command(&overrides, output, command).await?,
        Commands::Note { command } => handle_note_command(&overrides, output, command).await?,
        Commands::Sync { command } => handle_sync_command(&overrides, output, command).await?,
        Commands::Cache { command } => handle_cache_command(&overrides, output, command).await?,
        Commands::Config { command } => handle_config_command(&overrides, command)?,
    }

    Ok(())
}

async fn open_app(overrides: &Overrides) -> Result<App> {
    let config = app::load_config(overrides)?;
    App::open(config).await
}

async fn handle_lecture_command(
    overrides: &Overrides,
    output: OutputFormat,
    command: LectureCommands,
) -> Result<()> {
    let app = open_app(overrides).await?;
    let lectures = app.lectures();

    match command {
        LectureCommands::Add {
            name,
            video,
            pdf,
            folder,
        } => {
            let lecture = lectures
                .create(LectureBody {
                    name,
                    video_file_id: video,
                    pdf_file_id: pdf,
                    folder_name: folder,
                    created_at: now_ms(),
                })
                .await
                .context("Failed to create lecture")?;
            println!("✓ Lecture created: {}", lecture.id);
        }

        LectureCommands::List => {
            let mut all = lectures.list().await.context("Failed to list lectures")?;
            all.sort_by(|a, b| a.body.name.cmp(&b.body.name));
            match output {
                OutputFormat::Table => println!("{}", table::format_lectures(&all)),
                OutputFormat::Json => {
                    let bodies: Vec<_> = all
                        .iter()
                        .map(|l| serde_json::json!({ "id": l.id, "hlc": l.hlc, "body": l.body, "local": l.local }))
                        .collect();
                    print_json(&bodies)?;
                }
            }
        }

        LectureCommands::Delete { id } => {
            if lectures.delete(&id).await.context("Failed to delete lecture")? {
                println!("✓ Lecture deleted");
            } else {
                println!("Lecture not found");
            }
        }
    }
    Ok(())
}

async fn handle_note_command(
    overrides: &Overrides,
    output: OutputFormat,
    command: NoteCommands,
) -> Result<()> {
    let app = open_app(overrides).await?;
    let notes = app.notes();

    match command {
        NoteCommands::Add {
            lecture_id,
            content,
            position,
            page,
        } => {
            if app.lectures().get(&lecture_id).await?.is_none() {
                anyhow::bail!("Lecture not found: {lecture_id}");
            }
            let note = notes
                .create(NoteBody {
                    lecture_id,
                    content,
                    video_position_ms: position,
                    pdf_page: page,
                    created_at: now_ms(),
                })
                .await
                .context("Failed to create note")?;
            println!("✓ Note created: {}", note.id);
        }

        NoteCommands::List { lecture_id } => {
            let listed = notes
                .list_for_lecture(&lecture_id)
                .await
                .context("Failed to list notes")?;
            match output {
                OutputFormat::Table => println!("{}", table::format_notes(&listed)),
                OutputFormat::Json => {
                    let bodies: Vec<_> = listed
                        .iter()
                        .map(|n| serde_json::json!({ "id": n.id, "hlc": n.hlc, "body": n.body }))
                        .collect();
                    print_json(&bodies)?;
                }
            }
        }

        NoteCommands::Edit { id, content } => {
            let mut note = notes
                .get(&id)
                .await?
                .with_context(|| format!("Note not found: {id}"))?;
            note.body.content = content;
            let updated = notes
                .update(&id, note.body)
                .await
                .context("Failed to update note")?;
            println!("✓ Note updated ({})", updated.hlc);
        }

        NoteCommands::Delete { id } => {
            if notes.delete(&id).await.context("Failed to delete note")? {
                println!("✓ Note deleted");
            } else {
                println!("Note not found");
            }
        }
    }
    Ok(())
}

async fn handle_sync_command(
    overrides: &Overrides,
    output: OutputFormat,
    command: SyncCommands,
) -> Result<()> {
    let app = open_app(overrides).await?;
    let engine = app.engine()?;

    match command {
        SyncCommands::Run => {
            let report = engine.run_cycle().await;
            match output {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Table => {
                    if !report.kinds.is_empty() {
                        println!("{}", table::format_cycle(&report));
                    }
                    match &report.outcome {
                        CycleOutcome::Completed => println!(
                            "✓ Sync completed in {} ms (watermark {})",
                            report.duration_ms,
                            table::format_time(report.watermark_after.unwrap_or_default())
                        ),
                        CycleOutcome::Skipped => println!("Sync skipped: not signed in (use --user)"),
                        CycleOutcome::NeedsUserConsent { intent } => {
                            println!("✗ Sync needs user consent: {intent}")
                        }
                        CycleOutcome::Retry(error) => println!("✗ Sync failed, will retry: {error}"),
                        CycleOutcome::Failed(error) => println!("✗ Sync failed: {error}"),
                    }
                }
            }
            if !report.outcome.is_success() {
                std::process::exit(1);
            }
        }

        SyncCommands::Status => {
            let watermark = engine.last_sync_time().await?;
            let mut pending = Vec::new();
            for kind in EntityKind::ALL {
                let rows = app.local.modified_since(kind, watermark).await?;
                pending.push((kind, rows.iter().filter(|r| r.is_pushable()).count()));
            }
            match output {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "last_sync_time": watermark,
                    "node_id": app.clock.node_id(),
                    "pending": pending
                        .iter()
                        .map(|(k, n)| (k.as_str(), *n))
                        .collect::<std::collections::BTreeMap<_, _>>(),
                }))?,
                OutputFormat::Table => {
                    println!("Node:       {}", app.clock.node_id());
                    println!("Last sync:  {}", table::format_time(watermark));
                    for (kind, count) in pending {
                        println!("Pending {:<12} {}", format!("{kind}:"), count);
                    }
                }
            }
        }

        SyncCommands::Watch => {
            let config = SchedulerConfig::from_settings(engine.settings());
            let mut scheduler = SyncScheduler::start(Arc::new(engine), config);
            let mut events = scheduler
                .take_events()
                .context("Scheduler events already taken")?;
            scheduler.trigger().sync_soon();
            println!("Watching for sync jobs; press Ctrl-C to stop");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => print_job_event(&event),
                        None => break,
                    },
                }
            }
            scheduler.shutdown().await;
        }
    }
    Ok(())
}

fn print_job_event(event: &JobEvent) {
    match event {
        JobEvent::Started { job, attempt } => println!("→ {job} sync started (attempt {attempt})"),
        JobEvent::Finished { job, report } => println!(
            "✓ {job} sync finished: pushed {}, pulled {}, applied {}",
            report.pushed(),
            report.pulled(),
            report.merged().applied()
        ),
        JobEvent::RetryScheduled { job, attempt, delay } => {
            println!("… {job} sync retry {attempt} in {} ms", delay.as_millis())
        }
        JobEvent::ConsentRequired { job, intent } => {
            println!("✗ {job} sync needs user consent: {intent}")
        }
        JobEvent::GaveUp {
            job,
            attempts,
            error,
        } => println!("✗ {job} sync gave up after {attempts} attempts: {error}"),
    }
}

async fn handle_cache_command(
    overrides: &Overrides,
    output: OutputFormat,
    command: CacheCommands,
) -> Result<()> {
    let config = app::load_config(overrides)?;
    let cache = app::open_cache(&config).await?;

    match command {
        CacheCommands::Fetch {
            source,
            folder,
            start,
            len,
            out,
        } => {
            let key = match folder {
                Some(root) => CacheKey::for_cloud_file(&LocalFolderProvider::new(root), &source)
                    .await
                    .with_context(|| format!("Failed to resolve {source}"))?,
                None => CacheKey::new(source.clone(), source),
            };
            let range = ByteRange::new(start, len);
            let cached = cache.contains(&key, range).await;
            let bytes = cache
                .read(&key, range)
                .await
                .with_context(|| format!("Failed to read {range} of {key}"))?;
            cache.flush().await?;

            if let Some(out) = out {
                tokio::fs::write(&out, &bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", out.display()))?;
            }
            println!(
                "{} {} bytes of {}",
                if cached { "✓ Served" } else { "✓ Fetched" },
                bytes.len(),
                key.media_id
            );
        }

        CacheCommands::Stats => {
            let stats = cache.stats().await;
            match output {
                OutputFormat::Table => println!("{}", table::format_cache_stats(&stats)),
                OutputFormat::Json => print_json(&stats)?,
            }
        }

        CacheCommands::Clear => {
            cache.clear().await.context("Failed to clear cache")?;
            println!("✓ Cache cleared");
        }
    }
    Ok(())
}

fn handle_config_command(overrides: &Overrides, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = app::load_config(overrides)?;
            print_json(&config)?;
        }

        ConfigCommands::Init { path } => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            let config = lectern_core::LecternConfig::default();
            std::fs::write(&path, serde_json::to_string_pretty(&config)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✓ Wrote {}", path.display());
        }
    }
    Ok(())
}
