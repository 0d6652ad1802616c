//! Level CLI
//!
//! Opens an ouroboros-level database, runs one command and closes it.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ouroboros_level::{
    Database, IteratorOptions, LevelError, OpenOptions, ReadOptions, WriteOptions,
};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "level")]
#[command(about = "Inspect and edit an ouroboros-level database")]
struct Args {
    /// Database directory
    location: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: Level,

    /// Create the database if it does not exist
    #[arg(long, global = true)]
    create_if_missing: bool,

    /// Open options as JSON, e.g. '{"compression": false}'
    #[arg(long, global = true)]
    options: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Store a value (synced)
    Put { key: String, value: String },

    /// Print the value of a key
    Get { key: String },

    /// Delete a key
    Del { key: String },

    /// Print entries in key order
    Scan {
        /// Inclusive lower bound
        #[arg(long)]
        gte: Option<String>,

        /// Exclusive upper bound
        #[arg(long)]
        lt: Option<String>,

        /// Iterate from the last key
        #[arg(long)]
        reverse: bool,

        /// Maximum entries, negative for all
        #[arg(long, default_value = "-1", allow_negative_numbers = true)]
        limit: i64,
    },

    /// Approximate bytes stored in [start, end)
    Size { start: String, end: String },

    /// Print a diagnostic property
    Property { name: String },
}

impl Args {
    fn open_options(&self) -> anyhow::Result<OpenOptions> {
        let options = match &self.options {
            Some(json) => OpenOptions::from_json(json)?,
            None => OpenOptions::default(),
        };
        Ok(options.with_create_if_missing(self.create_if_missing))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let options = args.open_options()?;
    let db = Database::new(&args.location)?;
    db.open(options)
        .await
        .with_context(|| format!("failed to open {}", args.location.display()))?;

    let mut out = Vec::new();
    let outcome = execute(&db, args.command, &mut out).await;
    db.close().await?;

    print!("{}", String::from_utf8_lossy(&out));
    outcome
}

async fn execute(db: &Database, command: Command, out: &mut Vec<u8>) -> anyhow::Result<()> {
    use std::io::Write;

    debug!("Running {:?}", command);
    match command {
        Command::Put { key, value } => {
            db.put(key, value, WriteOptions::sync()).await?;
        }
        Command::Get { key } => match db.get(key.clone(), ReadOptions::as_text()).await {
            Ok(value) => writeln!(out, "{}", value)?,
            Err(LevelError::NotFound) => bail!("{}: not found", key),
            Err(e) => return Err(e.into()),
        },
        Command::Del { key } => {
            db.del(key, WriteOptions::sync()).await?;
        }
        Command::Scan {
            gte,
            lt,
            reverse,
            limit,
        } => {
            let mut options = IteratorOptions::new().reverse(reverse).limit(limit).as_text();
            if let Some(gte) = gte {
                options = options.gte(gte);
            }
            if let Some(lt) = lt {
                options = options.lt(lt);
            }

            let mut iter = db.iterator(options)?;
            while let Some((key, value)) = iter.next().await? {
                writeln!(out, "{}\t{}", key, value)?;
            }
            iter.end()?;
        }
        Command::Size { start, end } => {
            let size = db.approximate_size(start, end).await?;
            writeln!(out, "{}", size)?;
        }
        Command::Property { name } => {
            let value = db.get_property(&name);
            if value.is_empty() {
                bail!("{}: unknown property", name);
            }
            writeln!(out, "{}", value)?;
        }
    }
    Ok(())
}
