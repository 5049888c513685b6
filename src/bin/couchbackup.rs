//! couchbackup — stream a database to a newline-delimited backup file.

use clap::Parser;
use couchbackup::{
    Backup, BackupMode, BackupOptions, ClientOptions, CouchClient, Event, RetryConfig,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "couchbackup")]
#[command(version)]
#[command(about = "Backup a CouchDB or Cloudant database to a file", long_about = None)]
struct Args {
    /// Server URL, excluding the database name
    #[arg(long, env = "COUCH_URL")]
    url: Option<String>,

    /// Database name to back up
    #[arg(long, env = "COUCH_DATABASE")]
    db: String,

    /// IAM API key; overrides any credentials embedded in the URL
    #[arg(long, env = "COUCHBACKUP_TEST_IAM_API_KEY", hide_env_values = true)]
    iam_api_key: Option<String>,

    /// Documents per batch
    #[arg(long, default_value_t = 500)]
    buffer_size: usize,

    /// Concurrent document fetch requests
    #[arg(long, default_value_t = 5)]
    parallelism: usize,

    /// Per-attempt HTTP request timeout in milliseconds
    #[arg(long, default_value_t = 120_000)]
    request_timeout: u64,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Batch-lifecycle log file; required for --resume
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Resume an interrupted backup recorded in the log file
    #[arg(long)]
    resume: bool,

    /// Backup mode: "full" (changes feed, resumable) or "shallow"
    #[arg(long, default_value = "full")]
    mode: BackupMode,

    /// Inline attachment bodies (preview, Apache CouchDB sources only)
    #[arg(long)]
    attachments: bool,

    /// Suppress per-batch progress messages
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{}: {e}", e.kind_name());
        std::process::exit(e.exit_code());
    }
}

fn init_tracing() {
    let filter = if std::env::var_os("DEBUG").is_some() {
        tracing_subscriber::EnvFilter::new("couchbackup=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> couchbackup::Result<()> {
    let base = args
        .url
        .or_else(|| std::env::var("COUCH_BACKEND_URL").ok())
        .unwrap_or_else(|| "http://localhost:5984".to_string());
    let db_url = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        urlencoding::encode(&args.db)
    );

    let client = CouchClient::connect(
        &db_url,
        ClientOptions {
            parallelism: args.parallelism,
            request_timeout: Some(Duration::from_millis(args.request_timeout)),
            iam_api_key: args.iam_api_key,
            retry: RetryConfig::default(),
        },
    )
    .await?;

    let backup = Backup::new(
        client,
        BackupOptions {
            buffer_size: args.buffer_size,
            parallelism: args.parallelism,
            request_timeout: Duration::from_millis(args.request_timeout),
            log: args.log,
            resume: args.resume,
            mode: args.mode,
            attachments: args.attachments,
            retry: RetryConfig::default(),
        },
    );

    let mut events = backup.subscribe();
    let quiet = args.quiet;
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if quiet {
                continue;
            }
            match event {
                Event::ChangesBatch { batch, documents } => {
                    eprintln!("spooled batch {batch} ({documents} changes)");
                }
                Event::BatchWritten {
                    batch,
                    documents,
                    total,
                } => {
                    eprintln!("backed up batch {batch} ({documents} docs, {total} total)");
                }
                Event::Finished { total } => {
                    eprintln!("backup complete ({total} docs)");
                }
                Event::Failed { .. } | Event::BatchRestored { .. } => {}
            }
        }
    });

    let run_result = match args.output {
        Some(path) => backup.run(tokio::fs::File::create(path).await?).await,
        None => backup.run(tokio::io::stdout()).await,
    };

    // Dropping the backup closes the event feed so the printer drains fully
    drop(backup);
    let _ = progress.await;

    run_result.map(|_| ())
}
