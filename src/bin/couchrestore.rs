//! couchrestore — stream a backup file from stdin into a database.

use clap::Parser;
use couchbackup::{ClientOptions, CouchClient, Event, Restore, RestoreOptions, RetryConfig};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "couchrestore")]
#[command(version)]
#[command(about = "Restore a backup file from stdin into a CouchDB or Cloudant database", long_about = None)]
struct Args {
    /// Server URL, excluding the database name
    #[arg(long, env = "COUCH_URL")]
    url: Option<String>,

    /// Target database name; must be empty unless it is a system database
    #[arg(long, env = "COUCH_DATABASE")]
    db: String,

    /// IAM API key; overrides any credentials embedded in the URL
    #[arg(long, env = "COUCHBACKUP_TEST_IAM_API_KEY", hide_env_values = true)]
    iam_api_key: Option<String>,

    /// Documents per bulk write
    #[arg(long, default_value_t = 500)]
    buffer_size: usize,

    /// Concurrent bulk write requests
    #[arg(long, default_value_t = 5)]
    parallelism: usize,

    /// Per-attempt HTTP request timeout in milliseconds
    #[arg(long, default_value_t = 120_000)]
    request_timeout: u64,

    /// Backup was taken with inlined attachments
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

    let restore = Restore::new(
        client,
        RestoreOptions {
            buffer_size: args.buffer_size,
            parallelism: args.parallelism,
            request_timeout: Duration::from_millis(args.request_timeout),
            attachments: args.attachments,
            retry: RetryConfig::default(),
        },
    );

    let mut events = restore.subscribe();
    let quiet = args.quiet;
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if quiet {
                continue;
            }
            match event {
                Event::BatchRestored { documents, total } => {
                    eprintln!("restored {documents} docs ({total} total)");
                }
                Event::Finished { total } => {
                    eprintln!("restore complete ({total} docs)");
                }
                Event::Failed { .. }
                | Event::ChangesBatch { .. }
                | Event::BatchWritten { .. } => {}
            }
        }
    });

    let run_result = restore.run(tokio::io::stdin()).await;

    // Dropping the restore closes the event feed so the printer drains fully
    drop(restore);
    let _ = progress.await;

    run_result.map(|_| ())
}
