use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use s3pipe::s3::{self, ObjectUrl, RequestSigner, S3Client, S3Error};
use s3pipe::{Config, Destination};

#[derive(Parser, Debug)]
#[command(
    name = "s3pipe",
    version = env!("CARGO_PKG_VERSION"),
    author = "Tyr Chen <tyr.chen@gmail.com>",
    about = "Stream data to and from S3-compatible object storage",
    long_about = "Write stdin to one or more objects at once without buffering it, read objects \
                  (or byte ranges of them) back to stdout, and inspect object metadata. \
                  Configure credentials via .env file or environment variables.",
    after_help = "Examples:\n  \
                  mysqldump accountsdb | s3pipe pipe s3.amazonaws.com/backups/accountsdb.sql\n  \
                  cat debian.iso | s3pipe pipe s3.amazonaws.com/a/gnuos.iso http://localhost:9000/b/gnuos.iso\n  \
                  s3pipe cat s3.amazonaws.com/backups/accountsdb.sql --offset 100 --length 50\n  \
                  s3pipe stat s3.amazonaws.com/backups/accountsdb.sql --json\n  \
                  s3pipe put ./notes.txt s3.amazonaws.com/personalbuck/meeting-notes.txt\n\n\
                  Configuration (.env):\n  \
                  AWS_ACCESS_KEY_ID=...\n  \
                  AWS_SECRET_ACCESS_KEY=...\n  \
                  AWS_REGION=us-west-2\n\n\
                  For more information: https://github.com/tyrchen/swiss-knife"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write stdin to one or more targets; with no target, write to stdout
    Pipe {
        /// Object URLs (host/bucket/key)
        targets: Vec<String>,
    },

    /// Write an object, or a byte range of it, to stdout
    #[command(allow_negative_numbers = true)]
    Cat {
        /// Object URL (host/bucket/key)
        target: String,

        /// First byte to read
        #[arg(long)]
        offset: Option<i64>,

        /// Number of bytes to read (negative reads to the end)
        #[arg(long)]
        length: Option<i64>,
    },

    /// Show size and modification time of an object
    Stat {
        /// Object URL (host/bucket/key)
        target: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Upload a local file with its size and MD5
    Put {
        /// Local file to upload
        file: PathBuf,

        /// Object URL (host/bucket/key)
        target: String,
    },
}

struct Clients {
    config: Config,
    http: reqwest::Client,
    signer: Arc<dyn RequestSigner>,
}

impl Clients {
    fn new() -> Result<Self> {
        let config = Config::from_env()?;
        let http = config.http_client()?;
        let signer = config.signer();
        Ok(Self {
            config,
            http,
            signer,
        })
    }

    fn resolve(&self, target: &str) -> Result<(S3Client, ObjectUrl)> {
        let url = ObjectUrl::parse(target).context("Unable to parse arguments.")?;
        let client = self.config.client_for(&self.http, &self.signer, &url);
        Ok((client, url))
    }
}

#[tokio::main]
async fn main() {
    // Load .env file early to get LOG_LEVEL
    dotenv::dotenv().ok();

    // Logs go to stderr so stdout stays clean for piped data
    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "warn".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", style("✗").red(), style(error_report(&e)).red());
        std::process::exit(1);
    }
}

/// Context added on the way up, then the hint-bearing message of the S3
/// error underneath, which already includes its own cause chain
fn error_report(e: &anyhow::Error) -> String {
    let Some(s3_error) = e.downcast_ref::<S3Error>() else {
        return format!("{:#}", e);
    };

    let context: Vec<String> = e
        .chain()
        .take_while(|cause| !cause.is::<S3Error>())
        .map(|cause| cause.to_string())
        .collect();
    if context.is_empty() {
        s3_error.user_message()
    } else {
        format!("{}\n\n{}", context.join(": "), s3_error.user_message())
    }
}

async fn run(cli: Cli) -> Result<()> {
    let clients = Clients::new()?;

    match cli.command {
        Command::Pipe { targets } => {
            let destinations = targets
                .iter()
                .map(|t| {
                    let (client, url) = clients.resolve(t)?;
                    Ok(Destination::new(client, &url))
                })
                .collect::<Result<Vec<_>>>()?;

            info!("Piping stdin to {} target(s)", destinations.len());
            s3pipe::pipe(&destinations, tokio::io::stdin(), tokio::io::stdout())
                .await
                .context("Unable to write to one or more targets.")?;
        }
        Command::Cat {
            target,
            offset,
            length,
        } => {
            let (client, url) = clients.resolve(&target)?;
            let output = if offset.is_some() || length.is_some() {
                client
                    .get_partial(url.target(), offset.unwrap_or(0), length.unwrap_or(-1))
                    .await
            } else {
                client.get(url.target()).await
            }
            .with_context(|| format!("Unable to read {}", url))?;

            info!("Reading {} (etag {})", url, output.etag);
            s3pipe::cat_out(output.body, tokio::io::stdout())
                .await
                .with_context(|| format!("Unable to copy {} to stdout", url))?;
        }
        Command::Stat { target, json } => {
            let (client, url) = clients.resolve(&target)?;
            let stat = client
                .stat_object(url.target())
                .await
                .with_context(|| format!("Unable to stat {}", url))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&stat)?);
            } else {
                let modified = stat
                    .last_modified
                    .map(|t| t.to_rfc2822())
                    .unwrap_or_else(|| "-".to_string());
                println!("{} {}", style("Name:").bold(), url);
                println!("{} {} bytes", style("Size:").bold(), stat.size);
                println!("{} {}", style("Modified:").bold(), modified);
            }
        }
        Command::Put { file, target } => {
            let (client, url) = clients.resolve(&target)?;

            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                    .context("Invalid progress bar template")?
                    .progress_chars("#>-"),
            );

            let size = s3::upload_file(&client, url.target(), &file, Some(&pb)).await?;
            println!(
                "{} {} → {} ({} bytes)",
                style("✓").green(),
                style(file.display()).green(),
                url,
                size
            );
        }
    }

    Ok(())
}
