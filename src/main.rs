//! Zero-knowledge encrypted file transfer client.
//!
//! The server only ever stores opaque encrypted blobs; registration and
//! login run OPAQUE so the bucket password never leaves this machine.
//!
//! # Usage
//!
//! ```bash
//! # Register a new bucket (prints the bucket key)
//! goxfer create --name "my files"
//!
//! # List files in a bucket
//! goxfer list --bucket ABC-DEF-01
//!
//! # Upload / download / delete
//! goxfer upload ./report.pdf --bucket ABC-DEF-01
//! goxfer download 3c6e0b8a-... --bucket ABC-DEF-01
//! goxfer delete 3c6e0b8a-... --bucket ABC-DEF-01
//!
//! # Measure transfer bandwidth
//! goxfer probe
//! ```
//!
//! Passwords are read from stdin and zeroized after use.

use std::io::{BufRead, IsTerminal};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use goxfer::auth::Auth;
use goxfer::cipher::SecretVec;
use goxfer::config;
use goxfer::credentials::CredsManager;
use goxfer::download::DownloadEngine;
use goxfer::error::{Result, XferError};
use goxfer::listing::FileListing;
use goxfer::pipeline::{CancelToken, ProgressFn};
use goxfer::session::Session;
use goxfer::transport::Transport;
use goxfer::upload::UploadEngine;

/// Current version from Cargo.toml.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI arguments.
#[derive(Parser)]
#[command(name = "goxfer")]
#[command(about = "Zero-knowledge encrypted file transfer")]
#[command(version = VERSION)]
struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new bucket and print its key.
    Create {
        /// Display name for the bucket.
        #[arg(short, long)]
        name: String,

        /// Remember the credentials in the OS secret service.
        #[arg(long)]
        remember: bool,
    },

    /// List files in a bucket.
    List {
        /// Bucket key (AAA-BBB-01).
        #[arg(short, long)]
        bucket: String,
    },

    /// Encrypt and upload a file.
    Upload {
        /// Path of the file to upload.
        path: std::path::PathBuf,

        /// Bucket key (AAA-BBB-01).
        #[arg(short, long)]
        bucket: String,

        /// Protect the file with an additional file password.
        #[arg(long)]
        file_password: bool,
    },

    /// Download, verify and decrypt a file into the working directory.
    Download {
        /// File UUID from `goxfer list`.
        file_id: String,

        /// Bucket key (AAA-BBB-01).
        #[arg(short, long)]
        bucket: String,

        /// The file was uploaded with a file password.
        #[arg(long)]
        file_password: bool,
    },

    /// Delete a file from a bucket.
    Delete {
        /// File UUID from `goxfer list`.
        file_id: String,

        /// Bucket key (AAA-BBB-01).
        #[arg(short, long)]
        bucket: String,
    },

    /// Measure upload and download bandwidth against the server.
    Probe,

    /// List remembered buckets.
    Creds,
}

/// Clears the session on every exit path, panic unwinds included.
struct SessionGuard(Arc<Session>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.clear();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config();

    goxfer::logger::init(&cfg.log_path())?;

    let session = Arc::new(Session::new());
    let _guard = SessionGuard(session.clone());
    let transport = Arc::new(Transport::new(cfg.api_url(), session.clone())?);
    let creds = CredsManager::new(cfg.creds_path());

    let outcome = run(cli.command, &transport, &creds).await;

    if let Err(e) = outcome {
        // Full detail to the log, stable message to the user.
        error!(error = %e, "Command failed");
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }

    Ok(())
}

async fn run(command: Commands, transport: &Arc<Transport>, creds: &CredsManager) -> Result<()> {
    let auth = Auth::new(transport.clone());

    match command {
        Commands::Create { name, remember } => {
            let password = prompt_password("Bucket password: ")?;
            let created = auth.new_bucket(password.clone(), &name).await?;
            if remember {
                creds.remember(&created.bucket_key, &password)?;
            }
            println!("Bucket created: {} ({})", created.bucket_key, created.name);
        }

        Commands::List { bucket } => {
            open_bucket(&auth, creds, &bucket, transport.session()).await?;
            let listing = FileListing::new(transport.clone());
            let files = listing.list_files().await?;
            if files.is_empty() {
                println!("No files.");
            }
            for file in files {
                println!(
                    "{}  {:>10}  {}{}  {}",
                    file.file_uuid,
                    file.file_size,
                    file.file_name,
                    if file.has_file_password { " [pw]" } else { "" },
                    file.created_at.format("%Y-%m-%d %H:%M"),
                );
            }
        }

        Commands::Upload {
            path,
            bucket,
            file_password,
        } => {
            open_bucket(&auth, creds, &bucket, transport.session()).await?;
            let file_pwd = if file_password {
                Some(prompt_password("File password: ")?)
            } else {
                None
            };

            let engine = UploadEngine::new(transport.clone());
            engine
                .manage_upload(file_pwd, &path, console_progress(), CancelToken::new())
                .await?;
            eprintln!();
            println!("Uploaded {}", path.display());
        }

        Commands::Download {
            file_id,
            bucket,
            file_password,
        } => {
            open_bucket(&auth, creds, &bucket, transport.session()).await?;
            let file_pwd = if file_password {
                Some(prompt_password("File password: ")?)
            } else {
                None
            };

            let engine = DownloadEngine::new(transport.clone());
            let path = engine
                .manage_download(&file_id, file_pwd, console_progress(), CancelToken::new())
                .await?;
            eprintln!();
            println!("Downloaded to {}", path.display());
        }

        Commands::Delete { file_id, bucket } => {
            open_bucket(&auth, creds, &bucket, transport.session()).await?;
            let listing = FileListing::new(transport.clone());
            listing.delete_file(&file_id).await?;
            println!("Deleted {}", file_id);
        }

        Commands::Probe => {
            let up = transport.probe_upload().await?;
            println!(
                "Upload:   {:.1} KB/s",
                up.bytes_per_ms() * 1000.0 / 1024.0
            );
            let down = transport.probe_download().await?;
            println!(
                "Download: {:.1} KB/s",
                down.bytes_per_ms() * 1000.0 / 1024.0
            );
        }

        Commands::Creds => {
            let saved = creds.list()?;
            if saved.is_empty() {
                println!("No remembered buckets.");
            }
            for cred in saved {
                println!("{}", cred.key);
            }
        }
    }

    Ok(())
}

/// Opens a bucket, preferring a remembered password over prompting.
///
/// After a successful open, warns when the server-granted session
/// lifetime is already short enough that a slow transfer may outlive it.
async fn open_bucket(
    auth: &Auth,
    creds: &CredsManager,
    bucket_key: &str,
    session: &Session,
) -> Result<()> {
    let remembered = creds
        .list()
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.key == bucket_key);

    let password = match remembered {
        Some(cred) => cred.password,
        None => prompt_password("Bucket password: ")?,
    };

    auth.open_bucket(bucket_key, password).await?;
    creds.mark_used(bucket_key)?;

    if let Some(remaining) = session.expires_in_secs() {
        if remaining < config::SESSION_EXPIRY_WARN_SECS {
            eprintln!(
                "Note: session expires in {}s; a long transfer may need a fresh login.",
                remaining.max(0)
            );
        }
    }

    Ok(())
}

/// Reads a password from stdin into a zeroizing buffer.
///
/// On a terminal the read happens in raw mode so nothing is echoed;
/// piped input falls back to a plain line read.
fn prompt_password(prompt: &str) -> Result<SecretVec> {
    eprint!("{}", prompt);

    let secret = if std::io::stdin().is_terminal() {
        read_password_no_echo()?
    } else {
        read_password_piped()?
    };
    eprintln!();

    if secret.is_empty() {
        return Err(XferError::InputInvalid("password cannot be empty".into()));
    }
    Ok(secret)
}

/// Collects key events in raw mode so typed characters never echo.
fn read_password_no_echo() -> Result<SecretVec> {
    use crossterm::event::{read, Event, KeyCode, KeyEventKind, KeyModifiers};
    use crossterm::terminal;

    // Raw mode is restored on every exit path, errors included.
    struct RawModeGuard;
    impl Drop for RawModeGuard {
        fn drop(&mut self) {
            let _ = terminal::disable_raw_mode();
        }
    }

    terminal::enable_raw_mode()
        .map_err(|e| XferError::Storage(format!("failed to enter raw mode: {}", e)))?;
    let _guard = RawModeGuard;

    let mut buf: Vec<u8> = Vec::new();
    loop {
        let event =
            read().map_err(|e| XferError::Storage(format!("failed to read input: {}", e)))?;
        let Event::Key(key) = event else { continue };
        if key.kind == KeyEventKind::Release {
            continue;
        }

        match key.code {
            KeyCode::Enter => break,
            KeyCode::Backspace => {
                buf.pop();
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                zeroize::Zeroize::zeroize(&mut buf);
                return Err(XferError::Cancelled);
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                let mut utf8 = [0u8; 4];
                buf.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            }
            _ => {}
        }
    }

    Ok(SecretVec::new(buf))
}

/// Fallback for non-interactive stdin (pipes, scripts).
fn read_password_piped() -> Result<SecretVec> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| XferError::Storage(format!("failed to read password: {}", e)))?;

    let trimmed = line.trim_end_matches(['\r', '\n']).as_bytes().to_vec();
    let secret = SecretVec::new(trimmed);
    // Wipe the intermediate line buffer.
    zeroize::Zeroize::zeroize(&mut line);

    Ok(secret)
}

/// Progress callback printing a single self-overwriting status line.
fn console_progress() -> ProgressFn {
    Arc::new(|label: &str, percent: u8| {
        eprint!("\r{:<20} {:>3}%", label, percent);
    })
}
