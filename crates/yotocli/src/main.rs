//! yoto - manage Yoto cards and players from the command line.
//!
//! Thin shell over `yotocli-core`: parses arguments, sets up logging, keeps
//! the stored tokens fresh and prints results.

mod logging;
mod output;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yotocli_core::library::EditRequest;
use yotocli_core::resolver::LibraryPath;
use yotocli_core::{
    ConfigManager, DeviceAuthFlow, FfmpegNormalizer, HttpGateway, Library, LibraryGateway,
    Progress, UploadPipeline, YtDlpDownloader,
};

/// Manage Yoto playlists, uploads and players.
#[derive(Parser, Debug)]
#[command(name = "yoto")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (JSON).
    #[arg(short, long, value_name = "FILE", global = true, env = "YOTOCLI_CONFIG")]
    config: Option<PathBuf>,

    /// Show debug output on the console.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authorize this tool with your Yoto account.
    Login {
        /// OAuth client ID (prompted for when not stored yet).
        #[arg(long)]
        client_id: Option<String>,
    },
    /// List playlists, the tracks of a playlist, or one track.
    Ls {
        /// `Playlist` or `Playlist/Track`.
        path: Option<String>,
    },
    /// Upload a file into a playlist (`Playlist` or `Playlist/position`).
    Add {
        /// Target playlist, optionally with a 1-based position.
        path: String,
        /// Audio file to upload.
        file: PathBuf,
        /// Upload the file as is.
        #[arg(long)]
        no_normalize: bool,
    },
    /// Create a new playlist from every audio file in a directory.
    Create {
        /// Directory holding the audio files.
        dir: PathBuf,
        /// Playlist name (defaults to the directory name).
        #[arg(short, long)]
        name: Option<String>,
        /// Upload the files as is.
        #[arg(long)]
        no_normalize: bool,
    },
    /// Download audio from a URL with yt-dlp and upload it.
    Import {
        /// Page to download from.
        url: String,
        /// Playlist to add to (created when missing). Defaults to a new
        /// playlist named after the download.
        #[arg(short, long)]
        playlist: Option<String>,
        /// Upload the file as is.
        #[arg(long)]
        no_normalize: bool,
    },
    /// Delete a playlist or remove one track.
    Rm {
        /// `Playlist` or `Playlist/Track`.
        path: String,
    },
    /// Move a track within or between playlists.
    Mv {
        /// `Playlist/Track`.
        src: String,
        /// `Playlist[/position]`, or a bare position in the same playlist.
        dst: String,
    },
    /// Copy a track into another playlist.
    Cp {
        /// `Playlist/Track`.
        src: String,
        /// `Playlist[/position]`.
        dst: String,
    },
    /// Move a track one place up.
    Mvup {
        /// `Playlist/Track`.
        path: String,
    },
    /// Move a track one place down.
    Mvdown {
        /// `Playlist/Track`.
        path: String,
    },
    /// Change playlist details or rename a track.
    Edit {
        /// `Playlist` or `Playlist/Track`.
        path: String,
        /// New title.
        #[arg(short, long)]
        name: Option<String>,
        /// New author (playlists only).
        #[arg(short, long)]
        author: Option<String>,
        /// New description (playlists only).
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Download a track to a file or a playlist to a directory.
    Download {
        /// `Playlist` or `Playlist/Track`.
        path: String,
        /// Destination file or directory.
        dest: Option<PathBuf>,
    },
    /// Show players with battery, volume and what is playing.
    Status,
    /// Play a playlist on a player.
    Play {
        /// Playlist to start.
        playlist: String,
        /// Player name (defaults to the first player).
        device: Option<String>,
    },
    /// Stop playback.
    Stop {
        /// Player name (defaults to the first player).
        device: Option<String>,
    },
    /// Pause playback.
    Pause {
        /// Player name (defaults to the first player).
        device: Option<String>,
    },
    /// Set player volume.
    Volume {
        /// Level between 0 and 100.
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        level: u8,
        /// Player name (defaults to the first player).
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = match logging::init(&logging::LoggingConfig::for_cli(cli.verbose)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: file logging disabled: {e}");
            None
        }
    };
    debug!(version = env!("CARGO_PKG_VERSION"), "yoto starting");

    let mut config = ConfigManager::load(cli.config).context("Failed to load configuration")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    if let Command::Login { client_id } = cli.command {
        return login(&mut config, client_id, &cancel).await;
    }

    let gateway = connect(&mut config).await?;
    let normalize = config.config().normalize;
    let pipeline = UploadPipeline::new(Arc::new(gateway), Arc::new(FfmpegNormalizer::new()))
        .with_poll_policy(config.config().poll_policy())
        .with_icon(config.config().default_icon.clone())
        .with_cancellation(cancel);
    let library = Library::new(pipeline, Arc::new(YtDlpDownloader::new()));

    run(&library, cli.command, normalize).await
}

// =============================================================================
// Authorization
// =============================================================================

fn unauthenticated_gateway(config: &ConfigManager) -> Result<HttpGateway> {
    HttpGateway::builder()
        .api_base_url(&config.config().api_base_url)
        .auth_base_url(&config.config().auth_base_url)
        .build()
        .context("Failed to build HTTP client")
}

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(
    config: &mut ConfigManager,
    client_id: Option<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let client_id = match client_id {
        Some(id) => id,
        None if !config.client_id().is_empty() => config.client_id().to_string(),
        None => prompt("Enter your Yoto client ID: ")?,
    };
    if client_id.is_empty() {
        bail!("a client ID is required to log in");
    }

    let gateway = Arc::new(unauthenticated_gateway(config)?);
    let flow = DeviceAuthFlow::new(gateway, client_id.clone());
    let tokens = flow
        .login(
            |auth| {
                println!("To authorize, visit {}", auth.verification_uri);
                println!("and enter the code: {}", auth.user_code);
                if let Some(complete) = &auth.verification_uri_complete {
                    println!("(or open {complete})");
                }
                println!("Waiting for authorization...");
            },
            cancel,
        )
        .await
        .context("Login failed")?;

    config.set_client_id(client_id);
    config.set_tokens(tokens.access_token, tokens.refresh_token);
    config.save().context("Failed to save tokens")?;

    println!("Logged in. Tokens saved to {}", config.path().display());
    Ok(())
}

/// Build the API gateway, refreshing the access token once if the service
/// rejects it. A failed refresh is logged and the old token is kept.
async fn connect(config: &mut ConfigManager) -> Result<HttpGateway> {
    if !config.config().is_logged_in() {
        bail!("not logged in, run `yoto login` first");
    }

    let base = unauthenticated_gateway(config)?;
    let gateway = base.with_access_token(config.access_token());

    match gateway.list_cards().await {
        Err(e) if e.is_unauthorized() => {
            info!("Access token rejected, refreshing");
        }
        Err(e) => {
            debug!(error = %e, "Startup probe failed");
            return Ok(gateway);
        }
        Ok(_) => return Ok(gateway),
    }

    let flow = DeviceAuthFlow::new(Arc::new(base.clone()), config.client_id());
    let refreshed = flow.refresh(config.refresh_token()).await;
    match refreshed {
        Ok(tokens) => {
            config.set_tokens(tokens.access_token, tokens.refresh_token);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save refreshed tokens");
            }
            Ok(base.with_access_token(config.access_token()))
        }
        Err(e) => {
            warn!(error = %e, "Token refresh failed, run `yoto login` if commands keep failing");
            Ok(gateway)
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

fn print_progress(path: &Path, progress: &Progress) {
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    match progress {
        Progress::Stage(stage) => eprintln!("  {name}: {stage}"),
        Progress::Warning(message) => eprintln!("  {name}: warning: {message}"),
    }
}

async fn run(library: &Library, command: Command, default_normalize: bool) -> Result<()> {
    let normalize = |no_normalize: bool| default_normalize && !no_normalize;

    match command {
        Command::Login { .. } => bail!("login does not need a connected library"),
        Command::Ls { path } => {
            let Some(path) = path else {
                print!("{}", output::cards_table(&library.list_cards().await?));
                return Ok(());
            };
            let query = LibraryPath::parse(&path);
            match query.chapter {
                Some(chapter) => {
                    let (_, position, chapter) = library.show_chapter(&query.card, &chapter).await?;
                    print!("{}", output::chapter_detail(position, &chapter));
                }
                None => print!("{}", output::chapters_table(&library.show_card(&query.card).await?)),
            }
        }
        Command::Add {
            path,
            file,
            no_normalize,
        } => {
            let outcome = library
                .add_track(&path, &file, normalize(no_normalize), true, Some(&print_progress))
                .await?;
            if outcome.created {
                println!("Created playlist '{}'", outcome.card_title);
            }
            println!(
                "Added '{}' to '{}' at position {}",
                outcome.track_title, outcome.card_title, outcome.position
            );
        }
        Command::Create {
            dir,
            name,
            no_normalize,
        } => {
            let card = library
                .create_from_directory(
                    &dir,
                    name.as_deref(),
                    normalize(no_normalize),
                    Some(&print_progress),
                )
                .await?;
            println!(
                "Created playlist '{}' with {} tracks",
                card.title,
                card.chapters().len()
            );
        }
        Command::Import {
            url,
            playlist,
            no_normalize,
        } => {
            let outcome = library
                .import_url(
                    &url,
                    playlist.as_deref(),
                    normalize(no_normalize),
                    Some(&print_progress),
                )
                .await?;
            println!(
                "Imported '{}' into '{}' at position {}",
                outcome.track_title, outcome.card_title, outcome.position
            );
        }
        Command::Rm { path } => {
            println!("{}", output::removed_line(&library.remove(&path).await?));
        }
        Command::Mv { src, dst } => {
            let outcome = library.move_track(&src, &dst).await?;
            println!("{}", output::transfer_line("Moved", &outcome));
        }
        Command::Cp { src, dst } => {
            let outcome = library.copy_track(&src, &dst).await?;
            println!("{}", output::transfer_line("Copied", &outcome));
        }
        Command::Mvup { path } => {
            let outcome = library.move_relative(&path, -1).await?;
            println!("{}", output::transfer_line("Moved", &outcome));
        }
        Command::Mvdown { path } => {
            let outcome = library.move_relative(&path, 1).await?;
            println!("{}", output::transfer_line("Moved", &outcome));
        }
        Command::Edit {
            path,
            name,
            author,
            description,
        } => {
            let changes = EditRequest {
                name,
                author,
                description,
            };
            let card = library.edit(&path, &changes).await?;
            println!("Updated '{}'", card.title);
        }
        Command::Download { path, dest } => {
            let files = library.download(&path, dest.as_deref()).await?;
            if files.is_empty() {
                println!("Playlist is empty.");
            }
            for file in &files {
                println!("Downloaded {}", file.display());
            }
        }
        Command::Status => {
            print!("{}", output::devices_table(&library.devices_with_status().await?));
        }
        Command::Play { playlist, device } => {
            let (card, device) = library.play(&playlist, device.as_deref()).await?;
            println!("Playing '{}' on {}", card.title, device.name);
        }
        Command::Stop { device } => {
            let device = library.stop(device.as_deref()).await?;
            println!("Stopped {}", device.name);
        }
        Command::Pause { device } => {
            let device = library.pause(device.as_deref()).await?;
            println!("Paused {}", device.name);
        }
        Command::Volume { level, device } => {
            let device = library.set_volume(level, device.as_deref()).await?;
            println!("Volume of {} set to {level}", device.name);
        }
    }

    Ok(())
}
