use clap::{Args, Parser, Subcommand};
use scholar::client::{self, AgentClient, ClientConfig};
use scholar::decoder::DecoderOptions;
use scholar::playback::Player;
use scholar::protocol::{FileAttachment, HistoryMessage, StreamChunk};
use scholar::tts::{ReconnectPolicy, TtsConfig, TtsService};
use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

type MainResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Debug, Parser)]
#[command(name = "scholar", about = "Study assistant client: streamed answers and spoken text")]
struct Cli {
    /// Base URL of the platform API.
    #[arg(long, env = "SCHOLAR_API_URL", default_value = "http://localhost:5000/api")]
    api_url: String,

    /// Bearer token for the agent API.
    #[arg(long, env = "SCHOLAR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask the study agent a question and stream the answer.
    Ask {
        query: String,

        /// JSON file with prior turns: `[{"role": "user", "content": "..."}]`.
        #[arg(long)]
        history_file: Option<PathBuf>,

        /// Print only the final answer instead of streaming events.
        #[arg(long)]
        quiet: bool,

        /// Decode a last event line even if the server closes without a newline.
        #[arg(long)]
        flush_trailing_line: bool,
    },
    /// Turn text into speech through the relay.
    Speak {
        text: String,

        /// Save the audio here instead of playing it.
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Player command line, e.g. "mpv --no-video".
        #[arg(long, env = "SCHOLAR_PLAYER")]
        player: Option<String>,

        /// Seconds to wait for the audio before giving up.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        #[command(flatten)]
        relay: RelayArgs,
    },
}

#[derive(Debug, Args)]
struct RelayArgs {
    /// Base URL of the speech relay.
    #[arg(long, env = "SCHOLAR_SOCKET_URL", default_value = "http://localhost:5000")]
    socket_url: String,

    #[arg(long, default_value_t = 5)]
    reconnect_attempts: u32,

    #[arg(long, default_value_t = 1000)]
    reconnect_delay_ms: u64,

    #[arg(long, default_value_t = 5000)]
    reconnect_max_delay_ms: u64,
}

impl RelayArgs {
    fn tts_config(&self) -> TtsConfig {
        TtsConfig {
            url: self.socket_url.clone(),
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect_attempts,
                base_delay: Duration::from_millis(self.reconnect_delay_ms),
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            },
        }
    }
}

#[tokio::main]
async fn main() -> MainResult<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scholar=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = AgentClient::new(ClientConfig {
        base_url: cli.api_url,
        token: client::resolve_token(cli.token),
    });

    match cli.command {
        Command::Ask {
            query,
            history_file,
            quiet,
            flush_trailing_line,
        } => {
            let history = match history_file {
                Some(path) => load_history(&path)?,
                None => Vec::new(),
            };
            let client = client.with_decoder_options(DecoderOptions {
                flush_trailing_line,
            });
            ask(&client, query, history, quiet).await
        }
        Command::Speak {
            text,
            output,
            player,
            timeout_secs,
            relay,
        } => speak(relay.tts_config(), text, output, player, timeout_secs).await,
    }
}

async fn ask(
    client: &AgentClient,
    query: String,
    history: Vec<HistoryMessage>,
    quiet: bool,
) -> MainResult<()> {
    if quiet {
        let reply = client.collect_reply(query, history).await?;
        println!("{}", reply.text);
        print_files(&reply.files);
        if let Some(message) = reply.error {
            return Err(format!("agent reported an error: {message}").into());
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    debug!(base_url = client.base_url(), "asking agent");
    client
        .query_stream(query, history, &cancel, |chunk| {
            match chunk {
                StreamChunk::Content { content } => {
                    let _ = write!(stdout, "{content}");
                    let _ = stdout.flush();
                }
                StreamChunk::Thinking {
                    content, action, ..
                } => match action {
                    Some(action) => eprintln!("[thinking: {action}] {content}"),
                    None => eprintln!("[thinking] {content}"),
                },
                StreamChunk::Files { files } => print_files(&files),
                StreamChunk::Error { error } => error!(%error, "agent reported an error"),
            }
            async {}
        })
        .await?;
    println!();

    Ok(())
}

async fn speak(
    config: TtsConfig,
    text: String,
    output: Option<PathBuf>,
    player: Option<String>,
    timeout_secs: u64,
) -> MainResult<()> {
    let tts = TtsService::new(config);
    tts.connect().await?;

    let pending = tts.request_speech(text)?;
    let clip = match tokio::time::timeout(Duration::from_secs(timeout_secs), pending).await {
        Ok(result) => result,
        Err(_) => {
            tts.disconnect().await;
            return Err(format!("no audio after {timeout_secs}s").into());
        }
    };
    tts.disconnect().await;
    let clip = clip?;

    match output {
        Some(path) => {
            clip.save(&path).await?;
            println!(
                "saved {} bytes of {} to {}",
                clip.len(),
                clip.mime_type,
                path.display()
            );
        }
        None => {
            let player = player
                .as_deref()
                .and_then(Player::from_command_line)
                .unwrap_or_default();
            if let Err(err) = player.play(&clip).await {
                warn!(error = %err, "audio playback failed");
            }
        }
    }

    Ok(())
}

fn load_history(path: &Path) -> MainResult<Vec<HistoryMessage>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}

fn print_files(files: &[FileAttachment]) {
    for file in files {
        match file.size {
            Some(size) => println!(
                "  [file] {} ({}, {size} bytes) {}",
                file.name, file.mime_type, file.download_url
            ),
            None => println!(
                "  [file] {} ({}) {}",
                file.name, file.mime_type, file.download_url
            ),
        }
    }
}
