use base64::Engine as _;
use bytes::Bytes;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_MIME_TYPE: &str = "audio/mpeg";

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("invalid base64 audio: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("audio file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not start player '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("player '{command}' exited with {status}")]
    PlayerFailed { command: String, status: String },
}

/// Decoded speech audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl AudioClip {
    pub fn from_base64(audio: &str, mime_type: Option<&str>) -> Result<Self, PlaybackError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(audio.trim())?;
        Ok(Self {
            bytes: Bytes::from(bytes),
            mime_type: mime_type.unwrap_or(DEFAULT_MIME_TYPE).to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn file_extension(&self) -> &'static str {
        let subtype = self
            .mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match subtype.as_str() {
            "audio/mpeg" | "audio/mp3" => "mp3",
            "audio/wav" | "audio/wave" | "audio/x-wav" => "wav",
            "audio/ogg" | "audio/opus" => "ogg",
            "audio/webm" => "webm",
            _ => "bin",
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), PlaybackError> {
        tokio::fs::write(path, &self.bytes).await?;
        Ok(())
    }
}

/// External audio player invoked as `<command> <args..> <file>`.
#[derive(Debug, Clone)]
pub struct Player {
    command: String,
    args: Vec<String>,
}

impl Default for Player {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::new("afplay", Vec::new())
        } else {
            Self::new(
                "ffplay",
                vec![
                    "-nodisp".to_string(),
                    "-autoexit".to_string(),
                    "-loglevel".to_string(),
                    "quiet".to_string(),
                ],
            )
        }
    }
}

impl Player {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Parses a whitespace-separated command line such as `mpv --no-video`.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let command = parts.next()?;
        Some(Self::new(command, parts.collect()))
    }

    /// Plays `clip` from a temporary file that is removed once playback ends.
    pub async fn play(&self, clip: &AudioClip) -> Result<(), PlaybackError> {
        let file = tempfile::Builder::new()
            .prefix("scholar-tts-")
            .suffix(&format!(".{}", clip.file_extension()))
            .tempfile()?;
        tokio::fs::write(file.path(), &clip.bytes).await?;
        debug!(path = %file.path().display(), bytes = clip.len(), "playing clip");

        let status = Command::new(&self.command)
            .args(&self.args)
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| PlaybackError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        file.close()?;

        if status.success() {
            Ok(())
        } else {
            Err(PlaybackError::PlayerFailed {
                command: self.command.clone(),
                status: status.to_string(),
            })
        }
    }
}
