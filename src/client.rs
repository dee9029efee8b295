use crate::decoder::{self, DecoderOptions, StreamEnd};
use crate::error::ClientError;
use crate::protocol::{FileAttachment, HistoryMessage, QueryRequest, StreamChunk};
use reqwest::Client as HttpClient;
use std::future::Future;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Clone)]
pub struct AgentClient {
    base_url: String,
    token: Option<String>,
    http: HttpClient,
    decoder_options: DecoderOptions,
}

type ClientResult<T> = Result<T, ClientError>;

/// Picks the bearer token: an explicit value first, then the token file.
pub fn resolve_token(explicit: Option<String>) -> Option<String> {
    if let Some(token) = explicit.filter(|t| !t.trim().is_empty()) {
        return Some(token);
    }

    match std::fs::read_to_string(token_path()) {
        Ok(token) if !token.trim().is_empty() => Some(token.trim().to_string()),
        _ => None,
    }
}

/// Reply text folded from a whole agent stream.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub files: Vec<FileAttachment>,
    pub error: Option<String>,
}

impl AgentReply {
    fn absorb(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Content { content } => self.text.push_str(&content),
            StreamChunk::Thinking { .. } => {}
            StreamChunk::Files { files } => self.files.extend(files),
            StreamChunk::Error { error } => self.error = Some(error),
        }
    }
}

impl AgentClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            token: config.token,
            http: HttpClient::new(),
            decoder_options: DecoderOptions::default(),
        }
    }

    pub fn with_decoder_options(mut self, options: DecoderOptions) -> Self {
        self.decoder_options = options;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Streams an agent reply, calling `on_chunk` once per decoded event.
    pub async fn query_stream<F, Fut>(
        &self,
        query: String,
        history: Vec<HistoryMessage>,
        cancel: &CancellationToken,
        on_chunk: F,
    ) -> ClientResult<StreamEnd>
    where
        F: FnMut(StreamChunk) -> Fut,
        Fut: Future<Output = ()>,
    {
        let token = self.token.as_deref().ok_or(ClientError::MissingToken)?;

        let request = QueryRequest { query, history };
        let url = format!("{}/agent/query-stream", self.base_url);
        debug!(%url, history = request.history.len(), "opening agent stream");

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        let end = decoder::decode_stream(
            Box::pin(response.bytes_stream()),
            cancel,
            self.decoder_options,
            on_chunk,
        )
        .await?;
        info!(?end, "agent stream ended");
        Ok(end)
    }

    /// Runs a query to completion and folds the chunks into one reply.
    pub async fn collect_reply(
        &self,
        query: String,
        history: Vec<HistoryMessage>,
    ) -> ClientResult<AgentReply> {
        let mut reply = AgentReply::default();
        self.query_stream(query, history, &CancellationToken::new(), |chunk| {
            reply.absorb(chunk);
            async {}
        })
        .await?;
        Ok(reply)
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

fn token_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".scholar").join("auth.token");
    }

    PathBuf::from("scholar.token")
}
