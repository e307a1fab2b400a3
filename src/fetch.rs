use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::LinesStream;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("graphql errors: {0}")]
    GraphQl(String),
}

/// Error surfaced by a subscription event source.
///
/// A terminal error ends the subscription; anything else is reported and
/// delivery continues.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub terminal: bool,
}

impl TransportError {
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: true,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: false,
        }
    }
}

pub type EventSource = Pin<Box<dyn Stream<Item = Result<Value, TransportError>> + Send>>;

/// Executes a tracked query. Used by REFETCH invalidations.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, definition: &str, variables: &Value) -> Result<Value, FetchError>;
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorEntry {
    message: String,
}

/// Extracts `data` from a GraphQL response body, failing on any `errors`.
pub fn parse_graphql_response(body: Value) -> Result<Value, FetchError> {
    let response: GraphQlResponse = serde_json::from_value(body)?;
    if !response.errors.is_empty() {
        let messages: Vec<_> = response.errors.into_iter().map(|e| e.message).collect();
        return Err(FetchError::GraphQl(messages.join("; ")));
    }
    Ok(response.data.unwrap_or(Value::Null))
}

/// Posts `{ query, variables }` to a GraphQL endpoint.
pub struct HttpQueryFetcher {
    client: Client,
    endpoint: String,
}

impl HttpQueryFetcher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(Client::new(), endpoint)
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl QueryFetcher for HttpQueryFetcher {
    async fn fetch(&self, definition: &str, variables: &Value) -> Result<Value, FetchError> {
        let body: Value = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": definition, "variables": variables }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_graphql_response(body)
    }
}

/// Parses one line of a newline-delimited JSON event stream. Blank lines
/// yield `None`; undecodable lines are transient errors.
pub fn parse_event_line(line: &str) -> Option<Result<Value, TransportError>> {
    if line.trim().is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<Value>(line)
            .map_err(|e| TransportError::transient(format!("undecodable event: {e}"))),
    )
}

/// Subscription event source reading newline-delimited JSON from a
/// long-lived HTTP response.
pub fn http_event_source(client: Client, url: String) -> EventSource {
    use tokio::io::AsyncBufReadExt;

    let stream = futures::stream::once(async move {
        let resp = client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TransportError::terminal(format!("failed to open event stream: {e}")))?;

        let reader = tokio_util::io::StreamReader::new(
            resp.bytes_stream().map(|r| r.map_err(std::io::Error::other)),
        );
        let lines = tokio::io::BufReader::new(reader).lines();
        Ok::<_, TransportError>(LinesStream::new(lines))
    })
    .flat_map(|opened| match opened {
        Ok(lines) => lines
            .filter_map(|line| async move {
                match line {
                    Ok(line) => parse_event_line(&line),
                    Err(e) => Some(Err(TransportError::terminal(format!(
                        "event stream broken: {e}"
                    )))),
                }
            })
            .boxed(),
        Err(e) => {
            warn!(error = %e, "event stream unavailable");
            futures::stream::once(async move { Err(e) }).boxed()
        }
    });

    Box::pin(stream)
}
