use crate::error::SetupError;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub mod clickhouse;
pub mod dir;
pub mod object_store;

pub use clickhouse::{parse_time_literal, ClickHouseConfig, ClickHouseQuery};
pub use dir::DirSource;
pub use object_store::{ObjectStore, ObjectStoreConfig, ReplaySource};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// A raw RFC 5322 message and the identifier it was fetched by
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub content: Bytes,
}

/// Where the messages for a run come from.
///
/// `list` is called once, before anything is dispatched; its
/// failure aborts the run. `fetch` is called once per admitted
/// identifier and its failure only affects that attempt.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn list(&self) -> Result<Vec<String>, SetupError>;

    async fn fetch(&self, id: &str) -> anyhow::Result<Message>;
}

pub(crate) fn http_client() -> Result<reqwest::Client, SetupError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(SetupError::HttpClient)
}

/// The response body, or an error describing the status and body
/// when the request did not succeed.
pub(crate) async fn checked_body(response: reqwest::Response) -> anyhow::Result<Bytes> {
    let status = response.status();
    let body = response.bytes().await.with_context(|| {
        format!(
            "request status {}: {}, and failed to read response body",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
    })?;
    if !status.is_success() {
        anyhow::bail!(
            "request status {}: {}. Response body: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            String::from_utf8_lossy(&body).trim_end()
        );
    }
    Ok(body)
}
