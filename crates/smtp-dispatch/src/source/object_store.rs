use crate::error::SetupError;
use crate::source::{checked_body, http_client, ClickHouseQuery, Message, MessageSource};
use anyhow::Context;
use async_trait::async_trait;
use aws_sigv4::{sign_request, SigV4Request};
use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub host: String,
    pub port: u16,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

/// Fetches objects from an S3 compatible store (eg: MinIO) using
/// SigV4 signed path-style requests.
#[derive(Debug)]
pub struct ObjectStore {
    client: reqwest::Client,
    config: ObjectStoreConfig,
}

impl ObjectStore {
    pub fn new(config: ObjectStoreConfig) -> Result<Self, SetupError> {
        Ok(Self {
            client: http_client()?,
            config,
        })
    }

    /// Stored identifiers may carry a `/<bucket>/` prefix; the
    /// object key is whatever follows it.
    pub fn object_key<'a>(&self, stored: &'a str) -> &'a str {
        let prefix = format!("/{}/", self.config.bucket);
        match stored.strip_prefix(&prefix) {
            Some(key) => key,
            None => stored.trim_start_matches('/'),
        }
    }

    fn host_header(&self) -> String {
        // reqwest omits the port from Host when it is the scheme default
        if self.config.port == 80 {
            self.config.host.clone()
        } else {
            format!("{}:{}", self.config.host, self.config.port)
        }
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Bytes> {
        anyhow::ensure!(!key.is_empty(), "empty object key");

        let host = self.host_header();
        let path = format!("/{}/{key}", self.config.bucket);

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host.clone());

        let signed = sign_request(&SigV4Request {
            access_key: &self.config.access_key,
            secret_key: &self.config.secret_key,
            region: &self.config.region,
            service: "s3",
            method: "GET",
            uri: &path,
            query_params: BTreeMap::new(),
            headers,
            payload: b"",
            timestamp: None,
            session_token: None,
        })?;

        let url = format!("http://{host}{}", signed.canonical_uri);
        let mut request = self.client.get(&url);
        for (name, value) in signed.headers() {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        checked_body(response)
            .await
            .with_context(|| format!("GET {url}"))
    }
}

/// Replays captured messages: keys come from the analytical store,
/// content from the object store.
#[derive(Debug)]
pub struct ReplaySource {
    index: ClickHouseQuery,
    store: ObjectStore,
}

impl ReplaySource {
    pub fn new(index: ClickHouseQuery, store: ObjectStore) -> Self {
        Self { index, store }
    }
}

#[async_trait]
impl MessageSource for ReplaySource {
    async fn list(&self) -> Result<Vec<String>, SetupError> {
        self.index.object_keys().await
    }

    async fn fetch(&self, id: &str) -> anyhow::Result<Message> {
        let content = self.store.get(self.store.object_key(id)).await?;
        Ok(Message {
            id: id.to_string(),
            content,
        })
    }
}
