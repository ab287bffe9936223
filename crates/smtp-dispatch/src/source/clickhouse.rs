use crate::error::SetupError;
use crate::source::{checked_body, http_client};
use chrono::NaiveDateTime;
use data_encoding::BASE64;
use serde_json::{Map, Value};

pub const TIME_LITERAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Validate a `YYYY-MM-DD HH:MM:SS` literal
pub fn parse_time_literal(which: &'static str, value: &str) -> Result<NaiveDateTime, SetupError> {
    NaiveDateTime::parse_from_str(value.trim(), TIME_LITERAL_FORMAT).map_err(|_| {
        SetupError::InvalidTime {
            which,
            value: value.to_string(),
        }
    })
}

fn check_identifier(which: &'static str, value: &str, allow_dot: bool) -> Result<(), SetupError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || (allow_dot && c == '.'));
    if valid {
        Ok(())
    } else {
        Err(SetupError::InvalidIdentifier {
            which,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub host: String,
    /// The HTTP interface port
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub table: String,
    /// Holds the base64 encoded object key of each message
    pub column: String,
    pub time_column: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Finds the object keys of the messages captured in a time range
#[derive(Debug)]
pub struct ClickHouseQuery {
    client: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseQuery {
    pub fn new(config: ClickHouseConfig) -> Result<Self, SetupError> {
        check_identifier("table", &config.table, true)?;
        check_identifier("column", &config.column, false)?;
        check_identifier("time column", &config.time_column, false)?;
        Ok(Self {
            client: http_client()?,
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!("http://{}:{}/", self.config.host, self.config.port)
    }

    pub fn query_text(&self) -> String {
        let ClickHouseConfig {
            table,
            column,
            time_column,
            start,
            end,
            ..
        } = &self.config;
        format!(
            "SELECT {column} FROM {table} \
             WHERE {time_column} >= '{start}' AND {time_column} <= '{end}' \
             FORMAT JSONEachRow",
            start = start.format(TIME_LITERAL_FORMAT),
            end = end.format(TIME_LITERAL_FORMAT),
        )
    }

    pub async fn object_keys(&self) -> Result<Vec<String>, SetupError> {
        let endpoint = self.endpoint();
        let query = self.query_text();
        tracing::debug!("{endpoint}: {query}");

        let body = async {
            let response = self
                .client
                .post(&endpoint)
                .query(&[("database", self.config.database.as_str())])
                .header("X-ClickHouse-User", &self.config.user)
                .header("X-ClickHouse-Key", &self.config.password)
                .body(query)
                .send()
                .await?;
            checked_body(response).await
        }
        .await
        .map_err(|err| SetupError::Query {
            endpoint: endpoint.clone(),
            reason: format!("{err:#}"),
        })?;

        let keys = decode_rows(&self.config.column, &String::from_utf8_lossy(&body));
        tracing::info!("{} messages in range {}", keys.len(), self.describe_range());
        Ok(keys)
    }

    fn describe_range(&self) -> String {
        format!(
            "[{}, {}]",
            self.config.start.format(TIME_LITERAL_FORMAT),
            self.config.end.format(TIME_LITERAL_FORMAT)
        )
    }
}

/// Extract and base64-decode `column` from each JSONEachRow line.
/// A NULL value yields an empty key; rows that cannot be decoded
/// are logged and skipped.
fn decode_rows(column: &str, body: &str) -> Vec<String> {
    let mut keys = vec![];
    for (idx, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: Map<String, Value> = match serde_json::from_str(line) {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!("row {idx}: not a JSON object: {err:#}");
                continue;
            }
        };
        match row.get(column) {
            None | Some(Value::Null) => keys.push(String::new()),
            Some(Value::String(encoded)) => {
                match BASE64
                    .decode(encoded.as_bytes())
                    .map_err(anyhow::Error::from)
                    .and_then(|raw| Ok(String::from_utf8(raw)?))
                {
                    Ok(key) => keys.push(key),
                    Err(err) => tracing::warn!("row {idx}: undecodable {column}: {err:#}"),
                }
            }
            Some(other) => tracing::warn!("row {idx}: unexpected {column} value {other}"),
        }
    }
    keys
}
