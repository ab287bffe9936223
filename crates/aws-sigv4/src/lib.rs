//! AWS Signature Version 4 request signing.
//!
//! Used to authenticate requests against S3-compatible object
//! stores (AWS S3, MinIO, Ceph RGW and friends).
use aws_lc_rs::hmac::Key;
use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use std::collections::BTreeMap;

/// AWS SigV4 URI encoding set
/// Encodes everything except: A-Z a-z 0-9 - _ . ~
const URI_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'!')
    .add(b'"')
    .add(b'#')
    .add(b'$')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'=')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']');

/// SHA-256 of the empty string; the payload hash of every GET
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone)]
pub struct SigV4Request<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    /// AWS region (e.g., "us-east-1")
    pub region: &'a str,
    /// AWS service name (e.g., "s3")
    pub service: &'a str,
    /// HTTP method (e.g., "GET", "POST")
    pub method: &'a str,
    /// URI path, not yet encoded (e.g., "/bucket/some key")
    pub uri: &'a str,
    pub query_params: BTreeMap<String, String>,
    /// HTTP headers to sign. Must include `host`.
    pub headers: BTreeMap<String, String>,
    pub payload: &'a [u8],
    /// Optional timestamp (defaults to current time)
    pub timestamp: Option<DateTime<Utc>>,
    /// Optional session token for temporary credentials
    pub session_token: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigV4Response {
    /// The authorization header value
    pub authorization: String,
    /// The timestamp used in ISO8601 format (YYYYMMDD'T'HHMMSS'Z')
    pub timestamp: String,
    /// Hex SHA-256 of the payload; send as `x-amz-content-sha256`
    pub payload_hash: String,
    /// The encoded path that was signed; the request must use it verbatim
    pub canonical_uri: String,
    /// The canonical request (for debugging)
    pub canonical_request: String,
    /// The string to sign (for debugging)
    pub string_to_sign: String,
    /// The signature
    pub signature: String,
}

impl SigV4Response {
    /// The headers that must accompany the signed request
    pub fn headers(&self) -> [(&'static str, &str); 3] {
        [
            ("authorization", self.authorization.as_str()),
            ("x-amz-date", self.timestamp.as_str()),
            ("x-amz-content-sha256", self.payload_hash.as_str()),
        ]
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = Key::new(aws_lc_rs::hmac::HMAC_SHA256, key);
    let tag = aws_lc_rs::hmac::sign(&key, data);
    tag.as_ref().to_vec()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, data);
    HEXLOWER.encode(hash.as_ref())
}

fn uri_encode(input: &str) -> String {
    percent_encode(input.as_bytes(), URI_ENCODE_SET).to_string()
}

pub fn create_canonical_uri(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        // Split path and encode each segment
        path.split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn create_canonical_query_string(params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return String::new();
    }

    // Sort on the *encoded* keys; encoding can change the
    // byte ordering of the original key/value strings.
    let mut encoded_params: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    encoded_params.sort();

    encoded_params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn create_canonical_headers(headers: &BTreeMap<String, String>) -> (String, String) {
    let canonical_headers: BTreeMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
        .collect();

    let header_string = canonical_headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("\n");

    let signed_headers = canonical_headers
        .keys()
        .cloned()
        .collect::<Vec<_>>()
        .join(";");

    (header_string, signed_headers)
}

fn create_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{secret_key}").as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

pub fn sign_request(req: &SigV4Request) -> anyhow::Result<SigV4Response> {
    anyhow::ensure!(
        req.headers.keys().any(|k| k.eq_ignore_ascii_case("host")),
        "the host header must be signed"
    );

    let timestamp = req.timestamp.unwrap_or_else(Utc::now);
    let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = timestamp.format("%Y%m%d").to_string();

    let payload_hash = sha256_hex(req.payload);

    let mut headers = req.headers.clone();
    headers.insert("x-amz-date".to_string(), amz_date.clone());
    headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());

    if let Some(token) = req.session_token {
        headers.insert("x-amz-security-token".to_string(), token.to_string());
    }

    let canonical_uri = create_canonical_uri(req.uri);
    let canonical_query_string = create_canonical_query_string(&req.query_params);
    let (canonical_headers, signed_headers) = create_canonical_headers(&headers);

    // See https://docs.aws.amazon.com/general/latest/gr/sigv4-create-canonical-request.html
    // for the canonical request structure. The blank line between the
    // canonical headers and the signed headers is required.
    let canonical_request = format!(
        "{method}\n{canonical_uri}\n{canonical_query_string}\n{canonical_headers}\n\n{signed_headers}\n{payload_hash}",
        method = req.method,
    );

    let algorithm = "AWS4-HMAC-SHA256";
    let credential_scope = format!(
        "{date_stamp}/{region}/{service}/aws4_request",
        region = req.region,
        service = req.service
    );
    let canonical_request_hash = sha256_hex(canonical_request.as_bytes());

    let string_to_sign =
        format!("{algorithm}\n{amz_date}\n{credential_scope}\n{canonical_request_hash}");

    let signing_key = create_signing_key(req.secret_key, &date_stamp, req.region, req.service);
    let signature_bytes = hmac_sha256(&signing_key, string_to_sign.as_bytes());
    let signature = HEXLOWER.encode(&signature_bytes);

    let authorization = format!(
        "{algorithm} Credential={access_key}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
        access_key = req.access_key
    );

    Ok(SigV4Response {
        authorization,
        timestamp: amz_date,
        payload_hash,
        canonical_uri,
        canonical_request,
        string_to_sign,
        signature,
    })
}
