//! # SQS HTTP Transport
//!
//! [`SqsTransport`] speaking the SQS query API (`Version=2012-11-05`) over
//! HTTPS with AWS Signature Version 4 request signing. Responses are XML and
//! are read with `quick-xml`.
//!
//! Every action is sent as a signed `POST /` with its parameters in the query
//! string. Queue-scoped actions pass the queue URL as the `QueueUrl`
//! parameter, so a single endpoint serves all queues in a region.
//!
//! ## Example
//!
//! ```no_run
//! use queue_pump::backends::{HttpSqsTransport, SqsConnection};
//!
//! # fn example() -> Result<(), queue_pump::QueueError> {
//! let connection = SqsConnection::new("eu-west-1").with_env_credentials();
//! let transport = HttpSqsTransport::new(connection)?;
//! # Ok(())
//! # }
//! ```

use super::sqs::{ReceiveRequest, SqsTransport};
use crate::error::{ConfigurationError, QueueError};
use crate::message::{MetadataEntry, QueueName, RawMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const API_VERSION: &str = "2012-11-05";
const PROVIDER: &str = "Sqs";

// ============================================================================
// Error Types
// ============================================================================

/// Failures reported by the SQS endpoint or the HTTP layer
#[derive(Debug, thiserror::Error)]
pub enum SqsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("SQS service error {code}: {message}")]
    ServiceError { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl SqsError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::ServiceError { .. })
    }
}

impl From<SqsError> for QueueError {
    fn from(error: SqsError) -> Self {
        match error {
            SqsError::Authentication(message) => QueueError::AuthenticationFailed { message },
            SqsError::NetworkError(message) => QueueError::ConnectionFailed { message },
            SqsError::ServiceError { code, message } => QueueError::ProviderError {
                provider: PROVIDER.to_string(),
                code,
                message,
            },
            SqsError::QueueNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            SqsError::InvalidReceipt(receipt) => QueueError::InvalidReceipt { receipt },
            SqsError::ConfigurationError(message) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message })
            }
            SqsError::MalformedResponse(message) => QueueError::ProviderError {
                provider: PROVIDER.to_string(),
                code: "MalformedResponse".to_string(),
                message,
            },
        }
    }
}

// ============================================================================
// Connection Settings
// ============================================================================

/// Where and how to reach the SQS endpoint
#[derive(Clone, Default)]
pub struct SqsConnection {
    pub region: String,
    /// Overrides `https://sqs.{region}.amazonaws.com`, e.g. for a local emulator
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub request_timeout: Option<Duration>,
}

impl SqsConnection {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    /// Fill missing credentials from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
    pub fn with_env_credentials(mut self) -> Self {
        if self.access_key_id.is_none() {
            self.access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok();
        }
        if self.secret_access_key.is_none() {
            self.secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();
        }
        self
    }

    fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", self.region))
    }
}

impl fmt::Debug for SqsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsConnection")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<REDACTED>"),
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for query API requests
#[derive(Clone)]
struct RequestSigner {
    access_key: String,
    secret_key: String,
    region: String,
    service: &'static str,
}

impl RequestSigner {
    fn new(access_key: String, secret_key: String, region: String) -> Self {
        Self {
            access_key,
            secret_key,
            region,
            service: "sqs",
        }
    }

    /// Headers authorizing a request with the given (already encoded, sorted) query
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        canonical_query: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Result<Vec<(&'static str, String)>, SqsError> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let signed_headers = "host;x-amz-date";
        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm,
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp)?;

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        Ok(vec![("authorization", authorization), ("x-amz-date", amz_date)])
    }

    /// kSecret -> kDate -> kRegion -> kService -> kSigning -> signature
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> Result<String, SqsError> {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, self.service.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes())?;

        Ok(hex::encode(signature))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SqsError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| SqsError::ConfigurationError(format!("invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode and sort parameters into a canonical query string
fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k).into_owned(),
                urlencoding::encode(v).into_owned(),
            )
        })
        .collect();
    encoded.sort();

    encoded
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// SQS transport over the HTTPS query API.
pub struct HttpSqsTransport {
    http_client: HttpClient,
    signer: RequestSigner,
    endpoint: Url,
    host: String,
}

impl HttpSqsTransport {
    pub fn new(connection: SqsConnection) -> Result<Self, QueueError> {
        Ok(Self::build(connection)?)
    }

    fn build(connection: SqsConnection) -> Result<Self, SqsError> {
        if connection.region.trim().is_empty() {
            return Err(SqsError::ConfigurationError(
                "Region cannot be empty".to_string(),
            ));
        }

        let (Some(access_key), Some(secret_key)) = (
            connection.access_key_id.clone(),
            connection.secret_access_key.clone(),
        ) else {
            return Err(SqsError::Authentication(
                "No credentials configured".to_string(),
            ));
        };

        let endpoint_url = connection.endpoint_url();
        let endpoint = Url::parse(&endpoint_url).map_err(|e| {
            SqsError::ConfigurationError(format!("invalid endpoint '{}': {}", endpoint_url, e))
        })?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(SqsError::ConfigurationError(format!(
                    "endpoint '{}' has no host",
                    endpoint_url
                )))
            }
        };

        let http_client = HttpClient::builder()
            .timeout(connection.request_timeout.unwrap_or(Duration::from_secs(30)))
            .build()
            .map_err(|e| SqsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer: RequestSigner::new(access_key, secret_key, connection.region),
            endpoint,
            host,
        })
    }

    /// Send one signed query API action and return the response body
    async fn call(&self, action: &str, mut params: Vec<(String, String)>) -> Result<String, SqsError> {
        params.push(("Action".to_string(), action.to_string()));
        params.push(("Version".to_string(), API_VERSION.to_string()));

        let query = canonical_query(&params);
        let path = self.endpoint.path().to_string();
        let headers =
            self.signer
                .sign_request("POST", &self.host, &path, &query, "", &Utc::now())?;

        let mut url = self.endpoint.clone();
        url.set_query(Some(&query));

        let mut request = self.http_client.post(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::NetworkError(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                SqsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                SqsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SqsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            let error = parse_error_response(&body, status.as_u16());
            warn!(action = action, status = status.as_u16(), error = %error, "SQS request failed");
            return Err(error);
        }

        debug!(action = action, "SQS request completed");
        Ok(body)
    }
}

impl fmt::Debug for HttpSqsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSqsTransport")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.signer.region)
            .finish()
    }
}

fn param(key: impl Into<String>, value: impl Into<String>) -> (String, String) {
    (key.into(), value.into())
}

#[async_trait]
impl SqsTransport for HttpSqsTransport {
    async fn create_queue(&self, queue_name: &QueueName) -> Result<String, QueueError> {
        let body = self
            .call("CreateQueue", vec![param("QueueName", queue_name.as_str())])
            .await?;
        Ok(parse_single_value(&body, "QueueUrl")?)
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, QueueError> {
        let body = self
            .call(
                "GetQueueAttributes",
                vec![param("QueueUrl", queue_url), param("AttributeName.1", "All")],
            )
            .await?;
        Ok(parse_queue_attributes(&body)?)
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), QueueError> {
        let mut params = vec![param("QueueUrl", queue_url)];
        for (index, (name, value)) in attributes.iter().enumerate() {
            let n = index + 1;
            params.push(param(format!("Attribute.{}.Name", n), name.as_str()));
            params.push(param(format!("Attribute.{}.Value", n), value.as_str()));
        }

        self.call("SetQueueAttributes", params).await?;
        Ok(())
    }

    async fn receive_messages(
        &self,
        request: &ReceiveRequest,
    ) -> Result<Vec<RawMessage>, QueueError> {
        let mut params = vec![
            param("QueueUrl", request.queue_url.as_str()),
            param("MaxNumberOfMessages", request.max_messages.to_string()),
            param("WaitTimeSeconds", request.wait_time_seconds.to_string()),
        ];
        for (index, name) in request.attribute_names.iter().enumerate() {
            params.push(param(format!("AttributeName.{}", index + 1), name.as_str()));
        }
        for (index, name) in request.message_attribute_names.iter().enumerate() {
            params.push(param(
                format!("MessageAttributeName.{}", index + 1),
                name.as_str(),
            ));
        }

        let body = self.call("ReceiveMessage", params).await?;
        Ok(parse_receive_message_response(&body)?)
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError> {
        self.call(
            "DeleteMessage",
            vec![
                param("QueueUrl", queue_url),
                param("ReceiptHandle", receipt_handle),
            ],
        )
        .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: &[MetadataEntry],
    ) -> Result<String, QueueError> {
        let mut params = vec![param("QueueUrl", queue_url), param("MessageBody", body)];
        for (index, entry) in attributes.iter().enumerate() {
            let prefix = format!("MessageAttribute.{}", index + 1);
            params.push(param(format!("{}.Name", prefix), entry.key.as_str()));
            params.push(param(format!("{}.Value.DataType", prefix), "String"));
            params.push(param(
                format!("{}.Value.StringValue", prefix),
                entry.value.as_str(),
            ));
        }

        let response = self.call("SendMessage", params).await?;
        Ok(parse_single_value(&response, "MessageId")?)
    }
}

// ============================================================================
// XML Response Parsing
// ============================================================================

fn xml_error(e: impl fmt::Display) -> SqsError {
    SqsError::MalformedResponse(format!("XML parsing error: {}", e))
}

/// Text of the first element named `element`
fn parse_single_value(xml: &str, element: &str) -> Result<String, SqsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == element.as_bytes() => {
                inside = true;
            }
            Ok(Event::Text(e)) if inside => {
                return e.unescape().map(|s| s.into_owned()).map_err(xml_error);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Err(SqsError::MalformedResponse(format!(
        "{} not found in response",
        element
    )))
}

/// `<Attribute><Name>..</Name><Value>..</Value></Attribute>` pairs
fn parse_queue_attributes(xml: &str) -> Result<HashMap<String, String>, SqsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut name: Option<String> = None;
    let mut attributes = HashMap::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(xml_error)?.into_owned();
                let tail: Vec<&str> = path.iter().map(String::as_str).collect();
                match tail.as_slice() {
                    [.., "Attribute", "Name"] => name = Some(text),
                    [.., "Attribute", "Value"] => {
                        if let Some(name) = name.take() {
                            attributes.insert(name, text);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(attributes)
}

/// Messages of a `ReceiveMessageResponse`, with system and string message attributes
fn parse_receive_message_response(xml: &str) -> Result<Vec<RawMessage>, SqsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut messages = Vec::new();
    let mut current: Option<RawMessage> = None;
    let mut attribute_name: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "Message" {
                    current = Some(RawMessage::default());
                }
                path.push(name);
            }
            Ok(Event::End(e)) => {
                path.pop();
                if e.name().as_ref() == b"Message" {
                    if let Some(message) = current.take() {
                        messages.push(message);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(xml_error)?.into_owned();
                if let Some(message) = current.as_mut() {
                    let tail: Vec<&str> = path.iter().map(String::as_str).collect();
                    match tail.as_slice() {
                        [.., "Message", "MessageId"] => message.message_id = text,
                        [.., "Message", "ReceiptHandle"] => message.receipt_handle = text,
                        [.., "Message", "Body"] => message.body = text,
                        [.., "Attribute", "Name"] | [.., "MessageAttribute", "Name"] => {
                            attribute_name = Some(text)
                        }
                        [.., "Attribute", "Value"] => {
                            if let Some(name) = attribute_name.take() {
                                message.attributes.insert(name, text);
                            }
                        }
                        [.., "MessageAttribute", "Value", "StringValue"] => {
                            if let Some(name) = attribute_name.take() {
                                message.message_attributes.insert(name, text);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

/// Map an `<ErrorResponse>` body to an [`SqsError`]
fn parse_error_response(xml: &str, status_code: u16) -> SqsError {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut code = None;
    let mut message = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(e)) => {
                let tail: Vec<&str> = path.iter().map(String::as_str).collect();
                match tail.as_slice() {
                    [.., "Error", "Code"] => code = e.unescape().ok().map(|s| s.into_owned()),
                    [.., "Error", "Message"] => {
                        message = e.unescape().ok().map(|s| s.into_owned())
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    let code = code.unwrap_or_else(|| "Unknown".to_string());
    let message = message.unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            SqsError::QueueNotFound(message)
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => SqsError::InvalidReceipt(message),
        _ if status_code == 401 || status_code == 403 => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        _ => SqsError::ServiceError { code, message },
    }
}

#[cfg(test)]
#[path = "sqs_http_tests.rs"]
mod tests;
