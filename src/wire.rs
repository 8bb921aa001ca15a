//! Wire format for the duplex stream.
//!
//! Every frame is a JSON envelope: a type tag naming the payload shape, a
//! header map, and the payload itself. Requests carry a `requestId` inside
//! the payload; responses echo it back, which is what the pending-request
//! table keys on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result code carried by every successful response.
pub const SUCCESS_RESULT_CODE: i32 = 200;

/// Payload type tags.
pub mod tag {
    pub const CONNECTION_SETUP: &str = "ConnectionSetupRequest";
    pub const HEALTH_CHECK_REQUEST: &str = "HealthCheckRequest";
    pub const HEALTH_CHECK_RESPONSE: &str = "HealthCheckResponse";
    pub const CONFIG_QUERY_REQUEST: &str = "ConfigQueryRequest";
    pub const CONFIG_QUERY_RESPONSE: &str = "ConfigQueryResponse";
    pub const CONFIG_BATCH_LISTEN_REQUEST: &str = "ConfigBatchListenRequest";
    pub const CONFIG_CHANGE_BATCH_LISTEN_RESPONSE: &str = "ConfigChangeBatchListenResponse";
    pub const CONFIG_CHANGE_NOTIFY_REQUEST: &str = "ConfigChangeNotifyRequest";
    pub const CLIENT_DETECTION_REQUEST: &str = "ClientDetectionRequest";
    pub const CLIENT_DETECTION_RESPONSE: &str = "ClientDetectionResponse";
}

/// Well-known header keys.
pub mod header {
    pub const ACCESS_TOKEN: &str = "accessToken";
    pub const NOTIFY: &str = "notify";
}

/// Server-assigned error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ErrorCode {
    None,
    NotFound,
    ConnectionUnregistered,
    Forbidden,
    Other(i32),
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            0 => ErrorCode::None,
            300 => ErrorCode::NotFound,
            301 => ErrorCode::ConnectionUnregistered,
            403 => ErrorCode::Forbidden,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> i32 {
        match code {
            ErrorCode::None => 0,
            ErrorCode::NotFound => 300,
            ErrorCode::ConnectionUnregistered => 301,
            ErrorCode::Forbidden => 403,
            ErrorCode::Other(other) => other,
        }
    }
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::None
    }
}

/// The frame wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl Envelope {
    pub fn new(type_name: &str, body: Value) -> Self {
        Self {
            type_name: type_name.to_string(),
            client_ip: String::new(),
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    /// Whether the tag names a response payload.
    pub fn is_response(&self) -> bool {
        self.type_name.ends_with("Response")
    }
}

/// Fresh request id for payloads that carry one.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The fields every response payload shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHead {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub result_code: i32,
    #[serde(default)]
    pub error_code: ErrorCode,
    #[serde(default)]
    pub message: Option<String>,
}

impl ResponseHead {
    pub fn success(request_id: Option<String>) -> Self {
        Self {
            request_id,
            result_code: SUCCESS_RESULT_CODE,
            error_code: ErrorCode::None,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code == SUCCESS_RESULT_CODE
    }
}

/// Capabilities announced at setup time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAbilities {
    pub config_subscription: bool,
}

impl Default for ClientAbilities {
    fn default() -> Self {
        Self { config_subscription: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSetupRequest {
    pub request_id: String,
    pub client_ip: String,
    pub client_name: String,
    pub client_version: String,
    #[serde(rename = "tenant")]
    pub namespace: String,
    #[serde(default)]
    pub abilities: ClientAbilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigQueryRequest {
    pub request_id: String,
    #[serde(rename = "tenant")]
    pub namespace: String,
    pub group: String,
    pub data_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigQueryResponse {
    #[serde(flatten)]
    pub head: ResponseHead,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
}

/// One watched entry inside a batch listen request. `md5` is the locally
/// known digest, empty when the entry was never synced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigListenContext {
    #[serde(rename = "tenant")]
    pub namespace: String,
    pub group: String,
    pub data_id: String,
    pub md5: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBatchListenRequest {
    pub request_id: String,
    /// `true` to start listening, `false` to stop.
    pub listen: bool,
    pub config_listen_contexts: Vec<ConfigListenContext>,
}

/// Server push telling us one entry changed. Content is never inlined; the
/// client re-queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChangeNotifyRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(rename = "tenant", default)]
    pub namespace: String,
    #[serde(default)]
    pub group: String,
    pub data_id: String,
}
