use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::error::HubError;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// `None` only when the member is absent; an explicit `null` is an id.
    #[serde(
        default,
        deserialize_with = "present_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn present_id<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponse {
    Result(JsonRpcResult),
    Error(JsonRpcErrorResponse),
}

impl JsonRpcResponse {
    pub fn id(&self) -> Option<&Value> {
        match self {
            JsonRpcResponse::Result(result) => Some(&result.id),
            JsonRpcResponse::Error(error) => error.id.as_ref(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, JsonRpcResponse::Error(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResult {
    pub jsonrpc: String,
    pub id: Value,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub error: JsonRpcError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResult {
    pub fn new(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

impl JsonRpcErrorResponse {
    pub fn new(
        id: Option<Value>,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: JsonRpcError {
                code,
                message: message.into(),
                data,
            },
        }
    }
}

pub const ERROR_PARSE: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_INTERNAL: i64 = -32603;

pub const ERROR_DEVICE_NOT_FOUND: i64 = -32001;
pub const ERROR_NO_DEVICE: i64 = -32002;
pub const ERROR_AMBIGUOUS_DEVICE: i64 = -32003;
pub const ERROR_UNSUPPORTED_FORMAT: i64 = -32004;
pub const ERROR_AGENT_START_FAILED: i64 = -32010;
pub const ERROR_AGENT_UNHEALTHY: i64 = -32011;
pub const ERROR_TRANSPORT: i64 = -32012;
pub const ERROR_RESOURCE_EXHAUSTED: i64 = -32013;
pub const ERROR_SHUTTING_DOWN: i64 = -32014;
pub const ERROR_PLATFORM: i64 = -32020;

pub fn error_code(err: &HubError) -> i64 {
    match err {
        HubError::DeviceNotFound(_) => ERROR_DEVICE_NOT_FOUND,
        HubError::NoDeviceFound => ERROR_NO_DEVICE,
        HubError::AmbiguousSelection(_) => ERROR_AMBIGUOUS_DEVICE,
        HubError::UnsupportedFormat { .. } => ERROR_UNSUPPORTED_FORMAT,
        HubError::Validation(_) => ERROR_INVALID_PARAMS,
        HubError::AgentStartFailed { .. } => ERROR_AGENT_START_FAILED,
        HubError::AgentUnhealthy { .. } => ERROR_AGENT_UNHEALTHY,
        HubError::MethodNotFound(_) => ERROR_METHOD_NOT_FOUND,
        HubError::Transport(_) => ERROR_TRANSPORT,
        HubError::ResourceExhausted { .. } => ERROR_RESOURCE_EXHAUSTED,
        HubError::ShuttingDown => ERROR_SHUTTING_DOWN,
        HubError::Device { .. } | HubError::Platform(_) => ERROR_PLATFORM,
    }
}

/// Error response whose `data` names the method, the device and the cause.
pub fn hub_error(id: Option<Value>, method: &str, err: &HubError) -> JsonRpcResponse {
    let mut data = Map::new();
    data.insert("method".into(), json!(method));
    if let Some(device_id) = err.device_id() {
        data.insert("deviceId".into(), json!(device_id));
    }
    if let HubError::AmbiguousSelection(candidates) = err {
        data.insert("candidates".into(), json!(candidates));
    }
    if let Some(cause) = err.cause() {
        data.insert("cause".into(), json!(cause));
    }
    JsonRpcResponse::Error(JsonRpcErrorResponse::new(
        id,
        error_code(err),
        err.to_string(),
        Some(Value::Object(data)),
    ))
}

pub fn success(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse::Result(JsonRpcResult::new(id, result))
}

pub fn parse_error(detail: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse::Error(JsonRpcErrorResponse::new(
        None,
        ERROR_PARSE,
        "invalid json",
        Some(json!({ "cause": detail.into() })),
    ))
}

pub fn invalid_request(id: Option<Value>, detail: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse::Error(JsonRpcErrorResponse::new(
        id,
        ERROR_INVALID_REQUEST,
        "invalid request",
        Some(json!({ "cause": detail.into() })),
    ))
}

/// Decodes one inbound frame. `Err` carries the response to send back.
pub fn decode_request(raw: &str) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = serde_json::from_str(raw).map_err(|err| parse_error(err.to_string()))?;
    let id = value.get("id").cloned();
    let request: JsonRpcRequest =
        serde_json::from_value(value).map_err(|err| invalid_request(id.clone(), err.to_string()))?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(invalid_request(id, "jsonrpc version must be 2.0"));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StartStep;
    use crate::platform::PlatformError;

    #[test_timeout::timeout]
    fn malformed_json_is_a_parse_error() {
        let response = decode_request("{not json").unwrap_err();
        match response {
            JsonRpcResponse::Error(err) => {
                assert_eq!(err.error.code, ERROR_PARSE);
                assert!(err.id.is_none());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn missing_method_keeps_the_id() {
        let response = decode_request(r#"{"jsonrpc":"2.0","id":7}"#).unwrap_err();
        assert_eq!(response.id(), Some(&json!(7)));
        let JsonRpcResponse::Error(err) = response else {
            panic!("expected error");
        };
        assert_eq!(err.error.code, ERROR_INVALID_REQUEST);
    }

    #[test_timeout::timeout]
    fn wrong_version_is_rejected() {
        let response = decode_request(r#"{"jsonrpc":"1.0","id":"a","method":"server.info"}"#)
            .unwrap_err();
        assert!(response.is_error());
        assert_eq!(response.id(), Some(&json!("a")));
    }

    #[test_timeout::timeout]
    fn notifications_have_no_id() {
        let request = decode_request(r#"{"jsonrpc":"2.0","method":"server.info"}"#).unwrap();
        assert!(request.is_notification());
    }

    #[test_timeout::timeout]
    fn null_id_is_kept_apart_from_a_missing_one() {
        let request =
            decode_request(r#"{"jsonrpc":"2.0","id":null,"method":"server.info"}"#).unwrap();
        assert!(!request.is_notification());
        assert_eq!(request.id, Some(Value::Null));

        let value = serde_json::to_value(success(Value::Null, json!({}))).unwrap();
        assert!(value.as_object().unwrap().contains_key("id"));
        assert_eq!(value["id"], Value::Null);
    }

    #[test_timeout::timeout]
    fn hub_errors_carry_method_device_and_cause() {
        let err = HubError::AgentStartFailed {
            device_id: "emulator-5554".into(),
            step: StartStep::Forward,
            cause: PlatformError::Command {
                command: "adb forward".into(),
                detail: "device offline".into(),
            },
        };
        let value = serde_json::to_value(hub_error(Some(json!(3)), "device.io.tap", &err)).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["error"]["code"], ERROR_AGENT_START_FAILED);
        assert_eq!(value["error"]["data"]["method"], "device.io.tap");
        assert_eq!(value["error"]["data"]["deviceId"], "emulator-5554");
        assert!(value["error"]["data"]["cause"]
            .as_str()
            .unwrap()
            .contains("device offline"));
    }

    #[test_timeout::timeout]
    fn every_error_kind_has_a_distinct_code() {
        let errors = [
            HubError::DeviceNotFound("x".into()),
            HubError::NoDeviceFound,
            HubError::AmbiguousSelection(vec![]),
            HubError::UnsupportedFormat {
                device_id: "x".into(),
                format: "ogg".into(),
            },
            HubError::Validation("bad".into()),
            HubError::AgentUnhealthy {
                device_id: "x".into(),
                cause: "gone".into(),
            },
            HubError::MethodNotFound("nope".into()),
            HubError::Transport("closed".into()),
            HubError::ResourceExhausted { start: 1, end: 2 },
            HubError::ShuttingDown,
            HubError::Platform(PlatformError::Timeout("probe".into())),
        ];
        let mut codes: Vec<i64> = errors.iter().map(error_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
