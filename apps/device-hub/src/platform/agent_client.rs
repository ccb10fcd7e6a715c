use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use super::PlatformError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<AgentErrorBody>,
}

#[derive(Debug, Deserialize)]
struct AgentErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC client for the on-device agent, reached through the forwarded
/// control port on loopback.
#[derive(Debug, Clone)]
pub struct AgentClient {
    url: String,
}

impl AgentClient {
    pub fn new(control_port: u16) -> Self {
        Self {
            url: format!("http://127.0.0.1:{control_port}/rpc"),
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, PlatformError> {
        self.call_with_timeout(method, params, CALL_TIMEOUT).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, PlatformError> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let body = json!({
            "jsonrpc": "2.0",
            "id": NEXT_ID.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let response = http_client()
            .post(&self.url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| classify(method, err))?;

        let parsed: AgentResponse = response
            .json()
            .await
            .map_err(|err| PlatformError::Agent(format!("{method}: invalid response: {err}")))?;

        match (parsed.result, parsed.error) {
            (_, Some(error)) => Err(PlatformError::Agent(format!(
                "{method}: {} (code {})",
                error.message, error.code
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }

    pub async fn is_alive(&self) -> bool {
        self.call_with_timeout("agent.status", json!({}), PROBE_TIMEOUT)
            .await
            .is_ok()
    }
}

fn classify(method: &str, err: reqwest::Error) -> PlatformError {
    if err.is_timeout() {
        PlatformError::Timeout(format!("agent call {method}"))
    } else if err.is_connect() || err.is_request() {
        PlatformError::AgentUnreachable(format!("{method}: {err}"))
    } else {
        PlatformError::Agent(format!("{method}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(10)]
    async fn closed_port_reads_as_not_alive() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = AgentClient::new(port);
        assert!(!client.is_alive().await);
        let err = client.call("io.tap", json!({})).await.unwrap_err();
        assert!(matches!(err, PlatformError::AgentUnreachable(_)));
    }
}
