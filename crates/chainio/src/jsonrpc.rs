//! Minimal JSON-RPC-over-HTTP core shared by the daemon clients.

use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::{ClientError, ClientResult};

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone)]
pub(crate) struct JsonRpcClient {
    url: String,
    version: &'static str,
    client: reqwest::Client,
}

impl JsonRpcClient {
    pub(crate) fn new(
        url: String,
        version: &'static str,
        auth: Option<(&str, &str)>,
    ) -> ClientResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some((user, pass)) = auth {
            let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            let value = HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            url,
            version,
            client,
        })
    }

    /// Calls a method whose result may legitimately be `null`.
    pub(crate) async fn call_opt<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> ClientResult<Option<T>> {
        let body = json!({
            "jsonrpc": self.version,
            "id": method,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let resp: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if let Some(err) = resp.error {
            return Err(ClientError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp.result)
    }

    pub(crate) async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> ClientResult<T> {
        self.call_opt(method, params)
            .await?
            .ok_or_else(|| ClientError::Decode(format!("{method}: missing result")))
    }
}
