//! LLM Oracle Adapter (C2) — calls a named oracle with a typed structured
//! schema, validates the reply, and retries on schema failure.
//!
//! Grounded on the teacher's `agent/provider.rs` (`LLMProvider` trait,
//! `OpenAICompatibleProvider`'s reqwest POST + bearer-auth shape, and the
//! `GLOBAL_HW_LOCK`/per-route mutex pattern) and on
//! `original_source/llm_gateway/llm_gateway.py::call` (schema-in-system-
//! message, retry loop appending a system message naming the previous
//! validation error, `sequential` per-route global lock).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
}

/// Static binding for one oracle name: model, endpoint, and whether calls
/// to it must serialize globally (spec §4.2's "sequential" route flag).
#[derive(Debug, Clone)]
pub struct OracleRoute {
    pub name: String,
    pub model: String,
    pub base_url: String,
    pub endpoint: String,
    pub api_key_env: Option<String>,
    pub enforce_json_schema: bool,
    pub sequential: bool,
    pub max_retries: u32,
    pub timeout_s: u64,
}

impl OracleRoute {
    pub fn new(name: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            base_url: base_url.into(),
            endpoint: "/chat/completions".to_string(),
            api_key_env: None,
            enforce_json_schema: true,
            sequential: false,
            max_retries: 2,
            timeout_s: 30,
        }
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }
}

/// Thin HTTP transport seam so tests can substitute a fake without a
/// network. Mirrors `agent/provider.rs`'s use of `reqwest::Client` behind a
/// trait boundary (there: `LLMProvider`; here: the raw POST call only).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(&self, url: &str, body: Value, headers: Vec<(String, String)>) -> anyhow::Result<(u16, Value)>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: Value, headers: Vec<(String, String)>) -> anyhow::Result<(u16, Value)> {
        let mut request = self.client.post(url).json(&body);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let parsed: Value = response.json().await.unwrap_or(Value::Null);
        Ok((status, parsed))
    }
}

/// The registry of oracle routes bound at startup (Design Note: "Runtime
/// registry of oracles" → typed dependency bag, not a global mutable map).
pub struct OracleAdapter {
    routes: HashMap<String, OracleRoute>,
    transport: Arc<dyn Transport>,
    route_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OracleAdapter {
    pub fn new(routes: Vec<OracleRoute>, transport: Arc<dyn Transport>) -> Self {
        let routes = routes.into_iter().map(|r| (r.name.clone(), r)).collect();
        Self {
            routes,
            transport,
            route_locks: Mutex::new(HashMap::new()),
        }
    }

    fn route(&self, oracle_name: &str) -> EngineResult<&OracleRoute> {
        self.routes
            .get(oracle_name)
            .ok_or_else(|| EngineError::ConfigError(format!("oracle not bound in registry: {oracle_name}")))
    }

    async fn lock_for(&self, oracle_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.route_locks.lock().await;
        locks
            .entry(oracle_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Call `oracle_name` and validate the reply against `T`'s JSON schema,
    /// retrying `route.max_retries` additional times on validation failure.
    pub async fn call<T>(
        &self,
        oracle_name: &str,
        system_messages: Vec<String>,
        user_messages: Vec<String>,
    ) -> EngineResult<T>
    where
        T: DeserializeOwned + JsonSchema + Serialize,
    {
        let route = self.route(oracle_name)?.clone();

        if route.sequential {
            let lock = self.lock_for(oracle_name).await;
            let _guard = lock.lock().await;
            self.execute::<T>(&route, system_messages, user_messages).await
        } else {
            self.execute::<T>(&route, system_messages, user_messages).await
        }
    }

    async fn execute<T>(
        &self,
        route: &OracleRoute,
        system_messages: Vec<String>,
        user_messages: Vec<String>,
    ) -> EngineResult<T>
    where
        T: DeserializeOwned + JsonSchema + Serialize,
    {
        let mut base_messages: Vec<ChatMessage> = Vec::new();
        if route.enforce_json_schema {
            let schema = schemars::schema_for!(T);
            let schema_json = serde_json::to_string_pretty(&schema).unwrap_or_default();
            base_messages.push(ChatMessage::system(format!(
                "Reply with a single JSON object matching this schema:\n{schema_json}"
            )));
        }
        for s in system_messages {
            base_messages.push(ChatMessage::system(s));
        }
        for u in user_messages {
            base_messages.push(ChatMessage::user(u));
        }

        let attempts = route.max_retries + 1;
        let mut last_error: Option<String> = None;

        for attempt in 0..attempts {
            let mut messages = base_messages.clone();
            if attempt > 0 {
                messages.push(ChatMessage::system(format!(
                    "Your previous reply failed schema validation: {}. Reply again with a single corrected JSON object.",
                    last_error.clone().unwrap_or_default()
                )));
            }

            info!(oracle = %route.name, model = %route.model, attempt = attempt + 1, attempts, "oracle request send");

            let payload = serde_json::json!({
                "model": route.model,
                "messages": messages.iter().map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content})).collect::<Vec<_>>(),
            });

            let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
            if let Some(env) = &route.api_key_env {
                if let Ok(key) = std::env::var(env) {
                    headers.push(("Authorization".to_string(), format!("Bearer {key}")));
                }
            }

            let url = format!("{}{}", route.base_url.trim_end_matches('/'), route.endpoint);
            let (status, body) = self
                .transport
                .post_json(&url, payload, headers)
                .await
                .map_err(|source| EngineError::LLMTransportError { oracle: route.name.clone(), source })?;

            if status >= 400 {
                return Err(EngineError::LLMTransportError {
                    oracle: route.name.clone(),
                    source: anyhow::anyhow!("oracle returned HTTP {status}"),
                });
            }

            let content = extract_content(&body);
            let stripped = strip_markdown_fences(&content);

            match serde_json::from_str::<T>(&stripped) {
                Ok(value) => {
                    info!(oracle = %route.name, attempt = attempt + 1, "oracle request ok");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(oracle = %route.name, attempt = attempt + 1, error = %e, "oracle schema validation failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(EngineError::LLMSchemaError {
            oracle: route.name.clone(),
            attempts,
            last_error: last_error.unwrap_or_else(|| "unknown validation error".to_string()),
        })
    }

    /// Thin chat variant: no schema, just text in/text out.
    pub async fn chat(&self, oracle_name: &str, messages: Vec<ChatMessage>) -> EngineResult<String> {
        let route = self.route(oracle_name)?.clone();
        let payload = serde_json::json!({
            "model": route.model,
            "messages": messages.iter().map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content})).collect::<Vec<_>>(),
        });
        let url = format!("{}{}", route.base_url.trim_end_matches('/'), route.endpoint);
        let (status, body) = self
            .transport
            .post_json(&url, payload, vec![("Content-Type".to_string(), "application/json".to_string())])
            .await
            .map_err(|source| EngineError::LLMTransportError { oracle: route.name.clone(), source })?;
        if status >= 400 {
            return Err(EngineError::LLMTransportError {
                oracle: route.name.clone(),
                source: anyhow::anyhow!("oracle returned HTTP {status}"),
            });
        }
        Ok(extract_content(&body))
    }
}

/// A single step in a sequential pipeline — the "runnable variant" spec
/// §4.2 calls for, letting an oracle call be chained with plain
/// transformation steps.
#[async_trait]
pub trait PipelineStep<In, Out>: Send + Sync {
    async fn run(&self, input: In) -> EngineResult<Out>;
}

pub struct OracleStep<'a, T> {
    adapter: &'a OracleAdapter,
    oracle_name: String,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T> OracleStep<'a, T> {
    pub fn new(adapter: &'a OracleAdapter, oracle_name: impl Into<String>) -> Self {
        Self { adapter, oracle_name: oracle_name.into(), _marker: std::marker::PhantomData }
    }
}

#[async_trait]
impl<'a, T> PipelineStep<String, T> for OracleStep<'a, T>
where
    T: DeserializeOwned + JsonSchema + Serialize + Send + Sync,
{
    async fn run(&self, input: String) -> EngineResult<T> {
        self.adapter.call(&self.oracle_name, Vec::new(), vec![input]).await
    }
}

fn extract_content(body: &Value) -> String {
    body.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|s| s.as_str())
        .unwrap_or("")
        .to_string()
}

fn strip_markdown_fences(content: &str) -> String {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        return rest.trim_end_matches("```").trim().to_string();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        return rest.trim_end_matches("```").trim().to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Greeting {
        message: String,
    }

    struct ScriptedTransport {
        replies: Vec<&'static str>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post_json(&self, _url: &str, _body: Value, _headers: Vec<(String, String)>) -> anyhow::Result<(u16, Value)> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let reply = self.replies.get(idx).copied().unwrap_or(self.replies.last().copied().unwrap());
            Ok((200, serde_json::json!({
                "choices": [{"message": {"content": reply}}]
            })))
        }
    }

    #[tokio::test]
    async fn valid_reply_parses_first_try() {
        let transport = Arc::new(ScriptedTransport {
            replies: vec![r#"{"message": "hi"}"#],
            calls: AtomicU32::new(0),
        });
        let adapter = OracleAdapter::new(
            vec![OracleRoute::new("greeter", "m", "http://x")],
            transport,
        );
        let out: Greeting = adapter.call("greeter", vec![], vec!["hello".into()]).await.unwrap();
        assert_eq!(out.message, "hi");
    }

    #[tokio::test]
    async fn strips_markdown_fence_before_parsing() {
        let transport = Arc::new(ScriptedTransport {
            replies: vec!["```json\n{\"message\": \"fenced\"}\n```"],
            calls: AtomicU32::new(0),
        });
        let adapter = OracleAdapter::new(
            vec![OracleRoute::new("greeter", "m", "http://x")],
            transport,
        );
        let out: Greeting = adapter.call("greeter", vec![], vec!["hello".into()]).await.unwrap();
        assert_eq!(out.message, "fenced");
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let transport = Arc::new(ScriptedTransport {
            replies: vec!["not json", r#"{"message": "recovered"}"#],
            calls: AtomicU32::new(0),
        });
        let adapter = OracleAdapter::new(
            vec![OracleRoute::new("greeter", "m", "http://x")],
            transport,
        );
        let out: Greeting = adapter.call("greeter", vec![], vec!["hello".into()]).await.unwrap();
        assert_eq!(out.message, "recovered");
    }

    #[tokio::test]
    async fn exhausts_retries_and_errors() {
        let transport = Arc::new(ScriptedTransport {
            replies: vec!["not json"],
            calls: AtomicU32::new(0),
        });
        let mut route = OracleRoute::new("greeter", "m", "http://x");
        route.max_retries = 1;
        let adapter = OracleAdapter::new(vec![route], transport);
        let err = adapter.call::<Greeting>("greeter", vec![], vec!["hello".into()]).await.unwrap_err();
        assert!(matches!(err, EngineError::LLMSchemaError { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn unbound_oracle_is_config_error() {
        let transport = Arc::new(ScriptedTransport { replies: vec![], calls: AtomicU32::new(0) });
        let adapter = OracleAdapter::new(vec![], transport);
        let err = adapter.call::<Greeting>("missing", vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(_)));
    }
}
