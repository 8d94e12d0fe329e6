//! OpenAI-compatible streaming chat client.
//!
//! Speaks the `chat/completions` SSE protocol over reqwest. Works against
//! any compatible server; which models get the native function-calling
//! channel is decided by prefix and overridable in deployment config.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{ReaderError, Result};

use super::{
    ChatRequest, LanguageModel, ModelCapabilities, Role, StreamDelta, ToolCallDelta,
};

/// Client for an OpenAI-compatible completions endpoint
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    /// Model-id prefixes assumed to support native function calling
    native_fc_prefixes: Vec<String>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            native_fc_prefixes: vec!["gpt-".to_string()],
        }
    }

    pub fn with_native_fc_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.native_fc_prefixes = prefixes;
        self
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut msg = json!({
                    "role": role_str(m.role),
                    "content": m.content,
                });
                if let Some(name) = &m.name {
                    msg["name"] = json!(name);
                }
                if let Some(id) = &m.tool_call_id {
                    msg["tool_call_id"] = json!(id);
                }
                msg
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
            "max_tokens": request.options.max_tokens,
        });
        if let Some(t) = request.options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.options.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = request.options.top_k {
            body["top_k"] = json!(k);
        }
        if let Some(stop) = &request.options.stop {
            body["stop"] = json!(stop);
        }
        if let Some(seed) = request.options.seed {
            body["seed"] = json!(seed);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }
        body
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
        Role::Function => "function",
    }
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: ChunkFunction,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    fn capabilities(&self, model: &str) -> ModelCapabilities {
        ModelCapabilities {
            native_function_calling: self
                .native_fc_prefixes
                .iter()
                .any(|p| model.starts_with(p.as_str())),
            system_prompt: true,
        }
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        debug!(model = %request.model, %url, "opening completion stream");

        let mut builder = self.http.post(&url).json(&self.body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ReaderError::UpstreamModelFailure(format!("request: {e}")))?;
        let response = response
            .error_for_status()
            .map_err(|e| ReaderError::UpstreamModelFailure(format!("status: {e}")))?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
                futures::future::ready(!done)
            })
            .flat_map(|event| {
                let deltas: Vec<Result<StreamDelta>> = match event {
                    Ok(event) => match serde_json::from_str::<ChunkResponse>(&event.data) {
                        Ok(chunk) => chunk
                            .choices
                            .into_iter()
                            .flat_map(|choice| {
                                let mut out = Vec::new();
                                if let Some(content) = choice.delta.content
                                    && !content.is_empty()
                                {
                                    out.push(Ok(StreamDelta::Content(content)));
                                }
                                for call in choice.delta.tool_calls {
                                    out.push(Ok(StreamDelta::ToolCall(ToolCallDelta {
                                        index: call.index,
                                        id: call.id,
                                        name: call.function.name,
                                        arguments_fragment: call
                                            .function
                                            .arguments
                                            .unwrap_or_default(),
                                    })));
                                }
                                out
                            })
                            .collect(),
                        // Keep-alives and vendor extras are not fatal
                        Err(_) => Vec::new(),
                    },
                    Err(e) => vec![Err(ReaderError::UpstreamModelFailure(format!(
                        "stream: {e}"
                    )))],
                };
                futures::stream::iter(deltas)
            });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, ChatOptions};

    fn request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            messages: vec![ChatMessage::user("What is the title?")],
            options: ChatOptions::default(),
            tools: Vec::new(),
        }
    }

    #[test]
    fn capability_split_follows_model_prefix() {
        let client = OpenAiClient::new("http://localhost", None);
        assert!(client.capabilities("gpt-3.5-turbo").native_function_calling);
        assert!(!client.capabilities("mistral-7b").native_function_calling);
    }

    #[tokio::test]
    async fn streams_content_deltas_from_sse_body() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Example\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" Domain\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = OpenAiClient::new(server.url(), None);
        let mut stream = client.stream_chat(request("gpt-3.5-turbo")).await.unwrap();
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            if let StreamDelta::Content(c) = delta.unwrap() {
                text.push_str(&c);
            }
        }
        assert_eq!(text, "Example Domain");
    }

    #[tokio::test]
    async fn streams_native_tool_call_fragments() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"T1\",\"function\":{\"name\":\"browse\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"url\\\":\\\"https://a.test\\\"}\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = OpenAiClient::new(server.url(), None);
        let mut stream = client.stream_chat(request("gpt-4")).await.unwrap();
        let mut fragments = Vec::new();
        while let Some(delta) = stream.next().await {
            if let StreamDelta::ToolCall(tc) = delta.unwrap() {
                fragments.push(tc);
            }
        }
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].id.as_deref(), Some("T1"));
        assert_eq!(fragments[0].name.as_deref(), Some("browse"));
        assert_eq!(
            fragments[1].arguments_fragment,
            "{\"url\":\"https://a.test\"}"
        );
    }

    #[tokio::test]
    async fn upstream_error_status_maps_to_model_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .create_async()
            .await;
        let client = OpenAiClient::new(server.url(), None);
        let err = match client.stream_chat(request("gpt-4")).await {
            Err(err) => err,
            Ok(_) => panic!("expected stream_chat to fail"),
        };
        assert_eq!(err.code(), "UpstreamModelFailure");
    }
}
