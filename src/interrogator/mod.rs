//! Multi-turn streaming LLM driver.
//!
//! One `chat` call runs up to `max_additional_turns + 1` model turns. Each
//! turn streams tokens out as `chunk` events while feeding the same bytes
//! through the lenient JSON accumulator; when the turn had tools attached
//! and the accumulated envelope asks for them, the loop dispatches the
//! calls, appends their results to the running history, and re-enters.
//! Tool failures become string results for the model, never loop errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::jsonstream::{JsonStreamEvent, JsonStreamOptions, LenientJsonStream, parse_lenient};
use crate::llm::{
    ChatMessage, ChatOptions, ChatRequest, LanguageModel, Role, StreamDelta, ToolCall,
    estimate_tokens,
};
use crate::tools::{ToolRegistry, USE_TOOLS_INTENTION};

/// Upper bound on `max_additional_turns`
pub const MAX_TURNS: u32 = 50;

/// Events emitted over one `chat` call, in order of occurrence
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatEvent {
    /// Raw text delta from the model
    Chunk { text: String },
    /// First top-level `{` seen this turn; payload is the preamble before it
    N1 { preamble: String },
    /// Second top-level `{` seen this turn
    N2,
    /// Incremental partial JSON
    Snapshot { value: Value },
    /// Final JSON of a tool-watching turn
    Structured { value: Value },
    /// Tool invocation beginning
    Call {
        id: String,
        name: String,
        arguments: Value,
    },
    /// Tool result
    Return {
        id: String,
        name: String,
        result: String,
    },
    /// Message appended to the running history
    InjectHistory { message: ChatMessage },
    /// Final history, emitted on the last turn
    History { messages: Vec<ChatMessage> },
    Error { message: String },
}

/// Per-call parameters
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub model: String,
    pub options: ChatOptions,
    /// Extra turns allowed beyond the first; 0..=50
    pub max_additional_turns: u32,
    /// Tool the caller requires the model to invoke
    pub pinned_tool: Option<String>,
}

/// The multi-turn driver; cheap to clone per request
#[derive(Clone)]
pub struct InterrogatorLoop {
    llm: Arc<dyn LanguageModel>,
    registry: ToolRegistry,
    context_window_tokens: usize,
}

impl InterrogatorLoop {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        registry: ToolRegistry,
        context_window_tokens: usize,
    ) -> Self {
        Self {
            llm,
            registry,
            context_window_tokens,
        }
    }

    /// Start a chat and return its event stream.
    ///
    /// Events for turn k are fully emitted before any event of turn k+1.
    pub fn chat(
        &self,
        params: ChatParams,
        initial_messages: Vec<ChatMessage>,
    ) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel::<ChatEvent>(64);
        let this = self.clone();
        tokio::spawn(async move {
            if params.max_additional_turns > MAX_TURNS {
                let _ = tx
                    .send(ChatEvent::Error {
                        message: format!(
                            "max_additional_turns must be 0..={MAX_TURNS}, got {}",
                            params.max_additional_turns
                        ),
                    })
                    .await;
                return;
            }
            this.run(params, initial_messages, tx).await;
        });
        rx
    }

    async fn run(
        &self,
        params: ChatParams,
        base_messages: Vec<ChatMessage>,
        tx: mpsc::Sender<ChatEvent>,
    ) {
        let caps = self.llm.capabilities(&params.model);
        let mut tail: Vec<ChatMessage> = Vec::new();
        // The base turn plus the allowed additional ones.
        let mut turns_left = params.max_additional_turns + 1;

        loop {
            // The last turn never gets tools, so the model must answer.
            let tools_this_turn = !self.registry.is_empty() && turns_left > 1;
            let software_fc =
                tools_this_turn && !caps.native_function_calling && caps.system_prompt;

            let mut messages = Vec::new();
            if software_fc {
                messages.push(ChatMessage::system(
                    self.registry.teaching_prompt(params.pinned_tool.as_deref()),
                ));
            }
            let budget = self
                .context_window_tokens
                .saturating_sub(params.options.max_tokens as usize);
            messages.extend(trim_messages(&base_messages, budget));
            messages.extend(tail.iter().cloned());

            let request = ChatRequest {
                model: params.model.clone(),
                messages,
                options: params.options.clone(),
                tools: if tools_this_turn && caps.native_function_calling {
                    self.registry.descriptors()
                } else {
                    Vec::new()
                },
            };

            let mut stream = match self.llm.stream_chat(request).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(ChatEvent::Error { message: e.to_string() }).await;
                    return;
                }
            };

            let mut parser = LenientJsonStream::new(JsonStreamOptions::default());
            let mut native_calls: BTreeMap<usize, (Option<String>, String, String)> =
                BTreeMap::new();
            let mut stream_failed = false;

            while let Some(delta) = stream.next().await {
                match delta {
                    Ok(StreamDelta::Content(text)) => {
                        if tx.send(ChatEvent::Chunk { text: text.clone() }).await.is_err() {
                            return;
                        }
                        for event in parser.push(&text) {
                            if forward_parser_event(&tx, event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(StreamDelta::ToolCall(tc)) => {
                        let entry = native_calls
                            .entry(tc.index)
                            .or_insert_with(|| (None, String::new(), String::new()));
                        if let Some(id) = tc.id {
                            entry.0 = Some(id);
                        }
                        if let Some(name) = tc.name {
                            entry.1 = name;
                        }
                        entry.2.push_str(&tc.arguments_fragment);
                    }
                    Err(e) => {
                        stream_failed = true;
                        let _ = tx.send(ChatEvent::Error { message: e.to_string() }).await;
                        break;
                    }
                }
            }

            // Flush the accumulator even on failure so its state is settled.
            let final_value = parser.finish().into_iter().find_map(|e| match e {
                JsonStreamEvent::Final(v) => Some(v),
                _ => None,
            });
            if stream_failed {
                return;
            }

            if tools_this_turn
                && let Some(value) = &final_value
                && tx
                    .send(ChatEvent::Structured {
                        value: value.clone(),
                    })
                    .await
                    .is_err()
            {
                return;
            }

            // Collect this turn's tool calls: native channel first, then the
            // pseudo-function-calling envelope.
            let mut calls: Vec<ToolCall> = native_calls
                .into_values()
                .filter(|(_, name, _)| !name.is_empty())
                .map(|(id, name, args)| ToolCall {
                    id: id.unwrap_or_else(|| format!("call-{}", uuid::Uuid::new_v4())),
                    name,
                    arguments: parse_lenient(&args).unwrap_or(Value::Null),
                })
                .collect();

            if calls.is_empty()
                && software_fc
                && let Some(value) = &final_value
                && value.get("intention").and_then(Value::as_str) == Some(USE_TOOLS_INTENTION)
                && let Some(entries) = value.get("tools").and_then(Value::as_array)
            {
                // The envelope is the assistant's whole reply; record it so
                // the next turn sees what was asked for.
                let assistant = ChatMessage::assistant(value.to_string());
                tail.push(assistant.clone());
                if tx
                    .send(ChatEvent::InjectHistory { message: assistant })
                    .await
                    .is_err()
                {
                    return;
                }
                for entry in entries {
                    let Some(name) = entry.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    calls.push(ToolCall {
                        id: entry
                            .get("id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("call-{}", uuid::Uuid::new_v4())),
                        name: name.to_string(),
                        arguments: entry.get("arguments").cloned().unwrap_or(Value::Null),
                    });
                }
            }

            let any_tool_called = !calls.is_empty();
            for call in calls {
                if self.dispatch(&call, &mut tail, &tx).await.is_err() {
                    return;
                }
            }

            if any_tool_called {
                turns_left -= 1;
                if turns_left == 0 {
                    // Turn budget exhausted: a normal terminal.
                    debug!("turn cap reached");
                    let _ = tx
                        .send(ChatEvent::History {
                            messages: full_history(&base_messages, &tail),
                        })
                        .await;
                    return;
                }
                continue;
            }

            let _ = tx
                .send(ChatEvent::History {
                    messages: full_history(&base_messages, &tail),
                })
                .await;
            return;
        }
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        tail: &mut Vec<ChatMessage>,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<(), ()> {
        tx.send(ChatEvent::Call {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        })
        .await
        .map_err(|_| ())?;

        let result = match self.registry.get(&call.name) {
            Some(tool) => match tool.invoke(call.arguments.clone()).await {
                Ok(output) => output,
                // Execution failures go back to the model as text.
                Err(e) => {
                    warn!(tool = %call.name, "tool failed: {e}");
                    format!("Error: {e}")
                }
            },
            None => format!("Error: no such tool: {}", call.name),
        };

        tx.send(ChatEvent::Return {
            id: call.id.clone(),
            name: call.name.clone(),
            result: result.clone(),
        })
        .await
        .map_err(|_| ())?;

        let message = if call.id.is_empty() {
            ChatMessage::function(call.name.clone(), result)
        } else {
            ChatMessage::tool(call.id.clone(), result)
        };
        tail.push(message.clone());
        tx.send(ChatEvent::InjectHistory { message })
            .await
            .map_err(|_| ())?;
        Ok(())
    }
}

async fn forward_parser_event(
    tx: &mpsc::Sender<ChatEvent>,
    event: JsonStreamEvent,
) -> Result<(), ()> {
    let event = match event {
        JsonStreamEvent::FirstObject { preamble } => ChatEvent::N1 { preamble },
        JsonStreamEvent::SecondObject => ChatEvent::N2,
        JsonStreamEvent::Snapshot(value) => ChatEvent::Snapshot { value },
        // Finals are handled at end of turn.
        JsonStreamEvent::Final(_) => return Ok(()),
    };
    tx.send(event).await.map_err(|_| ())
}

/// Drop the oldest non-system messages until the estimate fits the budget
fn trim_messages(messages: &[ChatMessage], budget_tokens: usize) -> Vec<ChatMessage> {
    let mut kept: Vec<ChatMessage> = messages.to_vec();
    let mut total: usize = kept.iter().map(|m| estimate_tokens(&m.content)).sum();
    while total > budget_tokens {
        let Some(pos) = kept.iter().position(|m| m.role != Role::System) else {
            break;
        };
        let removed = kept.remove(pos);
        total -= estimate_tokens(&removed.content);
    }
    kept
}

fn full_history(base: &[ChatMessage], tail: &[ChatMessage]) -> Vec<ChatMessage> {
    base.iter().chain(tail.iter()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_drops_oldest_non_system_first() {
        let messages = vec![
            ChatMessage::system("keep me"),
            ChatMessage::user("a".repeat(400)),
            ChatMessage::user("recent question"),
        ];
        let trimmed = trim_messages(&messages, 20);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].role, Role::System);
        assert_eq!(trimmed[1].content, "recent question");
    }

    #[test]
    fn events_serialize_with_wire_tags() {
        let event = ChatEvent::N1 {
            preamble: "hi ".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "n1");

        let event = ChatEvent::InjectHistory {
            message: ChatMessage::tool("T1", "out"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "injectHistory");
    }
}
