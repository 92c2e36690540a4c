use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::models::{ChatCompletionResponse, Choice, ResponseMessage, ToolCall, ToolFunction, Usage};
use crate::model_mapping::to_inbound_model;

/// Returned as the sole choice when the upstream answer carries no
/// candidates (typically a safety block).
pub const EMPTY_CANDIDATES_MESSAGE: &str =
    "I'm sorry, but I can't provide a response to that request.";

pub fn map_finish_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| {
        match r {
            "STOP" => "stop",
            "MAX_TOKENS" => "length",
            "SAFETY" | "RECITATION" => "content_filter",
            "OTHER" => "stop",
            _ => "stop",
        }
        .to_string()
    })
}

pub(crate) fn concat_text_parts(candidate: &Value) -> String {
    candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn extract_tool_calls(candidate: &Value) -> Vec<ToolCall> {
    candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("functionCall"))
                .map(|call| ToolCall {
                    id: format!("call_{}", Uuid::new_v4().simple()),
                    r#type: "function".to_string(),
                    function: ToolFunction {
                        name: call
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        arguments: call
                            .get("args")
                            .map(|a| a.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

fn extract_usage(upstream: &Value) -> Option<Usage> {
    let metadata = upstream.get("usageMetadata")?;
    let field = |name: &str| metadata.get(name).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    Some(Usage {
        prompt_tokens: field("promptTokenCount"),
        completion_tokens: field("candidatesTokenCount"),
        total_tokens: field("totalTokenCount"),
    })
}

/// Translate a buffered `generateContent` response into a Chat Completions
/// response for the caller's model alias.
pub fn to_chat_response(upstream: &Value, inbound_model: &str) -> ChatCompletionResponse {
    let candidates = upstream
        .get("candidates")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    let choices: Vec<Choice> = if candidates.is_empty() {
        vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: Some(EMPTY_CANDIDATES_MESSAGE.to_string()),
                tool_calls: None,
            },
            finish_reason: Some("content_filter".to_string()),
        }]
    } else {
        candidates
            .iter()
            .enumerate()
            .map(|(position, candidate)| {
                let text = concat_text_parts(candidate);
                let tool_calls = extract_tool_calls(candidate);
                let content = if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(text)
                };
                Choice {
                    index: candidate
                        .get("index")
                        .and_then(|i| i.as_u64())
                        .unwrap_or(position as u64) as u32,
                    message: ResponseMessage {
                        role: "assistant".to_string(),
                        content,
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    },
                    finish_reason: map_finish_reason(
                        candidate.get("finishReason").and_then(|r| r.as_str()),
                    ),
                }
            })
            .collect()
    };

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp() as u64,
        model: to_inbound_model(inbound_model).to_string(),
        choices,
        usage: extract_usage(upstream),
    }
}
