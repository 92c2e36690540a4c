use serde_json::{json, Value};

use super::models::ChatCompletionRequest;

/// Translate an inbound Chat Completions request into a `generateContent`
/// body.
///
/// System messages are coalesced in order and folded into the first user
/// message's text (a synthetic user message is created when none exists).
/// Sampling parameters are clamped to the upstream ranges and only emitted
/// when the caller supplied them, so upstream defaults stay in charge.
pub fn to_upstream_request(request: &ChatCompletionRequest) -> Value {
    let system_text: String = request
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .filter_map(|m| m.content.as_deref())
        .collect::<Vec<_>>()
        .join("\n");

    let mut contents: Vec<Value> = Vec::new();
    let mut system_folded = system_text.is_empty();

    for message in request.messages.iter().filter(|m| m.role != "system") {
        let role = match message.role.as_str() {
            "user" => "user",
            "assistant" => "model",
            "tool" => "function",
            // Unknown roles degrade to user input.
            _ => "user",
        };

        let mut parts: Vec<Value> = Vec::new();

        let mut text = message.content.clone().unwrap_or_default();
        if !system_folded && message.role == "user" {
            text = if text.is_empty() {
                system_text.clone()
            } else {
                format!("{}\n\n{}", system_text, text)
            };
            system_folded = true;
        }
        if !text.is_empty() {
            parts.push(json!({ "text": text }));
        }

        if let Some(tool_calls) = &message.tool_calls {
            for call in tool_calls {
                let args: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                parts.push(json!({
                    "functionCall": { "name": call.function.name, "args": args }
                }));
            }
        }

        if message.role == "tool" {
            let name = message.name.as_deref().unwrap_or("unknown_function");
            let content = message.content.as_deref().unwrap_or("");
            let response: Value = serde_json::from_str(content)
                .unwrap_or_else(|_| json!({ "result": content }));
            parts.push(json!({
                "functionResponse": { "name": name, "response": response }
            }));
        }

        // Every contents entry carries at least one part.
        if parts.is_empty() {
            parts.push(json!({ "text": "" }));
        }

        contents.push(json!({ "role": role, "parts": parts }));
    }

    if !system_folded {
        // System-only conversations still need a user turn.
        contents.insert(0, json!({ "role": "user", "parts": [{ "text": system_text }] }));
    }

    let mut body = json!({
        "contents": contents,
        "safetySettings": [
            { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE" },
            { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE" },
            { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE" },
            { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE" },
        ],
    });

    let mut generation_config = serde_json::Map::new();
    if let Some(temperature) = request.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature.clamp(0.0, 2.0)));
    }
    if let Some(top_p) = request.top_p {
        generation_config.insert("topP".to_string(), json!(top_p.clamp(0.0, 1.0)));
    }
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(stop) = &request.stop {
        let sequences = match stop {
            Value::String(s) => json!([s]),
            Value::Array(_) => stop.clone(),
            _ => json!([]),
        };
        generation_config.insert("stopSequences".to_string(), sequences);
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }

    if let Some(tools) = &request.tools {
        let declarations: Vec<Value> = tools
            .iter()
            .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("function"))
            .filter_map(|t| t.get("function").cloned())
            .collect();
        if !declarations.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
    }

    body
}
