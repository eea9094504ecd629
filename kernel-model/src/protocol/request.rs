use serde_json::{json, Map, Value};
use turnstile_kernel_config::LocalModelConfig;
use turnstile_kernel_core::TurnRequest;
use turnstile_kernel_protocol::{
    ContentKind, ContentPart, FileSearchConfig, HistoryItem, MessageItem, ToolCallItem,
    ToolDeclaration, ToolKind, ToolSpec, WebSearchConfig,
};

pub(crate) fn build_responses_request_payload(
    config: &LocalModelConfig,
    request: &TurnRequest,
) -> Value {
    let input = request
        .history
        .iter()
        .filter_map(history_item_to_input)
        .collect::<Vec<_>>();

    let mut payload = json!({
        "model": config.model,
        "stream": true,
        "input": input,
        "max_output_tokens": config.max_output_tokens,
        "parallel_tool_calls": false,
    });

    if let Some(instructions) = config
        .developer_prompt
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        payload["instructions"] = Value::String(instructions.to_string());
    }

    if !request.tools.is_empty() {
        payload["tools"] = Value::Array(request.tools.iter().map(build_responses_tool).collect());
        payload["tool_choice"] = Value::String("auto".to_string());
    }

    if request.reasoning_enabled {
        payload["reasoning"] = json!({
            "effort": config.reasoning_effort,
            "summary": config.reasoning_summary,
        });
    }

    payload
}

fn history_item_to_input(item: &HistoryItem) -> Option<Value> {
    match item {
        HistoryItem::Message(message) => message_to_input(message),
        HistoryItem::ToolCall(call) => Some(tool_call_to_input(call)),
        HistoryItem::FunctionCallOutput(output) => Some(json!({
            "type": "function_call_output",
            "call_id": output.call_id,
            "output": output.output,
            "status": output.status,
        })),
    }
}

/// Messages whose content renders to nothing are dropped; the API rejects
/// empty content arrays.
fn message_to_input(message: &MessageItem) -> Option<Value> {
    let content = message
        .content
        .iter()
        .filter_map(content_part_to_input)
        .collect::<Vec<_>>();
    if content.is_empty() {
        return None;
    }
    let mut value = json!({
        "type": "message",
        "role": message.role,
        "content": content,
    });
    if let Some(id) = message.id.as_deref().filter(|id| !id.is_empty()) {
        value["id"] = Value::String(id.to_string());
    }
    Some(value)
}

fn content_part_to_input(part: &ContentPart) -> Option<Value> {
    match part.kind {
        ContentKind::InputText if !part.text.is_empty() => Some(json!({
            "type": "input_text",
            "text": part.text,
        })),
        ContentKind::OutputText => Some(json!({
            "type": "output_text",
            "text": part.text,
            "annotations": part.annotations,
        })),
        ContentKind::Refusal => Some(json!({
            "type": "refusal",
            "refusal": part.text,
        })),
        ContentKind::InputText | ContentKind::OutputAudio => None,
    }
}

fn tool_call_to_input(call: &ToolCallItem) -> Value {
    match call.tool_type {
        ToolKind::FunctionCall => json!({
            "type": "function_call",
            "id": call.id,
            "call_id": call.call_id.as_deref().unwrap_or(call.id.as_str()),
            "name": call.name.as_deref().unwrap_or_default(),
            "arguments": call.arguments,
        }),
        ToolKind::WebSearchCall => json!({
            "type": "web_search_call",
            "id": call.id,
            "status": call.status,
        }),
        ToolKind::FileSearchCall => json!({
            "type": "file_search_call",
            "id": call.id,
            "status": call.status,
        }),
    }
}

fn build_responses_tool(tool: &ToolDeclaration) -> Value {
    match tool {
        ToolDeclaration::Function(spec) => function_tool(spec),
        ToolDeclaration::WebSearch(config) => web_search_tool(config),
        ToolDeclaration::FileSearch(config) => file_search_tool(config),
    }
}

fn function_tool(spec: &ToolSpec) -> Value {
    let description = spec
        .description
        .as_ref()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .unwrap_or_else(|| format!("Execute tool {}", spec.name));
    let parameters = spec
        .input_schema
        .clone()
        .unwrap_or_else(|| json!({ "type": "object", "additionalProperties": true }));

    json!({
        "type": "function",
        "name": spec.name,
        "description": description,
        "parameters": parameters,
    })
}

fn web_search_tool(config: &WebSearchConfig) -> Value {
    let mut tool = json!({ "type": "web_search_preview" });
    if let Some(location) = config.user_location.as_ref() {
        let mut rendered = Map::new();
        rendered.insert("type".to_string(), Value::String("approximate".to_string()));
        for (key, value) in [
            ("country", location.country.as_ref()),
            ("city", location.city.as_ref()),
            ("region", location.region.as_ref()),
        ] {
            if let Some(value) = value.map(|value| value.trim()).filter(|value| !value.is_empty()) {
                rendered.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
        tool["user_location"] = Value::Object(rendered);
    }
    tool
}

fn file_search_tool(config: &FileSearchConfig) -> Value {
    json!({
        "type": "file_search",
        "vector_store_ids": config.vector_store_ids,
    })
}
