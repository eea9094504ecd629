use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;

use crate::ModelError;

/// Posts a streaming responses request. On success the response is handed
/// back unread so the caller can consume the body as an SSE stream.
pub(crate) async fn send_responses_http(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    payload: &Value,
) -> Result<reqwest::Response, ModelError> {
    let endpoint = format!("{}/v1/responses", base_url.trim_end_matches('/'));
    let response = client
        .post(endpoint)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCEPT, "text/event-stream")
        .header("OpenAI-Beta", "responses=experimental")
        .bearer_auth(api_key)
        .json(payload)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.bytes().await?;
        return Err(ModelError::HttpStatus {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).to_string(),
        });
    }

    Ok(response)
}

pub(crate) async fn post_tool_execution(
    client: &reqwest::Client,
    daemon_url: &str,
    payload: &Value,
) -> Result<(reqwest::StatusCode, Vec<u8>), reqwest::Error> {
    let endpoint = format!("{}/api/v1/tools/execute", daemon_url.trim_end_matches('/'));
    let response = client
        .post(endpoint)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCEPT, "application/json")
        .json(payload)
        .send()
        .await?;
    let status = response.status();
    let body = response.bytes().await?;
    Ok((status, body.to_vec()))
}
