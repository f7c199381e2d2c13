//! REST client for the Vapi voice API.
//!
//! Uses reqwest with Bearer token auth against `https://api.vapi.ai` unless a
//! base URL override is configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CallProvider, CreateCallRequest, ProviderCall, ProviderError};

pub const DEFAULT_BASE_URL: &str = "https://api.vapi.ai";

/// Provider limit on customer display names.
const MAX_CUSTOMER_NAME_CHARS: usize = 40;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallPayload<'a> {
    assistant_id: &'a str,
    phone_number_id: &'a str,
    customer: CustomerPayload,
}

#[derive(Debug, Serialize)]
struct CustomerPayload {
    number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedCall {
    id: String,
}

pub struct VapiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    country_code: String,
}

impl VapiClient {
    pub fn new(api_key: &str, base_url: &str, country_code: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            country_code: country_code.to_string(),
        }
    }

    fn url(&self, path: &str) -> Result<url::Url, ProviderError> {
        url::Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ProviderError::NotConfigured(format!("invalid base URL: {}", e)))
    }
}

/// Normalize a dialled number to E.164 for the given country code.
///
/// Whitespace is removed; `+0…` is treated as a national number; a leading `0`
/// or a bare digit string gets `+<country code>`. Numbers that already carry an
/// international prefix are left alone.
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let mut number: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    if number.starts_with("+0") && number.len() > 3 {
        number.remove(0);
    }

    if let Some(national) = number.strip_prefix('0') {
        format!("+{}{}", country_code, national)
    } else if !number.starts_with('+') {
        format!("+{}{}", country_code, number)
    } else {
        number
    }
}

/// Best error text from a provider error body: `message` (string or list),
/// else `error`, plus `details` when present.
pub(crate) fn api_error_message(status: u16, body: &str, context: &str) -> String {
    let fallback = format!("{} failed: {}", context, status);
    let json: serde_json::Value = match serde_json::from_str(body) {
        Ok(json) => json,
        Err(_) if body.trim().is_empty() => return fallback,
        Err(_) => {
            let snippet: String = body.chars().take(200).collect();
            return format!("{}: {}", fallback, snippet);
        }
    };

    let message = match json.get("message") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        ),
        _ => None,
    }
    .filter(|m| !m.is_empty())
    .or_else(|| json.get("error").and_then(|v| v.as_str()).map(str::to_string));

    let mut message = message.unwrap_or(fallback);
    if let Some(details) = json.get("details").and_then(|v| v.as_str()) {
        message.push_str(": ");
        message.push_str(details);
    }
    message
}

#[async_trait]
impl CallProvider for VapiClient {
    async fn create_call(&self, request: &CreateCallRequest) -> Result<String, ProviderError> {
        let number = normalize_phone(&request.customer_number, &self.country_code);
        if !number.starts_with(&format!("+{}", self.country_code)) {
            log::warn!("Vapi: dialling non-local number format {}", number);
        }

        let payload = CallPayload {
            assistant_id: &request.assistant_id,
            phone_number_id: &request.phone_number_id,
            customer: CustomerPayload {
                number,
                name: request
                    .customer_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(|n| n.chars().take(MAX_CUSTOMER_NAME_CHARS).collect()),
            },
        };

        let resp = self
            .client
            .post(self.url("/call/phone")?)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(format!("Vapi request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: api_error_message(status.as_u16(), &text, "Vapi create call"),
            });
        }

        let created: CreatedCall = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(created.id)
    }

    async fn get_call(&self, call_id: &str) -> Result<ProviderCall, ProviderError> {
        let resp = self
            .client
            .get(self.url(&format!("/call/{}", call_id))?)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(format!("Vapi request failed: {}", e)))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(call_id.to_string()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: api_error_message(status.as_u16(), &text, "Vapi get call"),
            });
        }

        resp.json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }
}
