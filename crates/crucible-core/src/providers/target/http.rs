use super::{TargetInput, TargetInvoker, TargetResponse};
use crate::model::TargetRef;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

pub const ORG_HEADER: &str = "x-crucible-org";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// POSTs `{input, context, conversation}` as JSON to the target endpoint.
///
/// The reply body is kept whole; executors pick the output text with the
/// target's `response_pointer` (default `/output`, falling back to a plain
/// text body).
pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetInvoker for HttpInvoker {
    async fn invoke(&self, target: &TargetRef, input: &TargetInput) -> anyhow::Result<TargetResponse> {
        let url = target
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("http target '{}' has no endpoint", target.name))?;

        let body = json!({
            "input": input.prompt,
            "context": input.context,
            "conversation": input.conversation,
        });

        let mut req = self.client.post(url).json(&body);
        for (k, v) in &target.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(tenant) = &input.tenant {
            req = req
                .header(ORG_HEADER, tenant.org_id())
                .header(CORRELATION_HEADER, tenant.correlation_id());
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("POST {} for target '{}'", url, target.name))?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("target '{}' returned status {}: {}", target.name, status, raw);
        }

        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(json) => {
                let text = json
                    .pointer(target.response_pointer.as_deref().unwrap_or("/output"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(TargetResponse { text, body: json })
            }
            Err(_) => Ok(TargetResponse::text(raw)),
        }
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}
