//! Target invocation capability.
//!
//! The transport behind a target (HTTP, stream, embedded function) is not the
//! engine's concern; executors only see [`TargetInvoker::invoke`].

pub mod fake;
pub mod http;

use crate::model::{ConversationTurn, TargetRef};
use crate::tenant::TenantContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetInput {
    pub prompt: String,
    pub context: Vec<String>,
    /// Prior turns for multi-turn tests; empty for single-turn.
    pub conversation: Vec<ConversationTurn>,
    /// Identity of the unit making the call; transports may forward it.
    pub tenant: Option<TenantContext>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetResponse {
    pub text: String,
    /// Raw response body when the transport has one.
    pub body: serde_json::Value,
}

impl TargetResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            body: serde_json::Value::Null,
        }
    }
}

#[async_trait]
pub trait TargetInvoker: Send + Sync {
    async fn invoke(&self, target: &TargetRef, input: &TargetInput) -> anyhow::Result<TargetResponse>;

    fn kind(&self) -> &'static str;

    /// Whether targets of `kind` can be invoked through this invoker.
    fn supports(&self, _kind: &str) -> bool {
        true
    }
}

/// Pulls the output text out of a response, optionally through a JSON pointer
/// into the raw body. Blank output counts as no output.
pub fn extract_response(resp: &TargetResponse, pointer: Option<&str>) -> Option<String> {
    let text = match pointer {
        Some(p) => match resp.body.pointer(p)? {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => return None,
            other => other.to_string(),
        },
        None => resp.text.clone(),
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Routes each target to the invoker registered for its `kind`.
#[derive(Clone, Default)]
pub struct InvokerRegistry {
    invokers: HashMap<String, Arc<dyn TargetInvoker>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, invoker: Arc<dyn TargetInvoker>) -> Self {
        self.register(invoker);
        self
    }

    pub fn register(&mut self, invoker: Arc<dyn TargetInvoker>) {
        self.invokers.insert(invoker.kind().to_string(), invoker);
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.invokers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[async_trait]
impl TargetInvoker for InvokerRegistry {
    async fn invoke(&self, target: &TargetRef, input: &TargetInput) -> anyhow::Result<TargetResponse> {
        let invoker = self
            .invokers
            .get(&target.kind)
            .ok_or_else(|| anyhow::anyhow!("no invoker registered for target kind '{}'", target.kind))?;
        invoker.invoke(target, input).await
    }

    fn kind(&self) -> &'static str {
        "registry"
    }

    fn supports(&self, kind: &str) -> bool {
        self.invokers.contains_key(kind)
    }
}
