use super::{TargetInput, TargetInvoker, TargetResponse};
use crate::model::TargetRef;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Deterministic in-process target for tests, demos and dry runs.
#[derive(Debug, Default)]
pub struct FakeInvoker {
    fixed_response: Option<String>,
    by_prompt: HashMap<String, String>,
    failing: HashSet<String>,
    calls: Mutex<Vec<TargetInput>>,
}

impl FakeInvoker {
    /// Replies with the prompt it was sent.
    pub fn echo() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.fixed_response = Some(response.into());
        self
    }

    pub fn with_reply(mut self, prompt: impl Into<String>, reply: impl Into<String>) -> Self {
        self.by_prompt.insert(prompt.into(), reply.into());
        self
    }

    /// Every call with this prompt fails like an unreachable target.
    pub fn with_failure(mut self, prompt: impl Into<String>) -> Self {
        self.failing.insert(prompt.into());
        self
    }

    /// Inputs received so far, in call order.
    pub fn calls(&self) -> Vec<TargetInput> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetInvoker for FakeInvoker {
    async fn invoke(&self, target: &TargetRef, input: &TargetInput) -> anyhow::Result<TargetResponse> {
        self.calls.lock().unwrap().push(input.clone());
        if self.failing.contains(&input.prompt) {
            anyhow::bail!("fake target '{}' refused connection", target.name);
        }
        let text = self
            .by_prompt
            .get(&input.prompt)
            .or(self.fixed_response.as_ref())
            .cloned()
            .unwrap_or_else(|| input.prompt.clone());
        Ok(TargetResponse {
            body: serde_json::json!({ "output": text }),
            text,
        })
    }

    fn kind(&self) -> &'static str {
        "fake"
    }
}
