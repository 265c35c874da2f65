use super::{ExecutionOutcome, ExecutionRequest, Executor};
use crate::errors::ExecutionError;
use crate::model::{ConversationTurn, Modality, TurnRole};
use crate::providers::agent::{AgentTurn, ConversationAgent};
use crate::providers::target::{extract_response, TargetInput, TargetInvoker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

pub const DEFAULT_MAX_TURNS: u32 = 10;

/// Bounded conversation loop driven by a [`ConversationAgent`].
///
/// The rendered transcript is the output handed to the metrics.
pub struct MultiTurnExecutor {
    invoker: Arc<dyn TargetInvoker>,
    agent: Arc<dyn ConversationAgent>,
}

impl MultiTurnExecutor {
    pub fn new(invoker: Arc<dyn TargetInvoker>, agent: Arc<dyn ConversationAgent>) -> Self {
        Self { invoker, agent }
    }

    pub fn render_transcript(transcript: &[ConversationTurn]) -> String {
        transcript
            .iter()
            .map(|t| {
                let role = match t.role {
                    TurnRole::User => "user",
                    TurnRole::Assistant => "assistant",
                };
                format!("{}: {}", role, t.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Executor for MultiTurnExecutor {
    fn modality(&self) -> Modality {
        Modality::MultiTurn
    }

    async fn execute(&self, req: ExecutionRequest<'_>) -> Result<ExecutionOutcome, ExecutionError> {
        let tc = req.test_case;
        let max_turns = tc
            .conversation
            .as_ref()
            .and_then(|c| c.max_turns)
            .unwrap_or(DEFAULT_MAX_TURNS)
            .max(1);

        let start = Instant::now();
        let mut transcript: Vec<ConversationTurn> = Vec::new();

        for turn in 0..max_turns {
            let message = match self.agent.next_turn(tc, &transcript).await {
                Ok(AgentTurn::Say(message)) => message,
                Ok(AgentTurn::Finish { reason }) => {
                    tracing::debug!(test_case_id = %tc.id, turn, %reason, "conversation finished");
                    break;
                }
                Err(e) => {
                    return Err(ExecutionError::Agent {
                        detail: format!("{e:#}"),
                    })
                }
            };

            let input = TargetInput {
                prompt: message.clone(),
                context: tc.context.clone(),
                conversation: transcript.clone(),
                tenant: Some(req.unit.tenant().clone()),
                attempt: req.unit.attempt_count(),
            };
            transcript.push(ConversationTurn {
                role: TurnRole::User,
                content: message,
            });

            let resp = self
                .invoker
                .invoke(req.target, &input)
                .await
                .map_err(|e| ExecutionError::invocation(&e))?;
            let reply = extract_response(&resp, req.target.response_pointer.as_deref())
                .ok_or(ExecutionError::EmptyResponse)?;
            transcript.push(ConversationTurn {
                role: TurnRole::Assistant,
                content: reply,
            });
        }

        if !transcript.iter().any(|t| t.role == TurnRole::Assistant) {
            return Err(ExecutionError::EmptyResponse);
        }

        Ok(ExecutionOutcome {
            output: Self::render_transcript(&transcript),
            execution_time_ms: start.elapsed().as_millis() as u64,
            transcript,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationSpec, ExecutionUnit, TargetRef, TestCase};
    use crate::providers::agent::ScriptedAgent;
    use crate::providers::target::fake::FakeInvoker;
    use crate::tenant::TenantContext;

    struct Chatty;

    #[async_trait]
    impl ConversationAgent for Chatty {
        async fn next_turn(&self, _tc: &TestCase, _t: &[ConversationTurn]) -> anyhow::Result<AgentTurn> {
            Ok(AgentTurn::Say("again".into()))
        }

        fn name(&self) -> &'static str {
            "chatty"
        }
    }

    fn case(script: &[&str], max_turns: Option<u32>, marker: Option<&str>) -> TestCase {
        TestCase {
            id: "conv".into(),
            prompt: "hello".into(),
            context: vec![],
            expected_output: None,
            metrics: vec![],
            modality: Some("multi_turn".into()),
            conversation: Some(ConversationSpec {
                goal: "reserve".into(),
                max_turns,
                script: script.iter().map(|s| s.to_string()).collect(),
                success_marker: marker.map(String::from),
            }),
            tags: vec![],
        }
    }

    fn target() -> TargetRef {
        TargetRef {
            name: "bot".into(),
            kind: "fake".into(),
            endpoint: None,
            response_pointer: None,
            headers: Default::default(),
        }
    }

    #[tokio::test]
    async fn conversation_stops_at_success_marker() {
        let invoker = FakeInvoker::echo()
            .with_reply("table for two", "which time?")
            .with_reply("7pm", "booking confirmed");
        let exec = MultiTurnExecutor::new(Arc::new(invoker), Arc::new(ScriptedAgent));
        let tc = case(&["table for two", "7pm", "thanks"], None, Some("confirmed"));
        let unit = ExecutionUnit::new("run", "conv", TenantContext::new("o", "u"));
        let target = target();

        let out = exec
            .execute(ExecutionRequest {
                unit: &unit,
                test_case: &tc,
                target: &target,
            })
            .await
            .unwrap();

        assert_eq!(out.transcript.len(), 4);
        assert_eq!(
            out.output,
            "user: table for two\nassistant: which time?\nuser: 7pm\nassistant: booking confirmed"
        );
    }

    #[tokio::test]
    async fn turn_budget_bounds_the_loop() {
        let exec = MultiTurnExecutor::new(Arc::new(FakeInvoker::echo()), Arc::new(Chatty));
        let tc = case(&[], Some(3), None);
        let unit = ExecutionUnit::new("run", "conv", TenantContext::new("o", "u"));
        let target = target();

        let out = exec
            .execute(ExecutionRequest {
                unit: &unit,
                test_case: &tc,
                target: &target,
            })
            .await
            .unwrap();
        assert_eq!(out.transcript.len(), 6);
    }
}
