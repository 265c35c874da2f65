//! Goal-seeking agent that drives multi-turn conversations.

use crate::model::{ConversationTurn, TestCase, TurnRole};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTurn {
    /// Send this message to the target.
    Say(String),
    /// Stop the conversation.
    Finish { reason: String },
}

#[async_trait]
pub trait ConversationAgent: Send + Sync {
    /// Decides the next user message given the transcript so far.
    async fn next_turn(&self, tc: &TestCase, transcript: &[ConversationTurn]) -> anyhow::Result<AgentTurn>;

    fn name(&self) -> &'static str;
}

/// Plays the test case's scripted turns in order.
///
/// The opening message is the test prompt when the script is empty. The
/// conversation ends as soon as the target's last reply contains the success
/// marker, or when the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedAgent;

impl ScriptedAgent {
    fn script(tc: &TestCase) -> Vec<&str> {
        match &tc.conversation {
            Some(spec) if !spec.script.is_empty() => spec.script.iter().map(String::as_str).collect(),
            _ => vec![tc.prompt.as_str()],
        }
    }
}

#[async_trait]
impl ConversationAgent for ScriptedAgent {
    async fn next_turn(&self, tc: &TestCase, transcript: &[ConversationTurn]) -> anyhow::Result<AgentTurn> {
        let marker = tc
            .conversation
            .as_ref()
            .and_then(|c| c.success_marker.as_deref())
            .map(str::to_lowercase);

        if let (Some(marker), Some(last)) = (marker, transcript.last()) {
            if last.role == TurnRole::Assistant && last.content.to_lowercase().contains(&marker) {
                return Ok(AgentTurn::Finish {
                    reason: "goal reached".into(),
                });
            }
        }

        let sent = transcript.iter().filter(|t| t.role == TurnRole::User).count();
        match Self::script(tc).get(sent) {
            Some(msg) => Ok(AgentTurn::Say((*msg).to_string())),
            None => Ok(AgentTurn::Finish {
                reason: "script exhausted".into(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
