//! The message-handling contract implemented by concrete agents.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::MessageBus;
use crate::context::ContextStore;
use crate::protocol::{Message, Payload};

/// Business logic plugged into an [`super::Agent`].
///
/// The runtime owns the lifecycle, queueing and metrics; implementations only
/// turn a message into a result. Errors and panics are contained by the agent
/// and reported as a failed [`super::ProcessOutcome`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message, ctx: &AgentContext) -> anyhow::Result<Payload>;

    /// Called after the agent has subscribed, before it reports running.
    async fn on_start(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after the processing loop has stopped.
    async fn on_stop(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An agent's view of the shared runtime services.
#[derive(Clone)]
pub struct AgentContext {
    agent_id: String,
    bus: Arc<MessageBus>,
    context: Arc<ContextStore>,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, bus: Arc<MessageBus>, context: Arc<ContextStore>) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            context,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    /// Send a message from this agent to `recipient`.
    pub fn send(&self, recipient: &str, message_type: &str, data: Payload) -> bool {
        self.bus
            .send(Message::new(self.agent_id.as_str(), recipient, message_type, data))
    }

    /// Broadcast a message from this agent.
    pub fn broadcast(&self, message_type: &str, data: Payload) -> bool {
        self.bus
            .broadcast(Message::broadcast(self.agent_id.as_str(), message_type, data))
    }

    /// Answer `request`, preserving its correlation id.
    pub fn reply(&self, request: &Message, message_type: &str, data: Payload) -> bool {
        self.bus
            .send(Message::reply(request, self.agent_id.as_str(), message_type, data))
    }

    /// Send to `recipient` and wait up to `timeout` for the answer.
    pub async fn request(
        &self,
        recipient: &str,
        message_type: &str,
        data: Payload,
        timeout: Duration,
    ) -> Option<Message> {
        let message = Message::new(self.agent_id.as_str(), recipient, message_type, data);
        self.bus.send_with_reply(message, timeout).await
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}
