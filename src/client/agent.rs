//! Agent client: an autonomous participant attached to one environment.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::monitor::{MetricsSink, NoopSink};
use crate::protocol::{ActionPayload, EventPayload, Identity, OutcomePayload, Payload};

use super::core::{ClientConfig, ClientCore, ClientError};

/// Client facade for agents. Convenience helpers emit `action` envelopes to
/// the agent's environment.
pub struct AgentClient {
    core: ClientCore,
    env_id: String,
}

impl AgentClient {
    pub async fn connect(
        agent_id: &str,
        env_id: &str,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        Self::connect_with(agent_id, env_id, config, Arc::new(NoopSink)).await
    }

    pub async fn connect_with(
        agent_id: &str,
        env_id: &str,
        config: ClientConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ClientError> {
        let path = format!("env/{env_id}/agent/{agent_id}");
        let core = ClientCore::connect(Identity::agent(agent_id), &path, config, metrics).await?;
        Ok(Self {
            core,
            env_id: env_id.to_string(),
        })
    }

    pub fn core(&self) -> &ClientCore {
        &self.core
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    fn environment(&self) -> Identity {
        Identity::environment(self.env_id.clone())
    }

    /// Sends an action to the environment, returning the action id for
    /// later correlation.
    pub async fn send_action(
        &self,
        action: &str,
        parameters: Map<String, Value>,
    ) -> Result<String, ClientError> {
        let payload = ActionPayload::new(action, parameters);
        let id = payload.id.clone();
        self.core
            .send_payload(self.environment(), &Payload::Action(payload))
            .await?;
        Ok(id)
    }

    /// Sends an action and waits for its outcome.
    pub async fn perform(
        &self,
        action: ActionPayload,
        timeout: Duration,
    ) -> Result<OutcomePayload, ClientError> {
        self.core
            .send_and_wait(action, self.environment(), timeout)
            .await
    }

    /// Sends an event to the environment.
    pub async fn send_event(
        &self,
        event: &str,
        data: Map<String, Value>,
    ) -> Result<String, ClientError> {
        let payload = EventPayload::new(event, data);
        let id = payload.id.clone();
        self.core
            .send_payload(self.environment(), &Payload::Event(payload))
            .await?;
        Ok(id)
    }

    // Thin builders for the common world actions.

    pub async fn move_to(&self, direction: &str) -> Result<String, ClientError> {
        let mut parameters = Map::new();
        parameters.insert("direction".to_string(), Value::String(direction.to_string()));
        self.send_action("move", parameters).await
    }

    pub async fn observe(&self) -> Result<String, ClientError> {
        self.send_action("observe", Map::new()).await
    }

    pub async fn pickup(&self, item: &str) -> Result<String, ClientError> {
        let mut parameters = Map::new();
        parameters.insert("item".to_string(), Value::String(item.to_string()));
        self.send_action("pickup", parameters).await
    }

    pub async fn ping(&self, timeout: Duration) -> Result<OutcomePayload, ClientError> {
        self.perform(ActionPayload::new("ping", Map::new()), timeout)
            .await
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}
