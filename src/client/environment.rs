//! Environment client: the authority for one shared world.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::monitor::{MetricsSink, NoopSink};
use crate::protocol::{
    ClientKind, EventPayload, Identity, OutcomePayload, Payload,
};

use super::core::{ClientConfig, ClientCore, ClientError};

/// Client facade for environments: answers agent actions with outcomes and
/// pushes events to attached agents.
pub struct EnvironmentClient {
    core: ClientCore,
    world: Mutex<Option<Value>>,
}

impl EnvironmentClient {
    pub async fn connect(env_id: &str, config: ClientConfig) -> Result<Self, ClientError> {
        Self::connect_with(env_id, config, Arc::new(NoopSink)).await
    }

    pub async fn connect_with(
        env_id: &str,
        config: ClientConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ClientError> {
        let path = format!("env/{env_id}");
        let core =
            ClientCore::connect(Identity::environment(env_id), &path, config, metrics).await?;
        Ok(Self {
            core,
            world: Mutex::new(None),
        })
    }

    pub fn core(&self) -> &ClientCore {
        &self.core
    }

    pub fn env_id(&self) -> &str {
        &self.core.identity().id
    }

    /// Stores the initial world state for the business layer; the protocol
    /// core does not interpret it.
    pub fn initialize_environment(&self, world: Value) {
        *self.world.lock().expect("world state poisoned") = Some(world);
    }

    pub fn world(&self) -> Option<Value> {
        self.world.lock().expect("world state poisoned").clone()
    }

    /// Answers an agent's action with its outcome.
    pub async fn send_outcome(
        &self,
        agent_id: &str,
        action_id: &str,
        outcome: Value,
    ) -> Result<(), ClientError> {
        let payload = OutcomePayload::new(action_id, outcome);
        self.core
            .send_payload(Identity::agent(agent_id), &Payload::Outcome(payload))
            .await
    }

    /// Sends an event to one agent, or to every agent attached to this
    /// environment when `target_agent` is None (the Hub scopes the
    /// broadcast by membership).
    pub async fn send_event(
        &self,
        event: &str,
        data: Map<String, Value>,
        target_agent: Option<&str>,
    ) -> Result<String, ClientError> {
        let recipient = match target_agent {
            Some(agent_id) => Identity::agent(agent_id),
            None => Identity::broadcast(ClientKind::Agent),
        };
        let payload = EventPayload::new(event, data);
        let id = payload.id.clone();
        self.core
            .send_payload(recipient, &Payload::Event(payload))
            .await?;
        Ok(id)
    }

    /// Broadcasts an event to the agents attached to this environment.
    pub async fn broadcast_event(
        &self,
        event: &str,
        data: Map<String, Value>,
    ) -> Result<String, ClientError> {
        self.send_event(event, data, None).await
    }

    /// Announces an agent joining the world.
    pub async fn notify_agent_joined(
        &self,
        agent_id: &str,
        data: Map<String, Value>,
    ) -> Result<String, ClientError> {
        let mut payload = data;
        payload.insert("agent_id".to_string(), Value::String(agent_id.to_string()));
        self.broadcast_event("agent_joined", payload).await
    }

    /// Announces an agent leaving the world.
    pub async fn notify_agent_left(
        &self,
        agent_id: &str,
        reason: &str,
    ) -> Result<String, ClientError> {
        let mut payload = Map::new();
        payload.insert("agent_id".to_string(), Value::String(agent_id.to_string()));
        payload.insert("reason".to_string(), Value::String(reason.to_string()));
        self.broadcast_event("agent_left", payload).await
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}
