//! Human client: a thin subscriber that can target any identity.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::monitor::{MetricsSink, NoopSink};
use crate::protocol::{ActionPayload, ClientKind, Identity, OutcomePayload, Payload};

use super::core::{ClientConfig, ClientCore, ClientError};

pub struct HumanClient {
    core: ClientCore,
}

impl HumanClient {
    pub async fn connect(human_id: &str, config: ClientConfig) -> Result<Self, ClientError> {
        Self::connect_with(human_id, config, Arc::new(NoopSink)).await
    }

    pub async fn connect_with(
        human_id: &str,
        config: ClientConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ClientError> {
        let path = format!("human/{human_id}");
        let core = ClientCore::connect(Identity::human(human_id), &path, config, metrics).await?;
        Ok(Self { core })
    }

    pub fn core(&self) -> &ClientCore {
        &self.core
    }

    /// Sends an action to any participant.
    pub async fn send_action_to(
        &self,
        kind: ClientKind,
        target_id: &str,
        action: &str,
        parameters: Map<String, Value>,
    ) -> Result<String, ClientError> {
        let payload = ActionPayload::new(action, parameters);
        let id = payload.id.clone();
        self.core
            .send_payload(Identity::new(kind, target_id), &Payload::Action(payload))
            .await?;
        Ok(id)
    }

    /// Sends an action and waits for the outcome.
    pub async fn request(
        &self,
        kind: ClientKind,
        target_id: &str,
        action: ActionPayload,
        timeout: Duration,
    ) -> Result<OutcomePayload, ClientError> {
        self.core
            .send_and_wait(action, Identity::new(kind, target_id), timeout)
            .await
    }

    /// Asks an environment for an observation.
    pub async fn observe(&self, env_id: &str) -> Result<String, ClientError> {
        self.send_action_to(ClientKind::Environment, env_id, "observe", Map::new())
            .await
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}
