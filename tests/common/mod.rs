//! Shared fixtures for the end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use star_protocol::client::{ClientConfig, EnvironmentClient};
use star_protocol::config::HubConfig;
use star_protocol::hub::HubServer;

/// Starts a hub on an ephemeral loopback port with test-friendly defaults.
pub async fn start_hub() -> HubServer {
    start_hub_with(|_| {}).await
}

/// Starts a hub after letting the caller tweak the configuration.
pub async fn start_hub_with(tweak: impl FnOnce(&mut HubConfig)) -> HubServer {
    let mut config = HubConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..HubConfig::default()
    };
    tweak(&mut config);
    HubServer::start(config).await.expect("hub starts")
}

pub fn client_config(hub: &HubServer) -> ClientConfig {
    ClientConfig::with_base_url(hub.url())
}

/// Connects an environment that answers every action with a success outcome
/// echoing the action id.
pub async fn echo_environment(env_id: &str, config: ClientConfig) -> Arc<EnvironmentClient> {
    let env = Arc::new(
        EnvironmentClient::connect(env_id, config)
            .await
            .expect("environment connects"),
    );
    let handler_env = env.clone();
    env.core().on_action(move |action, envelope| {
        let env = handler_env.clone();
        async move {
            env.send_outcome(
                &envelope.sender.id,
                &action.id,
                json!({
                    "status": "success",
                    "data": {"echo": action.action},
                }),
            )
            .await?;
            Ok(())
        }
    });
    env
}

/// Polls `probe` until it returns true or the deadline passes.
pub async fn eventually(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    probe()
}
