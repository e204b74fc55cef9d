//! End-to-end tests driving a real Hub over loopback WebSockets with the
//! crate's own clients.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use star_protocol::client::{AgentClient, ClientError, EnvironmentClient, HumanClient};
use star_protocol::protocol::{ActionPayload, Envelope, EventPayload, Identity, Payload};

mod common;
use common::{client_config, echo_environment, eventually, start_hub, start_hub_with};

/// An agent's action is answered by the environment and the correlated
/// outcome resolves `send_and_wait`.
#[tokio::test]
async fn unicast_action_outcome_round_trip() {
    let hub = start_hub().await;
    let env = Arc::new(
        EnvironmentClient::connect("demo", client_config(&hub))
            .await
            .unwrap(),
    );
    let responder = env.clone();
    env.core().on_action(move |action, envelope| {
        let env = responder.clone();
        async move {
            assert_eq!(action.action, "move");
            env.send_outcome(
                &envelope.sender.id,
                &action.id,
                json!({
                    "status": "success",
                    "data": {"new_position": {"x": 1, "y": 0}},
                }),
            )
            .await?;
            Ok(())
        }
    });

    let agent = AgentClient::connect("agent-a1", "demo", client_config(&hub))
        .await
        .unwrap();

    let mut parameters = serde_json::Map::new();
    parameters.insert("direction".to_string(), Value::String("north".to_string()));
    let action = ActionPayload::new("move", parameters).with_id("x1");

    let outcome = agent
        .perform(action, Duration::from_secs(2))
        .await
        .expect("outcome arrives");

    assert_eq!(outcome.id, "x1");
    assert!(outcome.is_success());
    assert_eq!(outcome.outcome["data"]["new_position"]["x"], 1);
    assert_eq!(outcome.outcome_type, "dict");

    agent.close().await;
    env.close().await;
    hub.shutdown().await;
}

/// An environment broadcast to `(agent, "*")` reaches only agents attached
/// to that environment.
#[tokio::test]
async fn broadcast_scoped_to_environment_members() {
    let hub = start_hub().await;
    let env = EnvironmentClient::connect("w-1", client_config(&hub))
        .await
        .unwrap();

    let a1 = AgentClient::connect("agent-a1", "w-1", client_config(&hub))
        .await
        .unwrap();
    let a2 = AgentClient::connect("agent-a2", "w-1", client_config(&hub))
        .await
        .unwrap();
    let b1 = AgentClient::connect("agent-b1", "w-2", client_config(&hub))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    for (name, agent) in [("a1", &a1), ("a2", &a2), ("b1", &b1)] {
        let tx = tx.clone();
        agent.core().on_event(move |event, _| {
            let tx = tx.clone();
            let name = name.to_string();
            async move {
                tx.send(format!("{name}:{}", event.event)).ok();
                Ok(())
            }
        });
    }

    env.broadcast_event("world_update", serde_json::Map::new())
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let received = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("scoped agents receive the event")
            .unwrap();
        seen.push(received);
    }
    seen.sort();
    assert_eq!(seen, vec!["a1:world_update", "a2:world_update"]);

    // The out-of-scope agent stays silent.
    assert!(
        tokio::time::timeout(Duration::from_millis(400), rx.recv())
            .await
            .is_err(),
        "agent in another environment must not receive the broadcast"
    );

    for client in [a1, a2, b1] {
        client.close().await;
    }
    env.close().await;
    hub.shutdown().await;
}

/// Addressing a missing environment produces `ROUTING_NO_RECIPIENT` with
/// the offending envelope's id in the details.
#[tokio::test]
async fn missing_recipient_reports_routing_error() {
    let hub = start_hub().await;
    let agent = AgentClient::connect("agent-a1", "demo", client_config(&hub))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    agent.core().on_error(move |payload, _| {
        let tx = tx.clone();
        async move {
            tx.send(payload).ok();
            Ok(())
        }
    });

    let envelope = Envelope::message(
        Identity::agent("agent-a1"),
        Identity::environment("missing-env"),
        &Payload::Event(EventPayload::new("probe", serde_json::Map::new())),
    );
    let sent_id = envelope.id.clone().unwrap();
    agent.core().send(envelope).await.unwrap();

    let error = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("error envelope arrives")
        .unwrap();
    assert_eq!(error.error_code.as_str(), "ROUTING_NO_RECIPIENT");
    assert_eq!(
        error.details["original_message_id"],
        Value::String(sent_id)
    );

    agent.close().await;
    hub.shutdown().await;
}

/// A second connection with the same identity replaces the first; the
/// replaced client stops rather than fighting for the identity.
#[tokio::test]
async fn identity_collision_replaces_first_session() {
    let hub = start_hub().await;
    let first = AgentClient::connect("agent-a1", "demo", client_config(&hub))
        .await
        .unwrap();
    assert!(first.core().is_connected());

    let second = AgentClient::connect("agent-a1", "demo", client_config(&hub))
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(5), || !first.core().is_connected()).await,
        "replaced session must observe its eviction"
    );
    assert!(second.core().is_connected());
    assert_eq!(hub.stats().active_sessions, 1);

    second.close().await;
    first.close().await;
    hub.shutdown().await;
}

/// A connection that never sends anything is evicted once its silence
/// exceeds the session timeout.
#[tokio::test]
async fn idle_session_is_evicted() {
    let hub = start_hub_with(|c| {
        c.heartbeat_interval_s = 1;
        c.session_timeout_s = 2;
    })
    .await;

    let url = format!("{}/env/idle-env", hub.url());
    let (ws, _) = connect_async(&url).await.unwrap();
    let (_sink, mut stream) = ws.split();

    let started = tokio::time::Instant::now();
    let mut close_reason = None;
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_secs(10), stream.next()).await
    {
        match frame {
            Ok(WsMessage::Close(frame)) => {
                close_reason = frame.map(|f| f.reason.as_str().to_string());
                break;
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(8),
        "eviction should land shortly after the timeout, took {elapsed:?}"
    );
    assert_eq!(close_reason.as_deref(), Some("idle_timeout"));
    assert!(eventually(Duration::from_secs(3), || {
        hub.stats().active_sessions == 0
    })
    .await);

    hub.shutdown().await;
}

/// Handlers registered before a server restart keep firing after the client
/// reconnects.
#[tokio::test]
async fn reconnect_preserves_handlers() {
    let hub = start_hub().await;
    let port = hub.local_addr().port();

    let agent = AgentClient::connect("agent-a1", "demo", client_config(&hub))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    agent.core().on_outcome(move |outcome, _| {
        let tx = tx.clone();
        async move {
            tx.send(outcome.id).ok();
            Ok(())
        }
    });

    hub.shutdown().await;
    assert!(
        eventually(Duration::from_secs(5), || !agent.core().is_connected()).await,
        "client must notice the server going away"
    );

    let hub = start_hub_with(|c| c.port = port).await;
    assert!(
        agent.core().wait_connected(Duration::from_secs(20)).await,
        "client must reconnect within the backoff cap"
    );

    let env = EnvironmentClient::connect("demo", client_config(&hub))
        .await
        .unwrap();
    env.send_outcome("agent-a1", "fresh-1", json!({"status": "success"}))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("outcome reaches the preserved handler")
        .unwrap();
    assert_eq!(received, "fresh-1");

    agent.close().await;
    env.close().await;
    hub.shutdown().await;
}

/// A broadcast with no live recipients completes without errors or drops.
#[tokio::test]
async fn empty_broadcast_is_a_successful_no_op() {
    let hub = start_hub().await;
    let env = EnvironmentClient::connect("lonely-env", client_config(&hub))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    env.core().on_error(move |payload, _| {
        let tx = tx.clone();
        async move {
            tx.send(payload).ok();
            Ok(())
        }
    });

    env.broadcast_event("ghost_town", serde_json::Map::new())
        .await
        .unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(400), rx.recv())
            .await
            .is_err(),
        "no error should come back for an empty broadcast"
    );
    assert_eq!(hub.stats().envelopes_dropped, 0);

    env.close().await;
    hub.shutdown().await;
}

/// The first frame a fresh connection sees is a Hub heartbeat.
#[tokio::test]
async fn initial_heartbeat_greets_new_sessions() {
    let hub = start_hub().await;

    let url = format!("{}/human/watcher-1", hub.url());
    let (ws, _) = connect_async(&url).await.unwrap();
    let (_sink, mut stream) = ws.split();

    let frame = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("greeting arrives")
        .unwrap()
        .unwrap();
    let text = match frame {
        WsMessage::Text(text) => text,
        other => panic!("expected a text frame, got {other:?}"),
    };
    let value: Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(value["type"], "heartbeat");
    assert_eq!(value["sender"], json!({"id": "hub", "type": "hub"}));
    assert_eq!(value["recipient"], json!({"id": "watcher-1", "type": "human"}));
    assert_eq!(value["payload"]["server_status"], "running");
    assert_eq!(value["payload"]["ping"], "pong");

    hub.shutdown().await;
}

/// Sender to recipient order is preserved for unicast traffic.
#[tokio::test]
async fn unicast_order_is_fifo() {
    let hub = start_hub().await;
    let env = EnvironmentClient::connect("demo", client_config(&hub))
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    env.core().on_event(move |event, _| {
        let sink = sink.clone();
        async move {
            let n = event.data["n"].as_u64().unwrap();
            sink.lock().unwrap().push(n);
            Ok(())
        }
    });

    let agent = AgentClient::connect("agent-a1", "demo", client_config(&hub))
        .await
        .unwrap();
    for n in 0..50u64 {
        let mut data = serde_json::Map::new();
        data.insert("n".to_string(), n.into());
        agent.send_event("tick", data).await.unwrap();
    }

    assert!(
        eventually(Duration::from_secs(5), || {
            received.lock().unwrap().len() == 50
        })
        .await,
        "all events must arrive"
    );
    let order = received.lock().unwrap().clone();
    assert_eq!(order, (0..50).collect::<Vec<_>>());

    agent.close().await;
    env.close().await;
    hub.shutdown().await;
}

/// Clients answer Hub heartbeats, so a quiet but healthy client survives
/// the idle timeout.
#[tokio::test]
async fn quiet_client_stays_alive_via_heartbeats() {
    let hub = start_hub_with(|c| {
        c.heartbeat_interval_s = 1;
        c.session_timeout_s = 2;
    })
    .await;

    let agent = AgentClient::connect("agent-a1", "demo", client_config(&hub))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(agent.core().is_connected());
    assert_eq!(hub.stats().active_sessions, 1);

    agent.close().await;
    hub.shutdown().await;
}

/// Identity boundaries: ids of length 3 and 50 connect, 2 and 51 are
/// refused at upgrade time.
#[tokio::test]
async fn id_length_boundaries_enforced_at_upgrade() {
    let hub = start_hub().await;

    for good in ["abc", "a".repeat(50).as_str()] {
        let client = AgentClient::connect(good, "demo", client_config(&hub))
            .await
            .expect("valid id connects");
        client.close().await;
    }

    for bad in ["ab", "a".repeat(51).as_str()] {
        let err = AgentClient::connect(bad, "demo", client_config(&hub))
            .await
            .err()
            .expect("invalid id is refused");
        assert!(matches!(err, ClientError::ConnectionFailed(_)));
    }

    hub.shutdown().await;
}

/// Upgrades beyond `max_connections` are refused with HTTP 503.
#[tokio::test]
async fn connection_limit_rejects_with_503() {
    let hub = start_hub_with(|c| c.max_connections = 1).await;

    let env = EnvironmentClient::connect("demo", client_config(&hub))
        .await
        .unwrap();

    let err = HumanClient::connect("watcher-1", client_config(&hub))
        .await
        .err()
        .expect("over-limit upgrade is refused");
    assert!(format!("{err}").contains("503"), "got: {err}");

    env.close().await;
    hub.shutdown().await;
}

/// Frame size boundary: exactly `max_frame_bytes` is accepted, one byte
/// more is rejected with a structured validation error.
#[tokio::test]
async fn frame_size_boundary() {
    let hub = start_hub_with(|c| c.max_frame_bytes = 2048).await;

    let url = format!("{}/env/size-env", hub.url());
    let (ws, _) = connect_async(&url).await.unwrap();
    let (mut sink, mut stream) = ws.split();

    // Frames are client heartbeats padded to an exact byte length through an
    // ignored top-level field.
    let frame_of = |len: usize| {
        let base = r#"{"type":"heartbeat","sender":{"id":"size-env","type":"environment"},"recipient":{"id":"hub","type":"hub"},"payload":{},"pad":""}"#;
        assert!(len >= base.len());
        let mut frame = base.to_string();
        let filler = "x".repeat(len - base.len());
        frame.insert_str(frame.len() - 2, &filler);
        assert_eq!(frame.len(), len);
        frame
    };

    sink.send(WsMessage::Text(frame_of(2048).into()))
        .await
        .unwrap();
    sink.send(WsMessage::Text(frame_of(2049).into()))
        .await
        .unwrap();

    // Exactly one validation error comes back, for the oversized frame.
    let error = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let frame = stream.next().await.unwrap().unwrap();
            if let WsMessage::Text(text) = frame {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["type"] == "error" {
                    return value;
                }
            }
        }
    })
    .await
    .expect("oversized frame is rejected");
    assert_eq!(error["payload"]["error_code"], "VALIDATION_ERROR");

    hub.shutdown().await;
}

/// `close()` is idempotent and a closed client refuses further sends.
#[tokio::test]
async fn close_twice_is_a_no_op() {
    eprintln!("DBG test start");
    let hub = start_hub().await;
    eprintln!("DBG hub started");
    let env = echo_environment("demo", client_config(&hub)).await;
    eprintln!("DBG env connected");
    let agent = AgentClient::connect("agent-a1", "demo", client_config(&hub))
        .await
        .unwrap();
    eprintln!("DBG agent connected");

    agent.close().await;
    eprintln!("DBG agent closed first time");
    agent.close().await;
    eprintln!("DBG agent closed second time");

    let err = agent.send_action("move", serde_json::Map::new()).await;
    eprintln!("DBG send_action after close returned");
    assert!(matches!(err, Err(ClientError::Closed)));

    env.close().await;
    eprintln!("DBG env closed");
    hub.shutdown().await;
    eprintln!("DBG hub shutdown");
}

/// A pending `send_and_wait` fails with a timeout when nobody answers.
#[tokio::test]
async fn unanswered_request_times_out() {
    let hub = start_hub().await;
    let _env = EnvironmentClient::connect("demo", client_config(&hub))
        .await
        .unwrap();
    let agent = AgentClient::connect("agent-a1", "demo", client_config(&hub))
        .await
        .unwrap();

    let err = agent
        .perform(
            ActionPayload::new("observe", serde_json::Map::new()),
            Duration::from_millis(300),
        )
        .await
        .err()
        .expect("nobody answers");
    assert!(matches!(err, ClientError::Timeout));

    agent.close().await;
    hub.shutdown().await;
}
