//! Resilience tests for the gateway
//!
//! These tests verify behavior under failure conditions like:
//! - Receivers dropped while events are fanned out
//! - Outbound buffer exhaustion
//! - Backend subscription and session store failures
//! - Rapid and concurrent connect/disconnect cycles

use serde_json::{json, Value};
use socketgate::backend::{Backend, MemoryBackend};
use socketgate::config::GatewayConfig;
use socketgate::server::{ClientConnection, Gateway, GatewayHooks, NoopHooks, Response, TransportInfo};
use socketgate::SubscriptionType;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

fn gateway_with(config: GatewayConfig, hooks: Arc<dyn GatewayHooks>) -> (Arc<Gateway>, Arc<MemoryBackend>) {
    let mem = Arc::new(MemoryBackend::new());
    let gw = Gateway::new(config, Backend::from_memory(mem.clone()), hooks);
    (Arc::new(gw), mem)
}

fn gateway(config: GatewayConfig) -> (Arc<Gateway>, Arc<MemoryBackend>) {
    gateway_with(config, Arc::new(NoopHooks))
}

async fn call(gw: &Gateway, conn: &Arc<ClientConnection>, command: &str, args: Vec<Value>) -> Response {
    let (tx, rx) = oneshot::channel();
    gw.handle_command(
        conn,
        command,
        args,
        Some(Box::new(move |r| {
            let _ = tx.send(r);
        })),
    )
    .await;
    rx.await.expect("command must reply")
}

#[derive(Default)]
struct RecordingHooks {
    disconnects: AtomicUsize,
    client_lists: Mutex<Vec<Vec<String>>>,
}

impl GatewayHooks for RecordingHooks {
    fn on_disconnect(&self, _conn_id: Uuid, _user: &str) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_clients_changed(&self, clients: &[String]) {
        self.client_lists.lock().push(clients.to_vec());
    }
}

/// Dropped receivers must not disturb delivery to live ones
#[tokio::test]
async fn test_receivers_dropped_mid_delivery() {
    let (gw, _mem) = gateway(GatewayConfig::default());

    let mut receivers = Vec::new();
    for _ in 0..100 {
        let (conn, rx) = gw.connect(TransportInfo::new()).await;
        call(&gw, &conn, "subscribe", vec![json!("events.*")]).await;
        receivers.push(rx);
    }

    // Drop half the receivers to simulate vanished transports
    let mut receivers: Vec<_> = receivers.into_iter().take(50).collect();

    let mut last = 0;
    for i in 0..100 {
        last = gw.on_state_change("events.test", &json!({"val": i}));
    }
    assert_eq!(last, 50);

    for rx in receivers.iter_mut() {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 100);
    }
}

/// A full outbound queue drops events for that client only
#[tokio::test]
async fn test_slow_consumer_buffer_overflow() {
    let (gw, _mem) = gateway(GatewayConfig {
        outbound_buffer: 8,
        ..GatewayConfig::default()
    });
    let (slow, mut slow_rx) = gw.connect(TransportInfo::new()).await;
    let (fast, mut fast_rx) = gw.connect(TransportInfo::new()).await;
    call(&gw, &slow, "subscribe", vec![json!("sensor.*")]).await;
    call(&gw, &fast, "subscribe", vec![json!("sensor.*")]).await;

    let mut fast_count = 0;
    for i in 0..100 {
        gw.on_state_change("sensor.temp", &json!({"val": i}));
        while fast_rx.try_recv().is_ok() {
            fast_count += 1;
        }
    }

    let mut slow_count = 0;
    while slow_rx.try_recv().is_ok() {
        slow_count += 1;
    }
    assert_eq!(slow_count, 8);
    assert_eq!(fast_count, 100);
}

/// Connect, subscribe and disconnect repeatedly without leaking refcounts
#[tokio::test]
async fn test_rapid_connect_disconnect_cycles() {
    let (gw, mem) = gateway(GatewayConfig::default());

    for _ in 0..200 {
        let (conn, _rx) = gw.connect(TransportInfo::new()).await;
        call(&gw, &conn, "subscribe", vec![json!("zigbee.0.*")]).await;
        call(&gw, &conn, "subscribeObjects", vec![json!("zigbee.0.*")]).await;
        gw.disconnect(&conn).await;
    }

    assert_eq!(gw.connections().count(), 0);
    assert_eq!(gw.registry().refcount(SubscriptionType::StateChange, "zigbee.0.*"), 0);
    assert_eq!(gw.registry().refcount(SubscriptionType::ObjectChange, "zigbee.0.*"), 0);
    assert_eq!(mem.subscribe_calls(SubscriptionType::StateChange, "zigbee.0.*"), 200);
    assert_eq!(mem.unsubscribe_calls(SubscriptionType::StateChange, "zigbee.0.*"), 200);
    assert_eq!(mem.unsubscribe_calls(SubscriptionType::ObjectChange, "zigbee.0.*"), 200);
}

/// Concurrent subscribers leave a consistent refcount and balanced backend calls
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribe_unsubscribe() {
    let (gw, mem) = gateway(GatewayConfig::default());

    let mut handles = Vec::new();
    for _ in 0..32 {
        let gw = gw.clone();
        handles.push(tokio::spawn(async move {
            let (conn, _rx) = gw.connect(TransportInfo::new()).await;
            for _ in 0..20 {
                call(&gw, &conn, "subscribe", vec![json!("hm-rpc.*")]).await;
                call(&gw, &conn, "unsubscribe", vec![json!("hm-rpc.*")]).await;
            }
            call(&gw, &conn, "subscribe", vec![json!("hm-rpc.*")]).await;
            conn
        }));
    }

    let mut conns = Vec::new();
    for handle in handles {
        conns.push(handle.await.unwrap());
    }
    assert_eq!(gw.registry().refcount(SubscriptionType::StateChange, "hm-rpc.*"), 32);

    for conn in &conns {
        gw.disconnect(conn).await;
    }
    assert_eq!(gw.registry().refcount(SubscriptionType::StateChange, "hm-rpc.*"), 0);
    assert_eq!(
        mem.subscribe_calls(SubscriptionType::StateChange, "hm-rpc.*"),
        mem.unsubscribe_calls(SubscriptionType::StateChange, "hm-rpc.*")
    );
}

/// A subscribe racing the connection's teardown never leaves an orphaned count
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscribe_racing_disconnect_leaves_no_refcount() {
    let (gw, mem) = gateway(GatewayConfig::default());

    for round in 0..2_000 {
        let (conn, _rx) = gw.connect(TransportInfo::new()).await;

        let subscriber = {
            let gw = gw.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                gw.registry()
                    .subscribe(Some(conn.as_ref()), SubscriptionType::StateChange, "race.*", None)
                    .await;
            })
        };
        let closer = {
            let gw = gw.clone();
            let conn = conn.clone();
            tokio::spawn(async move { gw.disconnect(&conn).await })
        };
        subscriber.await.unwrap();
        closer.await.unwrap();

        assert_eq!(
            gw.registry().refcount(SubscriptionType::StateChange, "race.*"),
            0,
            "orphaned count after round {}",
            round
        );
    }
    assert_eq!(
        mem.subscribe_calls(SubscriptionType::StateChange, "race.*"),
        mem.unsubscribe_calls(SubscriptionType::StateChange, "race.*")
    );
}

/// A failing backend subscription still leaves local delivery intact
#[tokio::test]
async fn test_backend_subscription_failure_is_contained() {
    let (gw, mem) = gateway(GatewayConfig::default());
    mem.fail_subscriptions(true);

    let (conn, mut rx) = gw.connect(TransportInfo::new()).await;
    let response = call(&gw, &conn, "subscribe", vec![json!("knx.0.*")]).await;
    assert_eq!(response.error, None);
    assert_eq!(gw.registry().refcount(SubscriptionType::StateChange, "knx.0.*"), 1);

    assert_eq!(gw.on_state_change("knx.0.light", &json!({"val": true})), 1);
    assert!(rx.try_recv().is_ok());

    mem.fail_subscriptions(false);
    gw.disconnect(&conn).await;
    assert_eq!(gw.registry().refcount(SubscriptionType::StateChange, "knx.0.*"), 0);
    assert_eq!(mem.unsubscribe_calls(SubscriptionType::StateChange, "knx.0.*"), 1);
}

/// A session store outage expires the session instead of letting it through
#[tokio::test(start_paused = true)]
async fn test_session_store_outage_fails_closed() {
    let (gw, mem) = gateway(GatewayConfig {
        auth: true,
        ..GatewayConfig::default()
    });
    mem.insert_session("sid-9", json!({"passport": {"user": "admin"}}));
    let (conn, _rx) = gw.connect(TransportInfo::new().with_session_id("sid-9")).await;
    assert!(conn.is_authenticated());

    mem.fail_sessions(true);
    let response = call(&gw, &conn, "getVersion", vec![]).await;
    assert_eq!(response.error, None, "no re-read inside the freshness interval");

    tokio::time::advance(Duration::from_secs(61)).await;
    let response = call(&gw, &conn, "getVersion", vec![]).await;
    assert_eq!(response.error.as_deref(), Some("session expired"));
}

/// Disconnect is idempotent and reported once
#[tokio::test(start_paused = true)]
async fn test_double_disconnect_reported_once() {
    let hooks = Arc::new(RecordingHooks::default());
    let (gw, mem) = gateway_with(GatewayConfig::default(), hooks.clone());
    let (conn, _rx) = gw.connect(TransportInfo::new()).await;
    call(&gw, &conn, "subscribe", vec![json!("a.*")]).await;

    let response = call(&gw, &conn, "disconnect", vec![]).await;
    assert_eq!(response.error, None);
    gw.disconnect(&conn).await;
    gw.disconnect(&conn).await;

    assert_eq!(hooks.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(mem.unsubscribe_calls(SubscriptionType::StateChange, "a.*"), 1);
}

/// Bursts of connects collapse into one clients-changed notification
#[tokio::test(start_paused = true)]
async fn test_clients_update_debounced() {
    let hooks = Arc::new(RecordingHooks::default());
    let (gw, _mem) = gateway_with(GatewayConfig::default(), hooks.clone());

    let mut conns = Vec::new();
    for i in 0..5 {
        let (conn, rx) = gw.connect(TransportInfo::new()).await;
        call(&gw, &conn, "name", vec![json!(format!("panel-{}", i))]).await;
        conns.push((conn, rx));
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let lists = hooks.client_lists.lock().clone();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0], vec!["panel-0", "panel-1", "panel-2", "panel-3", "panel-4"]);

    gw.disconnect(&conns[0].0).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(hooks.client_lists.lock().len(), 2);
    assert_eq!(hooks.client_lists.lock()[1].len(), 4);
}

/// New clients work normally after everyone left
#[tokio::test]
async fn test_recovery_after_mass_disconnect() {
    let (gw, mem) = gateway(GatewayConfig::default());

    let mut conns = Vec::new();
    for _ in 0..50 {
        let (conn, rx) = gw.connect(TransportInfo::new()).await;
        call(&gw, &conn, "subscribe", vec![json!("weather.*")]).await;
        conns.push((conn, rx));
    }
    for (conn, _) in &conns {
        gw.disconnect(conn).await;
    }
    drop(conns);
    assert_eq!(gw.on_state_change("weather.temp", &json!({"val": 3})), 0);

    let (conn, mut rx) = gw.connect(TransportInfo::new()).await;
    call(&gw, &conn, "subscribe", vec![json!("weather.*")]).await;
    assert_eq!(gw.on_state_change("weather.temp", &json!({"val": 4})), 1);
    assert!(rx.try_recv().is_ok());
    assert_eq!(mem.subscribe_calls(SubscriptionType::StateChange, "weather.*"), 2);
}
