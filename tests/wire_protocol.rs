use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use ulid::Ulid;

use occupancy::config::Config;
use occupancy::coordinator::OccupationCoordinator;
use occupancy::lock::MemoryLockService;
use occupancy::notify::NotifyHub;
use occupancy::store::MemoryRecordStore;
use occupancy::wire::{self, ServerState};

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(store: MemoryRecordStore) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let store = Arc::new(store);
    let hub = Arc::new(NotifyHub::new());
    let coordinator = Arc::new(OccupationCoordinator::new(
        Arc::new(MemoryLockService::new()),
        store.clone(),
        hub.clone(),
        &Config::default(),
    ));
    let state = Arc::new(ServerState { coordinator, store, hub });

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let state = state.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, state).await;
            });
        }
    });

    addr
}

struct Client {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.recv(Duration::from_secs(5)).await.expect("no response")
    }

    /// Next line with timeout.
    async fn recv(&mut self, timeout: Duration) -> Option<Value> {
        let line = tokio::time::timeout(timeout, self.lines.next_line())
            .await
            .ok()?
            .ok()??;
        Some(serde_json::from_str(&line).unwrap())
    }
}

fn take(unit: &str, actor: &str) -> Value {
    json!({ "op": "take", "unit_id": unit, "actor_id": actor })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn resume_by_second_worker_over_tcp() {
    let addr = start_test_server(MemoryRecordStore::new()).await;
    let mut w1 = Client::connect(addr).await;
    let mut w2 = Client::connect(addr).await;

    assert_eq!(w1.call(json!({ "op": "register_unit", "unit_id": "S1" })).await["ok"], true);
    assert_eq!(w1.call(take("S1", "w1")).await["receipt"]["lifecycle"], "active");

    let denied = w2.call(take("S1", "w2")).await;
    assert_eq!(denied["error"]["kind"], "LOCK_DENIED");
    assert!(denied["error"]["message"].as_str().unwrap().contains("w1"));

    let paused = w1.call(json!({ "op": "pause", "unit_id": "S1", "actor_id": "w1" })).await;
    assert_eq!(paused["receipt"]["lifecycle"], "paused");

    let resumed = w2.call(take("S1", "w2")).await;
    assert_eq!(resumed["receipt"]["lifecycle"], "active");

    let unit = w2.call(json!({ "op": "get_unit", "unit_id": "S1" })).await;
    assert_eq!(unit["unit"]["record"]["subtasks"]["main"]["assignee"], "w1");
    assert_eq!(unit["unit"]["record"]["occupant"], "w2");

    let done = w2.call(json!({ "op": "complete", "unit_id": "S1", "actor_id": "w2" })).await;
    assert_eq!(done["receipt"]["lifecycle"], "completed");
}

#[tokio::test]
async fn pause_on_pending_unit_is_422() {
    let addr = start_test_server(MemoryRecordStore::new()).await;
    let mut client = Client::connect(addr).await;
    client.call(json!({ "op": "register_unit", "unit_id": "S3" })).await;

    let reply = client
        .call(json!({ "op": "pause", "unit_id": "S3", "actor_id": "w1" }))
        .await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["kind"], "INVALID_LIFECYCLE_TRANSITION");
    assert_eq!(reply["error"]["status"], 422);
}

#[tokio::test]
async fn listener_sees_every_transition_in_order() {
    let addr = start_test_server(MemoryRecordStore::new()).await;
    let mut listener = Client::connect(addr).await;
    let mut worker = Client::connect(addr).await;

    worker.call(json!({ "op": "register_unit", "unit_id": "S1" })).await;
    assert_eq!(listener.call(json!({ "op": "listen" })).await["ok"], true);

    worker.call(take("S1", "w1")).await;
    worker.call(json!({ "op": "pause", "unit_id": "S1", "actor_id": "w1" })).await;
    worker.call(take("S1", "w2")).await;
    worker.call(json!({ "op": "complete", "unit_id": "S1", "actor_id": "w2" })).await;

    let mut kinds = Vec::new();
    while let Some(line) = listener.recv(Duration::from_secs(2)).await {
        kinds.push(line["event"]["type"].as_str().unwrap().to_string());
        if kinds.len() == 4 {
            break;
        }
    }
    assert_eq!(kinds, vec!["TAKE", "PAUSE", "TAKE", "COMPLETE"]);

    // Nothing else queued.
    assert!(listener.recv(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn concurrent_clients_one_winner() {
    let addr = start_test_server(MemoryRecordStore::new()).await;
    let mut admin = Client::connect(addr).await;
    admin.call(json!({ "op": "register_unit", "unit_id": "hot" })).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client.call(take("hot", &format!("w{i}"))).await
        }));
    }
    let mut ok = 0;
    let mut denied = 0;
    for h in handles {
        let reply = h.await.unwrap();
        if reply["ok"] == true {
            ok += 1;
        } else if reply["error"]["kind"] == "LOCK_DENIED" {
            denied += 1;
        }
    }
    assert_eq!((ok, denied), (1, 9));

    let stats = admin.call(json!({ "op": "stats" })).await;
    assert_eq!(stats["contention"]["total_lock_denials"], 9);
    let hot = admin.call(json!({ "op": "hot_spots" })).await;
    assert_eq!(hot["hot_spots"], json!(["hot"]));
}

#[tokio::test]
async fn journaled_state_survives_restart() {
    let dir = std::env::temp_dir().join(format!("occupancy_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("units.wal");

    {
        let addr = start_test_server(MemoryRecordStore::open(path.clone()).unwrap()).await;
        let mut client = Client::connect(addr).await;
        client.call(json!({ "op": "register_unit", "unit_id": "S1" })).await;
        client.call(take("S1", "w1")).await;
        client.call(json!({ "op": "pause", "unit_id": "S1", "actor_id": "w1" })).await;
    }

    let addr = start_test_server(MemoryRecordStore::open(path).unwrap()).await;
    let mut client = Client::connect(addr).await;
    let unit = client.call(json!({ "op": "get_unit", "unit_id": "S1" })).await;
    assert_eq!(unit["unit"]["record"]["subtasks"]["main"]["state"], "paused");
    assert_eq!(unit["unit"]["record"]["subtasks"]["main"]["assignee"], "w1");

    let resumed = client.call(take("S1", "w2")).await;
    assert_eq!(resumed["receipt"]["lifecycle"], "active");
}
