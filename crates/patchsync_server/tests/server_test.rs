//! End-to-end checks against a live server on a loopback port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use patchsync_core::transport::BroadcastHub;
use patchsync_core::{
    ConflictStrategy, DefaultTransportFactory, EngineConfig, EntityKey, Patch, PatchBatch,
    PatchEngine, PatchSource, SqliteStorage, SyncManager, TransportKind, TransportSettings,
};
use patchsync_server::{Config, app, rpc::default_registries, sync::SyncState};
use serde_json::{Value, json};
use tempfile::TempDir;

struct TestServer {
    addr: SocketAddr,
    _dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

async fn spawn_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let config = Config {
        host: "127.0.0.1".into(),
        port: 0,
        database_path: dir.path().join("patchsync.db"),
        ..Config::default()
    };
    let storage = Arc::new(SqliteStorage::open(&config.database_path).unwrap());
    let (types, methods) = default_registries();
    let sync_state = Arc::new(SyncState::new(storage, types, methods, &config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(sync_state, &config);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer { addr, _dir: dir }
}

fn client(settings: TransportSettings, kind: TransportKind) -> SyncManager {
    let factory = DefaultTransportFactory::new(BroadcastHub::new(), settings);
    let manager = SyncManager::new(PatchEngine::new(EngineConfig::default()), Arc::new(factory));
    manager.switch_transport(kind).unwrap();
    manager
}

async fn wait_for_change(manager: &SyncManager, key: &EntityKey, change_number: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while manager.last_change_number(key) != Some(change_number) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("change never arrived");
}

async fn call(server: &TestServer, path: &str, body: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(server.url(path))
        .header("x-user-id", "tester")
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rpc_commits_and_numbers_changes() {
    let server = spawn_server().await;

    let (status, body) = call(
        &server,
        "/rpc/board/g1/place_token",
        json!({"column": 3, "player": "P1"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["newChangeNumber"], 1);
    assert_eq!(body["result"]["row"], 0);
    assert_eq!(body["patchBatches"][0]["patches"][0]["userId"], "tester");

    let entity: Value = reqwest::get(server.url("/entities/board/g1"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(entity["changeNumber"], 1);
    assert_eq!(entity["state"]["board"]["cells"][3], "P1");
    assert_eq!(entity["state"]["board"]["heights"][3], 1);

    // queries report the current watermark and commit nothing
    let (status, body) = call(&server, "/rpc/board/g1/get_board", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["newChangeNumber"], 1);
    assert_eq!(body["patchBatches"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rpc_error_statuses() {
    let server = spawn_server().await;

    let (status, body) = call(&server, "/rpc/board/g1/fly", json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(body["kind"], "UnknownMethod");

    let (status, _) = call(&server, "/rpc/chess/g1/move", json!({})).await;
    assert_eq!(status, 404);

    let (status, _) = call(
        &server,
        "/rpc/board/g1/place_token",
        json!({"column": 0, "player": "P2"}),
    )
    .await;
    assert_eq!(status, 409);

    let (status, body) = call(&server, "/rpc/board/g1/place_token", json!({"player": "P1"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["kind"], "InvalidArguments");

    let response = reqwest::Client::new()
        .post(server.url("/entities/board/g1/patches"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_socket_client_converges_after_rpc() {
    let server = spawn_server().await;
    let observer = client(
        TransportSettings {
            websocket_url: Some(format!("ws://{}/ws", server.addr)),
            ..Default::default()
        },
        TransportKind::WebSocket,
    );
    let key = observer
        .register_entity("board", "g2", json!({}), ConflictStrategy::default())
        .unwrap();

    // seeded from the subscribe snapshot
    tokio::time::timeout(Duration::from_secs(10), async {
        while observer.state(&key).unwrap()["currentPlayer"] != "P1" {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("snapshot never arrived");

    let (status, _) = call(
        &server,
        "/rpc/board/g2/place_token",
        json!({"column": 5, "player": "P1"}),
    )
    .await;
    assert_eq!(status, 200);
    let (status, _) = call(&server, "/rpc/board/g2/advance_turn", json!({})).await;
    assert_eq!(status, 200);

    wait_for_change(&observer, &key, 2).await;
    let state = observer.state(&key).unwrap();
    assert_eq!(state["board"]["cells"][5], "P1");
    assert_eq!(state["currentPlayer"], "P2");

    observer.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_push_clients_converge() {
    let server = spawn_server().await;
    let settings = TransportSettings {
        server_url: Some(server.url("")),
        ..Default::default()
    };
    let writer = client(settings.clone(), TransportKind::ServerPush);
    let reader = client(settings, TransportKind::ServerPush);

    let key = writer
        .register_entity("board", "g3", json!({}), ConflictStrategy::default())
        .unwrap();
    reader
        .register_entity("board", "g3", json!({}), ConflictStrategy::default())
        .unwrap();

    // writer's own proposal comes back with the server's number
    let batch = PatchBatch::new(
        &key,
        vec![Patch::set("board.cells[0]", "P1")],
        PatchSource::Local,
    );
    writer.ingest_local_patches(batch).unwrap();

    wait_for_change(&reader, &key, 1).await;
    wait_for_change(&writer, &key, 1).await;
    assert_eq!(reader.state(&key).unwrap()["board"]["cells"][0], "P1");
    assert_eq!(reader.state(&key), writer.state(&key));

    writer.shutdown().unwrap();
    reader.shutdown().unwrap();
}
