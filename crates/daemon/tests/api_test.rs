//! REST API over an in-process daemon

use std::collections::BTreeMap;
use std::path::Path;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use hearth_cluster::{Instance, JoinToken, MemberId, NewMember, SCHEMA_VERSION};
use hearth_daemon::{Daemon, DaemonConfig};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use tracing_test::traced_test;

const FINGERPRINT: &str = "5d1e4a7c2b9f8e6d3c0a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60";

struct Fixture {
    _dir: TempDir,
    daemon: Daemon,
    router: Router,
}

fn config(dir: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.cluster.member_name = "node1".to_string();
    config.cluster.address = "10.0.0.1:8443".to_string();
    config.cluster.certificate_fingerprint = Some(FINGERPRINT.to_string());
    config.cluster.data_dir = dir.join("database");
    config
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::new(config(dir.path())).await.unwrap();
    let router = daemon.router();
    Fixture {
        _dir: dir,
        daemon,
        router,
    }
}

impl Fixture {
    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, None).await
    }

    async fn create_instance(&self, name: &str) {
        let store = self.daemon.state().registry.store();
        store
            .transaction(store.transaction_timeout(), |tx| {
                tx.create_instance(Instance {
                    project: "default".to_string(),
                    name: name.to_string(),
                    location: "node1".to_string(),
                })
            })
            .await
            .unwrap();
    }

    async fn create_network(&self, name: &str, config: &[(&str, &str)]) {
        let config: BTreeMap<String, String> = config
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let store = self.daemon.state().registry.store();
        store
            .transaction(store.transaction_timeout(), |tx| {
                tx.create_network("default", name, config.clone())
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
#[traced_test]
async fn test_network_allocations() {
    let f = fixture().await;
    f.create_network("lxdbr0", &[("ipv4.address", "10.0.0.1/24"), ("ipv4.nat", "true")])
        .await;

    let (status, body) = f.get("/1.0/network-allocations").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "sync");
    assert_eq!(
        body["metadata"],
        json!([{
            "address": "10.0.0.1/32",
            "used_by": "/1.0/networks/lxdbr0",
            "type": "network",
            "hwaddr": "",
            "nat": true,
        }])
    );
    assert!(logs_contain("Network lxdbr0 does not report leases"));

    let (status, body) = f.get("/1.0/network-allocations?all-projects=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"].as_array().unwrap().len(), 1);

    let (status, body) = f.get("/1.0/network-allocations?project=missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error_code"], 404);
}

#[tokio::test]
async fn test_network_allocations_from_fixture() {
    let dir = tempfile::tempdir().unwrap();
    let fixture_path = dir.path().join("networks.json");
    std::fs::write(
        &fixture_path,
        json!({
            "networks": [{
                "name": "lxdbr0",
                "id": 1,
                "config": { "ipv4.address": "10.0.0.1/24" },
                "leases": [
                    { "type": "dynamic", "address": "10.0.0.9", "hostname": "db1", "hwaddr": "00:16:3e:00:00:09" },
                    { "type": "gateway", "address": "10.0.0.1", "hostname": "lxdbr0.gw" }
                ]
            }]
        })
        .to_string(),
    )
    .unwrap();

    let mut config = DaemonConfig::default();
    config.cluster.member_name = "node1".to_string();
    config.cluster.data_dir = dir.path().join("database");
    config.network.fixture = Some(fixture_path);
    let daemon = Daemon::new(config).await.unwrap();
    let f = Fixture {
        _dir: dir,
        router: daemon.router(),
        daemon,
    };
    f.create_network("lxdbr0", &[]).await;

    let (status, body) = f.get("/1.0/network-allocations").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["metadata"],
        json!([
            {
                "address": "10.0.0.1/32",
                "used_by": "/1.0/networks/lxdbr0",
                "type": "network",
                "hwaddr": "",
                "nat": false,
            },
            {
                "address": "10.0.0.9/32",
                "used_by": "/1.0/instances/db1",
                "type": "instance",
                "hwaddr": "00:16:3e:00:00:09",
                "nat": false,
            },
        ])
    );
}

#[tokio::test]
async fn test_snapshot_runs_as_operation() {
    let f = fixture().await;
    f.create_instance("u1").await;

    let (status, body) = f
        .send(
            Method::POST,
            "/1.0/instances/u1/snapshots",
            Some(json!({ "name": "", "stateful": false })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["type"], "async");
    assert_eq!(body["status_code"], 100);
    assert_eq!(
        body["metadata"]["resources"]["instances_snapshots"],
        json!(["/1.0/instances/u1/snapshots/snap0"])
    );

    let url = body["operation"].as_str().unwrap().to_string();
    let (status, body) = f.get(&format!("{url}/wait?timeout=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["status"], "Success");
    assert_eq!(body["metadata"]["location"], "node1");

    let (_, body) = f.get("/1.0/instances/u1/snapshots").await;
    assert_eq!(body["metadata"], json!(["/1.0/instances/u1/snapshots/snap0"]));

    let (_, body) = f.get("/1.0/operations").await;
    assert_eq!(body["metadata"]["success"].as_array().unwrap().len(), 1);

    let (status, body) = f
        .send(
            Method::POST,
            "/1.0/instances/u1/snapshots/snap0",
            Some(json!({ "name": "before-upgrade" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let url = body["operation"].as_str().unwrap().to_string();
    f.get(&format!("{url}/wait")).await;

    let (status, body) = f
        .send(
            Method::PUT,
            "/1.0/instances/u1",
            Some(json!({ "restore": "u1/before-upgrade" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["metadata"]["description"], "Restoring snapshot");

    let (status, _) = f
        .send(Method::DELETE, "/1.0/instances/u1/snapshots/before-upgrade", None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_validation_errors_use_the_error_envelope() {
    let f = fixture().await;
    f.create_instance("u1").await;

    let (status, body) = f
        .send(
            Method::POST,
            "/1.0/instances/u1/snapshots",
            Some(json!({ "name": "a/b" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], 400);

    let (status, _) = f
        .send(
            Method::POST,
            "/1.0/instances/u2/snapshots",
            Some(json!({ "name": "snap0" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = f
        .send(Method::PUT, "/1.0/instances/u1", Some(json!({ "restore": "" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Only snapshot restore is supported");

    // Nothing was submitted
    let (_, body) = f.get("/1.0/operations").await;
    assert_eq!(body["metadata"], json!({}));
}

#[tokio::test]
async fn test_operation_lookup_and_wait_timeout() {
    let f = fixture().await;

    let (status, _) = f.get("/1.0/operations/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = f.get("/1.0/operations/unknown/wait?timeout=1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Token operations stay pending until consumed
    let (_, body) = f
        .send(
            Method::POST,
            "/1.0/cluster/members",
            Some(json!({ "server_name": "node2" })),
        )
        .await;
    let url = body["operation"].as_str().unwrap().to_string();

    let (status, body) = f.get(&format!("{url}/wait?timeout=0")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error_code"], 504);

    let (_, body) = f.get("/1.0/operations").await;
    assert_eq!(body["metadata"]["pending"].as_array().unwrap().len(), 1);

    let (status, body) = f.send(Method::DELETE, &url, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["status"], "Cancelled");

    let (status, _) = f.send(Method::DELETE, &url, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
#[traced_test]
async fn test_join_token_flow() {
    let f = fixture().await;

    let (status, body) = f
        .send(
            Method::POST,
            "/1.0/cluster/members",
            Some(json!({ "server_name": "node2" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["metadata"]["class"], "token");
    let url = body["operation"].as_str().unwrap().to_string();
    let metadata = &body["metadata"]["metadata"];

    let token = JoinToken::decode(metadata["token"].as_str().unwrap()).unwrap();
    assert_eq!(token.server_name, "node2");
    assert_eq!(token.fingerprint, FINGERPRINT);
    assert_eq!(token.addresses, vec!["10.0.0.1:8443"]);
    assert_eq!(metadata["secret"], json!(token.secret));

    let mut join = json!({
        "server_name": "node2",
        "address": "10.0.0.2:8443",
        "secret": "wrong",
    });
    let (status, _) = f.send(Method::POST, "/1.0/cluster/join", Some(join.clone())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    join["secret"] = json!(token.secret);
    let (status, body) = f.send(Method::POST, "/1.0/cluster/join", Some(join.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["name"], "node2");
    assert!(logs_contain("Cluster member node2 joined"));

    // The token is single use
    let (_, body) = f.get(&url).await;
    assert_eq!(body["metadata"]["status"], "Success");
    let (status, _) = f.send(Method::POST, "/1.0/cluster/join", Some(join)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = f.get("/1.0/cluster/members").await;
    let members = body["metadata"].as_array().unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[1]["url"], "/1.0/cluster/members/node2");
    assert_eq!(members[1]["resolved_address"], "10.0.0.2:8443");

    let (status, _) = f
        .send(
            Method::POST,
            "/1.0/cluster/members",
            Some(json!({ "server_name": "node2" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = f.send(Method::DELETE, "/1.0/cluster/members/node2", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = f.get("/1.0/cluster/members").await;
    assert_eq!(body["metadata"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DaemonConfig::default();
    config.cluster.member_name = "node1".to_string();
    config.cluster.data_dir = dir.path().join("database");
    config.http.listen_addr = "127.0.0.1:0".parse().unwrap();

    let daemon = Daemon::new(config).await.unwrap();
    daemon.start().await.unwrap();
    assert!(matches!(
        daemon.start().await,
        Err(hearth_daemon::Error::AlreadyStarted)
    ));
    daemon.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_cluster_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let node = |name: &str, address: &str| NewMember {
        name: name.to_string(),
        address: address.to_string(),
        schema_version: SCHEMA_VERSION,
        certificate_fingerprint: None,
    };

    let first = Daemon::new(config(dir.path())).await.unwrap();
    let registry = first.state().registry.clone();
    registry.join(node("node2", "10.0.0.2:8443")).await.unwrap();
    let store = registry.store();
    store
        .transaction(store.transaction_timeout(), |tx| {
            tx.create_instance(Instance {
                project: "default".to_string(),
                name: "web1".to_string(),
                location: "node1".to_string(),
            })
        })
        .await
        .unwrap();
    drop(registry);
    drop(first);

    assert!(dir.path().join("database/global").is_dir());

    let second = Daemon::new(config(dir.path())).await.unwrap();
    assert!(logs_contain("Replayed cluster log up to index"));

    let registry = &second.state().registry;
    let store = registry.store();
    assert_eq!(store.get_member_id("node1").unwrap(), MemberId(1));
    assert_eq!(store.get_member_id("node2").unwrap(), MemberId(2));
    assert!(store.read(|state| state.instance("default", "web1").is_some()));

    // IDs keep counting from where the previous run stopped
    let joined = registry.join(node("node3", "10.0.0.3:8443")).await.unwrap();
    assert_eq!(joined.id, MemberId(3));
}
