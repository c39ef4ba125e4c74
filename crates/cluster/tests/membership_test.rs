//! Multi-member scenarios over one shared in-process log

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_cluster::join::{FetchError, certificate_fingerprint};
use hearth_cluster::{
    CertificateFetcher, ClusterConfig, ClusterStore, ErrorKind, JoinToken, MemberRegistry,
    MemoryConsensus, NewMember, Role, RoleConfig, resolve_join_target,
};
use tracing_test::traced_test;

struct Member {
    registry: MemberRegistry,
    _dir: tempfile::TempDir,
}

fn member(name: &str, consensus: &Arc<MemoryConsensus>) -> Member {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        member_name: name.to_string(),
        data_dir: dir.path().to_path_buf(),
        roles: RoleConfig {
            min_voters: 3,
            max_voters: 3,
            max_standby: 1,
        },
        retry_backoff: Duration::from_millis(5),
        ..Default::default()
    };
    let store = Arc::new(ClusterStore::new(&config, consensus.clone()));
    Member {
        registry: MemberRegistry::new(&config, store).unwrap(),
        _dir: dir,
    }
}

fn new_member(i: u8) -> NewMember {
    NewMember {
        name: format!("node{i}"),
        address: format!("10.0.0.{i}:8443"),
        schema_version: 1,
        certificate_fingerprint: None,
    }
}

struct StaticFetcher(HashMap<String, Vec<u8>>);

#[async_trait]
impl CertificateFetcher for StaticFetcher {
    async fn fetch_certificate(&self, address: &str) -> Result<Vec<u8>, FetchError> {
        self.0
            .get(address)
            .cloned()
            .ok_or_else(|| format!("{address} is unreachable").into())
    }
}

#[tokio::test]
#[traced_test]
async fn test_cluster_grows_through_join_tokens() {
    let consensus = Arc::new(MemoryConsensus::new(Some("node1".to_string())));
    let node1 = member("node1", &consensus);
    node1.registry.bootstrap(new_member(1)).await.unwrap();

    let cluster_cert = b"node1 certificate".to_vec();
    let fetcher = StaticFetcher(HashMap::from([(
        "10.0.0.1:8443".to_string(),
        cluster_cert.clone(),
    )]));

    for i in 2..=5u8 {
        let token = JoinToken {
            server_name: format!("node{i}"),
            fingerprint: certificate_fingerprint(&cluster_cert),
            addresses: vec!["10.0.0.9".to_string(), "10.0.0.1".to_string()],
            secret: format!("secret-{i}"),
            expires_at: None,
        };
        let decoded = JoinToken::decode(&token.encode().unwrap()).unwrap();
        let target = resolve_join_target(&decoded, &fetcher).await.unwrap();
        assert_eq!(target.address, "10.0.0.1:8443");

        // The new member registers through the member it reached
        let joining = member(&decoded.server_name, &consensus);
        joining.registry.join(new_member(i)).await.unwrap();
    }
    assert!(logs_contain("Error connecting to existing cluster member 10.0.0.9:8443"));

    let members = node1.registry.members().await.unwrap();
    let roles: Vec<(String, Role)> = members
        .iter()
        .map(|member| (member.name.clone(), member.role))
        .collect();
    assert_eq!(
        roles,
        vec![
            ("node1".to_string(), Role::Voter),
            ("node2".to_string(), Role::Voter),
            ("node3".to_string(), Role::Voter),
            ("node4".to_string(), Role::StandBy),
            ("node5".to_string(), Role::Spare),
        ]
    );

    // Ids come from the replicated counter regardless of which member wrote
    let ids: Vec<i64> = members.iter().map(|member| member.id.0).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_leader_handover_keeps_the_band() {
    let consensus = Arc::new(MemoryConsensus::new(Some("node1".to_string())));
    let node1 = member("node1", &consensus);
    node1.registry.bootstrap(new_member(1)).await.unwrap();
    for i in 2..=4u8 {
        node1.registry.join(new_member(i)).await.unwrap();
    }

    // node2 takes over and node1 goes away
    consensus.set_leader(Some("node2".to_string()));
    let node2 = member("node2", &consensus);
    let changes = node2.registry.remove("node1").await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].name, "node4");
    assert_eq!(changes[0].to, Role::Voter);

    let err = node2.registry.remove("node2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // No leader: writes are refused rather than applied locally
    consensus.set_leader(None);
    let err = node2.registry.join(new_member(6)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(node1.registry.members().await.unwrap().len(), 3);
}
