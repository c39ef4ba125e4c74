//! Project and network enumeration

use async_trait::async_trait;
use hearth_cluster::ClusterStore;

use crate::error::NetworkResult;

/// Names of projects, networks and the listen addresses bound to them
#[async_trait]
pub trait NetworkDirectory: Send + Sync {
    /// Every project name
    async fn project_names(&self) -> NetworkResult<Vec<String>>;

    /// Names of the networks in `project`
    async fn network_names(&self, project: &str) -> NetworkResult<Vec<String>>;

    /// Listen addresses of the forwards on a network
    async fn forward_addresses(&self, network_id: i64) -> NetworkResult<Vec<String>>;

    /// Listen addresses of the load-balancers on a network
    async fn load_balancer_addresses(&self, network_id: i64) -> NetworkResult<Vec<String>>;
}

#[async_trait]
impl NetworkDirectory for ClusterStore {
    async fn project_names(&self) -> NetworkResult<Vec<String>> {
        Ok(self
            .transaction(self.transaction_timeout(), |tx| Ok(tx.project_names()))
            .await?)
    }

    async fn network_names(&self, project: &str) -> NetworkResult<Vec<String>> {
        Ok(self
            .transaction(self.transaction_timeout(), |tx| {
                Ok(tx
                    .networks(project)?
                    .into_iter()
                    .map(|network| network.name)
                    .collect())
            })
            .await?)
    }

    async fn forward_addresses(&self, network_id: i64) -> NetworkResult<Vec<String>> {
        Ok(self
            .transaction(self.transaction_timeout(), |tx| {
                Ok(tx
                    .forwards(network_id)
                    .into_iter()
                    .map(|forward| forward.listen_address)
                    .collect())
            })
            .await?)
    }

    async fn load_balancer_addresses(&self, network_id: i64) -> NetworkResult<Vec<String>> {
        Ok(self
            .transaction(self.transaction_timeout(), |tx| {
                Ok(tx
                    .load_balancers(network_id)
                    .into_iter()
                    .map(|lb| lb.listen_address)
                    .collect())
            })
            .await?)
    }
}
