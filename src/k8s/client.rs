//! Cluster access behind a small trait so the manager and the tests never
//! talk to the Kubernetes API types directly.

use std::path::Path;

use async_trait::async_trait;
use futures::future;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Pod};

/// List of pods, as returned by label-selector queries against the cluster.
pub type PodList = k8s_openapi::List<Pod>;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Config};
use tracing::debug;

use crate::error::{Error, Result};

/// A change to a single watched object.
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    Applied(K),
    Deleted(K),
}

/// Long-lived, push-based change feed for one watched resource instance.
pub type EventStream<K> = BoxStream<'static, Result<ResourceEvent<K>>>;

/// Abstract access to the two resource families the templates can reference.
///
/// Watch streams are expected to survive server-side stream termination; the
/// production implementation reconnects internally and surfaces transient
/// failures as `Err` items.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints>;

    async fn watch_endpoints(&self, namespace: &str, name: &str) -> Result<EventStream<Endpoints>>;

    /// Label selectors use the `key=value,key2=value2` syntax.
    async fn get_pods_by_labels(&self, namespace: &str, selector: &str) -> Result<PodList>;

    async fn watch_pods_by_labels(&self, namespace: &str, selector: &str) -> Result<EventStream<Pod>>;
}

/// `ClusterClient` backed by a real API server connection.
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from an explicit kubeconfig path, or from the usual
    /// defaults ($KUBECONFIG, ~/.kube/config, in-cluster) when none is given.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the kubeconfig cannot be read or no usable
    /// configuration can be inferred.
    pub async fn from_kubeconfig(kubeconfig: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                debug!(path = %path.display(), "loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => Config::infer().await?,
        };
        Ok(Self::new(Client::try_from(config)?))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Endpoints> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn watch_endpoints(&self, namespace: &str, name: &str) -> Result<EventStream<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        Ok(watcher(api, config)
            .default_backoff()
            .filter_map(|event| future::ready(map_event(event)))
            .boxed())
    }

    async fn get_pods_by_labels(&self, namespace: &str, selector: &str) -> Result<PodList> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(PodList {
            items: pods.items,
            metadata: pods.metadata,
        })
    }

    async fn watch_pods_by_labels(&self, namespace: &str, selector: &str) -> Result<EventStream<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().labels(selector);
        Ok(watcher(api, config)
            .default_backoff()
            .filter_map(|event| future::ready(map_event(event)))
            .boxed())
    }
}

fn map_event<K>(
    event: std::result::Result<watcher::Event<K>, watcher::Error>,
) -> Option<Result<ResourceEvent<K>>> {
    match event {
        Ok(watcher::Event::Apply(object) | watcher::Event::InitApply(object)) => {
            Some(Ok(ResourceEvent::Applied(object)))
        }
        Ok(watcher::Event::Delete(object)) => Some(Ok(ResourceEvent::Deleted(object))),
        Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
        Err(error) => Some(Err(Error::Watch(error))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Client whose watches never produce events; tests seed the store
    /// directly instead.
    pub(crate) struct IdleClient;

    #[async_trait]
    impl ClusterClient for IdleClient {
        async fn get_endpoints(&self, _namespace: &str, _name: &str) -> Result<Endpoints> {
            Ok(Endpoints::default())
        }

        async fn watch_endpoints(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<EventStream<Endpoints>> {
            Ok(futures::stream::pending().boxed())
        }

        async fn get_pods_by_labels(&self, _namespace: &str, _selector: &str) -> Result<PodList> {
            Ok(PodList::default())
        }

        async fn watch_pods_by_labels(
            &self,
            _namespace: &str,
            _selector: &str,
        ) -> Result<EventStream<Pod>> {
            Ok(futures::stream::pending().boxed())
        }
    }
}
