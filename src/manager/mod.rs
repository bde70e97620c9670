/**
 * Cache manager and event fan-in.
 *
 * Exposes the lookups the template functions call, lazily starts a watch the
 * first time a key is referenced, and collapses bursts of watch events into
 * at most one outward change tick per coalescing window.
 */
pub mod store;
pub mod watchers;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;

use crate::k8s::client::PodList;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::Error as FatalError;
use crate::k8s::client::{ClusterClient, ResourceEvent};
use store::{Snapshot, Store};
use watchers::WatcherRegistry;

/// Window during which inbound watch signals collapse into one change tick.
pub const COALESCE_WINDOW: Duration = Duration::from_secs(2);

/// Marker text of the not-ready outcome; the renderer matches on it when a
/// template function raises it through the engine.
pub const NOT_READY_MARKER: &str = "data not ready";

const CHANNEL_CAPACITY: usize = 1;

/// Non-fatal and fatal outcomes of a template-function lookup.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The watch for this key has only just been started, or its first
    /// event has not arrived yet. The message must embed
    /// [`NOT_READY_MARKER`] for the renderer to recognise the outcome.
    #[error("{key}: data not ready")]
    NotReady { key: String },

    /// The stored snapshot does not have the shape this key implies.
    #[error("fetched data for {key} is corrupt")]
    Corrupt { key: String },
}

/// Receiving ends handed to the render loop: coalesced change ticks and the
/// first fatal error.
pub struct ManagerEvents {
    pub events: mpsc::Receiver<()>,
    pub errors: mpsc::Receiver<FatalError>,
}

/// Cheaply clonable handle; template functions capture one clone each.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn ClusterClient>,
    store: Store,
    watchers: WatcherRegistry,
    throttle_tx: mpsc::Sender<()>,
    error_tx: mpsc::Sender<FatalError>,
}

impl Inner {
    /// Signals the coalescer. A full throttle channel means it is already
    /// armed, so the signal can be dropped.
    fn pulse(&self) {
        if self.throttle_tx.try_send(()).is_err() {
            trace!("change signal dropped, coalescer already armed");
        }
    }
}

impl Manager {
    /// Creates the manager and spawns its coalescer task. Must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>) -> (Self, ManagerEvents) {
        let (throttle_tx, throttle_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(coalesce(throttle_rx, event_tx));

        let manager = Self {
            inner: Arc::new(Inner {
                client,
                store: Store::new(),
                watchers: WatcherRegistry::new(),
                throttle_tx,
                error_tx,
            }),
        };
        let events = ManagerEvents {
            events: event_rx,
            errors: error_rx,
        };
        (manager, events)
    }

    /// Looks up the endpoints snapshot for `namespace`/`name`, starting its
    /// watch on first reference.
    ///
    /// # Errors
    ///
    /// Will return `Err` while no snapshot has arrived yet, or if the
    /// stored snapshot has the wrong shape.
    pub fn endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<Endpoints, QueryError> {
        let key = format!("endpoints/{namespace}/{name}");
        if self.inner.watchers.add(&key) {
            self.spawn_endpoints_watcher(namespace.to_owned(), name.to_owned(), key.clone());
            return Err(QueryError::NotReady { key });
        }
        match self.inner.store.get(&key) {
            None => Err(QueryError::NotReady { key }),
            Some(Snapshot::Endpoints(endpoints)) => Ok(*endpoints),
            Some(Snapshot::Pods(_)) => Err(QueryError::Corrupt { key }),
        }
    }

    /// Looks up the pod list for `namespace` and a label selector of the
    /// form `key=value,key2=value2`, starting its watch on first reference.
    ///
    /// # Errors
    ///
    /// Will return `Err` while no snapshot has arrived yet, or if the
    /// stored snapshot has the wrong shape.
    pub fn pods_by_labels(
        &self,
        namespace: &str,
        selector: &str,
    ) -> std::result::Result<PodList, QueryError> {
        let key = format!("podsWithLabels/{namespace}/{selector}");
        if self.inner.watchers.add(&key) {
            self.spawn_pods_watcher(namespace.to_owned(), selector.to_owned(), key.clone());
            return Err(QueryError::NotReady { key });
        }
        match self.inner.store.get(&key) {
            None => Err(QueryError::NotReady { key }),
            Some(Snapshot::Pods(pods)) => Ok(*pods),
            Some(Snapshot::Endpoints(_)) => Err(QueryError::Corrupt { key }),
        }
    }

    fn spawn_endpoints_watcher(&self, namespace: String, name: String, key: String) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            debug!(%key, "starting endpoints watch");
            let mut events = match inner.client.watch_endpoints(&namespace, &name).await {
                Ok(events) => events,
                Err(error) => {
                    let _ = inner
                        .error_tx
                        .send(FatalError::WatchStart {
                            key,
                            source: Box::new(error),
                        })
                        .await;
                    return;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    Ok(ResourceEvent::Applied(endpoints) | ResourceEvent::Deleted(endpoints)) => {
                        inner
                            .store
                            .set(&key, Snapshot::Endpoints(Box::new(endpoints)));
                        inner.pulse();
                    }
                    Err(error) => warn!(%key, %error, "watch stream error"),
                }
            }
            debug!(%key, "endpoints watch stream closed");
        });
    }

    fn spawn_pods_watcher(&self, namespace: String, selector: String, key: String) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            debug!(%key, "starting pods watch");
            let mut events = match inner.client.watch_pods_by_labels(&namespace, &selector).await {
                Ok(events) => events,
                Err(error) => {
                    let _ = inner
                        .error_tx
                        .send(FatalError::WatchStart {
                            key,
                            source: Box::new(error),
                        })
                        .await;
                    return;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    // The event carries a single pod but templates see the
                    // whole filtered list, so refetch it on every change.
                    Ok(_) => match inner.client.get_pods_by_labels(&namespace, &selector).await {
                        Ok(pods) => {
                            inner.store.set(&key, Snapshot::Pods(Box::new(pods)));
                            inner.pulse();
                        }
                        Err(error) => {
                            let _ = inner
                                .error_tx
                                .send(FatalError::PodRefetch {
                                    key,
                                    source: Box::new(error),
                                })
                                .await;
                            return;
                        }
                    },
                    Err(error) => warn!(%key, %error, "watch stream error"),
                }
            }
            debug!(%key, "pods watch stream closed");
        });
    }

    #[cfg(test)]
    pub(crate) fn seed(&self, key: &str, snapshot: Snapshot) {
        self.inner.watchers.add(key);
        self.inner.store.set(key, snapshot);
    }
}

/// Collapses throttle signals: the first signal arms a timer, further
/// signals within the window are discarded, expiry publishes one tick.
async fn coalesce(mut throttle_rx: mpsc::Receiver<()>, event_tx: mpsc::Sender<()>) {
    while throttle_rx.recv().await.is_some() {
        let window = sleep(COALESCE_WINDOW);
        tokio::pin!(window);
        let mut open = true;
        loop {
            tokio::select! {
                () = &mut window => break,
                signal = throttle_rx.recv(), if open => match signal {
                    Some(()) => trace!("change signal discarded, coalescer armed"),
                    None => open = false,
                },
            }
        }
        if event_tx.try_send(()).is_err() {
            debug!("change tick dropped, previous tick still pending");
        }
        if !open {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::k8s::client::EventStream;
    use async_trait::async_trait;
    use futures::stream;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Pod, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct BurstClient {
        endpoints: Endpoints,
        pods: PodList,
        endpoints_events: usize,
        pods_events: usize,
        fail_pod_refetch: bool,
        endpoints_watches: AtomicUsize,
        pods_watches: AtomicUsize,
    }

    #[async_trait]
    impl ClusterClient for BurstClient {
        async fn get_endpoints(&self, _namespace: &str, _name: &str) -> Result<Endpoints> {
            Ok(self.endpoints.clone())
        }

        async fn watch_endpoints(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<EventStream<Endpoints>> {
            self.endpoints_watches.fetch_add(1, Ordering::SeqCst);
            let events: Vec<Result<ResourceEvent<Endpoints>>> = (0..self.endpoints_events)
                .map(|_| Ok(ResourceEvent::Applied(self.endpoints.clone())))
                .collect();
            Ok(stream::iter(events).chain(stream::pending()).boxed())
        }

        async fn get_pods_by_labels(&self, _namespace: &str, _selector: &str) -> Result<PodList> {
            if self.fail_pod_refetch {
                return Err(std::io::Error::other("pods lookup failed").into());
            }
            Ok(self.pods.clone())
        }

        async fn watch_pods_by_labels(
            &self,
            _namespace: &str,
            _selector: &str,
        ) -> Result<EventStream<Pod>> {
            self.pods_watches.fetch_add(1, Ordering::SeqCst);
            let events: Vec<Result<ResourceEvent<Pod>>> = (0..self.pods_events)
                .map(|_| Ok(ResourceEvent::Applied(Pod::default())))
                .collect();
            Ok(stream::iter(events).chain(stream::pending()).boxed())
        }
    }

    fn sample_endpoints() -> Endpoints {
        Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.100".to_owned(),
                    ..Default::default()
                }]),
                ports: Some(vec![EndpointPort {
                    name: Some("http".to_owned()),
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn sample_pods() -> PodList {
        PodList {
            items: vec![
                Pod {
                    metadata: ObjectMeta {
                        name: Some("pod-1".to_owned()),
                        ..Default::default()
                    },
                    status: Some(PodStatus {
                        pod_ip: Some("10.0.0.100".to_owned()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Pod {
                    metadata: ObjectMeta {
                        name: Some("pod-2".to_owned()),
                        ..Default::default()
                    },
                    status: Some(PodStatus {
                        pod_ip: Some("10.0.0.101".to_owned()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            metadata: Default::default(),
        }
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn watch_is_started_exactly_once_per_key() {
        let client = Arc::new(BurstClient {
            endpoints: sample_endpoints(),
            endpoints_events: 1,
            ..Default::default()
        });
        let (manager, _events) = Manager::new(client.clone());

        assert!(matches!(
            manager.endpoints("default", "haproxy"),
            Err(QueryError::NotReady { .. })
        ));
        wait_until(|| manager.endpoints("default", "haproxy").is_ok()).await;
        let _ = manager.endpoints("default", "haproxy");
        let _ = manager.endpoints("default", "haproxy");

        assert_eq!(client.endpoints_watches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn key_stays_ready_once_first_event_arrived() {
        let client = Arc::new(BurstClient {
            endpoints: sample_endpoints(),
            endpoints_events: 1,
            ..Default::default()
        });
        let (manager, _events) = Manager::new(client);

        wait_until(|| manager.endpoints("default", "haproxy").is_ok()).await;
        for _ in 0..10 {
            assert!(manager.endpoints("default", "haproxy").is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_collapses_to_one_tick() {
        let client = Arc::new(BurstClient {
            endpoints: sample_endpoints(),
            endpoints_events: 50,
            ..Default::default()
        });
        let (manager, mut events) = Manager::new(client);

        assert!(manager.endpoints("default", "haproxy").is_err());
        assert!(events.events.recv().await.is_some());

        sleep(COALESCE_WINDOW * 3).await;
        assert!(events.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pods_lookup_returns_the_full_refetched_list() {
        let client = Arc::new(BurstClient {
            pods: sample_pods(),
            pods_events: 1,
            ..Default::default()
        });
        let (manager, _events) = Manager::new(client.clone());

        assert!(manager.pods_by_labels("default", "app=nginx").is_err());
        wait_until(|| manager.pods_by_labels("default", "app=nginx").is_ok()).await;

        let pods = manager.pods_by_labels("default", "app=nginx").unwrap();
        assert_eq!(pods.items.len(), 2);
        assert_eq!(client.pods_watches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pod_refetch_failure_surfaces_on_the_error_channel() {
        let client = Arc::new(BurstClient {
            pods_events: 1,
            fail_pod_refetch: true,
            ..Default::default()
        });
        let (manager, mut events) = Manager::new(client);

        assert!(manager.pods_by_labels("default", "app=nginx").is_err());
        let error = events.errors.recv().await.expect("fatal error expected");
        assert!(matches!(
            error,
            FatalError::PodRefetch { ref key, .. } if key == "podsWithLabels/default/app=nginx"
        ));
    }

    #[test]
    fn not_ready_message_embeds_the_marker() {
        let error = QueryError::NotReady {
            key: "endpoints/default/haproxy".to_owned(),
        };
        assert!(error.to_string().contains(NOT_READY_MARKER));
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_snapshot_shape_is_corrupt() {
        let (manager, _events) = Manager::new(Arc::new(BurstClient::default()));
        manager.seed("endpoints/default/haproxy", Snapshot::Pods(Box::default()));

        let error = manager.endpoints("default", "haproxy").unwrap_err();
        assert_eq!(
            error.to_string(),
            "fetched data for endpoints/default/haproxy is corrupt"
        );
    }
}
