//! A scriptable in-memory cluster and the collaborator mocks built on it.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use docbase::cluster::bucket::{BucketAttachment, BucketFactory};
use docbase::cluster::config::{
    ClusterMap, NetworkResolution, NodeAdapter, NodeLocator, ServicePorts,
};
use docbase::cluster::node::{BucketKind, Endpoint, NodeCapabilities, NodeHandle};
use docbase::errors::ConnectError;
use docbase::network::{ClusterNodeFactory, DnsResolver, NodeConnection};
use docbase::{ClusterCore, ClusterOptions, Services};

fn all_capabilities() -> NodeCapabilities {
    NodeCapabilities {
        kv: true,
        query: true,
        search: true,
        analytics: true,
        views: true,
        eventing: true,
        collections: true,
        preserve_ttl: true,
    }
}

/// Server-side state shared by every mocked connection.
pub(crate) struct MockCluster {
    global: Mutex<Option<ClusterMap>>,
    bucket_maps: Mutex<HashMap<String, ClusterMap>>,
    capabilities: Mutex<NodeCapabilities>,
    unreachable_hosts: Mutex<HashSet<String>>,
    refused_kinds: Mutex<HashSet<BucketKind>>,
    select_errors: Mutex<HashMap<String, ConnectError>>,
    global_fetch_error: Mutex<Option<ConnectError>>,
    hang_connects: AtomicBool,
    connects: AtomicUsize,
    select_calls: AtomicUsize,
}

impl MockCluster {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockCluster {
            global: Mutex::new(None),
            bucket_maps: Mutex::new(HashMap::new()),
            capabilities: Mutex::new(all_capabilities()),
            unreachable_hosts: Mutex::new(HashSet::new()),
            refused_kinds: Mutex::new(HashSet::new()),
            select_errors: Mutex::new(HashMap::new()),
            global_fetch_error: Mutex::new(None),
            hang_connects: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            select_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_global(&self, map: ClusterMap) {
        *self.global.lock().unwrap() = Some(map);
    }

    pub(crate) fn set_bucket_map(&self, map: ClusterMap) {
        let name = map.bucket.clone().expect("bucket maps carry a name");
        self.bucket_maps.lock().unwrap().insert(name, map);
    }

    pub(crate) fn set_capabilities(&self, capabilities: NodeCapabilities) {
        *self.capabilities.lock().unwrap() = capabilities;
    }

    pub(crate) fn make_unreachable(&self, host: &str) {
        self.unreachable_hosts
            .lock()
            .unwrap()
            .insert(host.to_owned());
    }

    pub(crate) fn refuse_kind(&self, kind: BucketKind) {
        self.refused_kinds.lock().unwrap().insert(kind);
    }

    pub(crate) fn fail_global_fetch(&self, error: ConnectError) {
        *self.global_fetch_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_select(&self, bucket: &str, error: ConnectError) {
        self.select_errors
            .lock()
            .unwrap()
            .insert(bucket.to_owned(), error);
    }

    pub(crate) fn hang_connects(&self) {
        self.hang_connects.store(true, Ordering::SeqCst);
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn select_count(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }
}

struct MockConnection {
    cluster: Arc<MockCluster>,
}

#[async_trait]
impl NodeConnection for MockConnection {
    fn capabilities(&self) -> NodeCapabilities {
        *self.cluster.capabilities.lock().unwrap()
    }

    async fn select_bucket(&self, bucket: &str) -> Result<(), ConnectError> {
        self.cluster.select_calls.fetch_add(1, Ordering::SeqCst);
        match self.cluster.select_errors.lock().unwrap().get(bucket) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn fetch_global_map(&self) -> Result<ClusterMap, ConnectError> {
        if let Some(err) = self.cluster.global_fetch_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.cluster
            .global
            .lock()
            .unwrap()
            .clone()
            .ok_or(ConnectError::BucketNotConnected)
    }

    async fn fetch_bucket_map(&self, bucket: &str) -> Result<ClusterMap, ConnectError> {
        self.cluster
            .bucket_maps
            .lock()
            .unwrap()
            .get(bucket)
            .cloned()
            .ok_or_else(|| ConnectError::Protocol(format!("unknown bucket {bucket:?}")))
    }

    fn shutdown(&self) {}
}

pub(crate) struct MockFactory {
    cluster: Arc<MockCluster>,
}

#[async_trait]
impl ClusterNodeFactory for MockFactory {
    async fn create_and_connect(
        &self,
        endpoint: &Endpoint,
        kind: BucketKind,
        adapter: Option<NodeAdapter>,
        cancel: &CancellationToken,
    ) -> Result<Arc<NodeHandle>, ConnectError> {
        self.cluster.connects.fetch_add(1, Ordering::SeqCst);
        if self.cluster.hang_connects.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(ConnectError::Cancelled);
        }
        if self
            .cluster
            .unreachable_hosts
            .lock()
            .unwrap()
            .contains(endpoint.host())
        {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "host down").into());
        }
        if self.cluster.refused_kinds.lock().unwrap().contains(&kind) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "port closed").into());
        }
        Ok(Arc::new(NodeHandle::new(
            endpoint.clone(),
            kind,
            Arc::new(MockConnection {
                cluster: Arc::clone(&self.cluster),
            }),
            adapter,
        )))
    }
}

pub(crate) struct MockDns {
    records: Vec<Endpoint>,
}

#[async_trait]
impl DnsResolver for MockDns {
    async fn resolve_srv(
        &self,
        _hostname: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Endpoint>, io::Error> {
        Ok(self.records.clone())
    }
}

#[derive(Default)]
pub(crate) struct CountingBucketFactory {
    created: AtomicUsize,
}

impl CountingBucketFactory {
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl BucketFactory for CountingBucketFactory {
    fn create(&self, name: &str, kind: BucketKind) -> Arc<BucketAttachment> {
        self.created.fetch_add(1, Ordering::SeqCst);
        BucketAttachment::new(name, kind)
    }
}

pub(crate) struct TestHarness {
    pub(crate) cluster: Arc<MockCluster>,
    pub(crate) bucket_factory: Arc<CountingBucketFactory>,
    pub(crate) core: ClusterCore,
}

pub(crate) fn harness(connection_string: &str) -> TestHarness {
    harness_with(connection_string, Vec::new(), false)
}

pub(crate) fn harness_with(
    connection_string: &str,
    srv_records: Vec<Endpoint>,
    enable_polling: bool,
) -> TestHarness {
    init_logging();
    let cluster = MockCluster::new();
    let bucket_factory = Arc::new(CountingBucketFactory::default());
    let services = Services::new(
        Arc::new(MockFactory {
            cluster: Arc::clone(&cluster),
        }),
        Arc::new(MockDns {
            records: srv_records,
        }),
    )
    .with_bucket_factory(Arc::clone(&bucket_factory) as Arc<dyn BucketFactory>);
    let options = ClusterOptions::builder()
        .connection_string(connection_string)
        .enable_config_polling(enable_polling)
        .build();
    let core = ClusterCore::new(options, services).expect("valid connection string");
    TestHarness {
        cluster,
        bucket_factory,
        core,
    }
}

pub(crate) fn adapter(host: &str) -> NodeAdapter {
    NodeAdapter {
        hostname: host.to_owned(),
        ports: ServicePorts {
            kv: Some(11210),
            kv_tls: Some(11207),
            ..Default::default()
        },
        alternate: None,
    }
}

pub(crate) fn global_map(rev: u64, hosts: &[&str]) -> ClusterMap {
    ClusterMap {
        bucket: None,
        rev,
        nodes: hosts.iter().map(|host| adapter(host)).collect(),
        locator: NodeLocator::VBucket,
        network: NetworkResolution::Default,
        is_global: false,
    }
}

pub(crate) fn bucket_map(name: &str, rev: u64, hosts: &[&str]) -> ClusterMap {
    ClusterMap {
        bucket: Some(name.to_owned()),
        rev,
        nodes: hosts.iter().map(|host| adapter(host)).collect(),
        locator: NodeLocator::VBucket,
        network: NetworkResolution::Default,
        is_global: false,
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Polls `condition` until it holds or a generous deadline passes.
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}
