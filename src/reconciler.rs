//! Subscription manager: drives actual OPC UA state toward the desired model
//!
//! One reconcile loop runs per endpoint. Each tick snapshots the desired
//! items, acts on the live session under the endpoint lock, and commits the
//! resulting state transitions back to the store. Desired and actual
//! monitored items are matched by identity key, never by pointer.
//!
//! Lock order is NodeConfig → endpoint list → endpoint; the tick phases are
//! sequenced so no two of them are held at once and the store lock is never
//! held across network calls.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{BridgeError, BridgeResult};
use crate::hub::HubHandle;
use crate::metrics;
use crate::model::{
    endpoint_key, status, DesiredEndpoint, DesiredItem, EndpointAuth, EventSpec, ItemKey,
    ItemKind, ItemSettings, ItemState, NodeRef, SuppressedStatusCodes,
};
use crate::node_config::{NodeConfigStore, NodeDefaults};
use crate::shaping::{EventRecord, MessageRecord, TelemetryShaper};
use crate::stack::{
    DataChangeValue, ItemCreateSpec, SessionFactory, SessionObserver, SessionSettings,
    StackSession,
};
use crate::vault::CredentialVault;

/// Additions are applied to the server in batches of this many items, each
/// batch followed by SetPublishingMode + apply.
const ITEM_BATCH_SIZE: usize = 10_000;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Minimum wait between session connect attempts
    pub session_connect_wait: Duration,
    /// Consecutive keep-alive misses before an internal disconnect
    pub keep_alive_disconnect_threshold: u32,
    pub fetch_display_names: bool,
    pub operation_timeout: Duration,
    /// Idle cadence of the reconcile loop; desired-state changes wake it
    /// immediately
    pub reconcile_period: Duration,
    pub defaults: NodeDefaults,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            session_connect_wait: Duration::from_secs(10),
            keep_alive_disconnect_threshold: 5,
            fetch_display_names: false,
            operation_timeout: Duration::from_secs(120),
            reconcile_period: Duration::from_secs(1),
            defaults: NodeDefaults::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// heartbeat

#[derive(Default)]
struct HeartbeatState {
    record: Option<MessageRecord>,
    last_activity: Option<Instant>,
}

/// Shared between the notification path (updates) and the per-item heartbeat
/// task (re-emission).
struct HeartbeatCell {
    state: std::sync::Mutex<HeartbeatState>,
}

impl HeartbeatCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: std::sync::Mutex::new(HeartbeatState::default()),
        })
    }

    fn update(&self, record: MessageRecord) {
        let mut state = self.state.lock().unwrap();
        state.record = Some(record);
        state.last_activity = Some(Instant::now());
    }

    /// A refreshed copy of the last record when the node has been silent for
    /// at least `interval`. Emitting counts as activity so at most one
    /// synthetic record per interval is produced.
    fn take_due(&self, interval: Duration) -> Option<MessageRecord> {
        let mut state = self.state.lock().unwrap();
        let due = match (&state.record, state.last_activity) {
            (Some(_), Some(at)) => at.elapsed() >= interval,
            _ => false,
        };
        if !due {
            return None;
        }
        state.last_activity = Some(Instant::now());
        let mut record = state.record.clone().unwrap();
        record.source_timestamp = Some(Utc::now());
        Some(record)
    }
}

// ---------------------------------------------------------------------------
// notification routing

struct ItemRoute {
    node_id: Option<String>,
    expanded_node_id: Option<String>,
    display_name: Option<String>,
    /// Select-clause field names for event items
    event_field_names: Option<Vec<String>>,
    skip_next: AtomicBool,
    heartbeat: Option<Arc<HeartbeatCell>>,
}

/// Per-endpoint fan-in of stack callbacks. Runs on the stack's notification
/// threads: lookups are short, nothing blocks, nothing panics outward.
struct NotificationRouter {
    endpoint_url: String,
    routes: std::sync::RwLock<HashMap<u32, Arc<ItemRoute>>>,
    application_uri: std::sync::RwLock<String>,
    namespaces: std::sync::RwLock<Option<Arc<Vec<String>>>>,
    shaper: Arc<TelemetryShaper>,
    suppressed: Arc<SuppressedStatusCodes>,
    hub: HubHandle,
    missed: AtomicU64,
    missed_keep_alives: AtomicU32,
    keep_alive_threshold: u32,
    disconnect_requested: Arc<AtomicBool>,
    changed: Arc<Notify>,
}

impl NotificationRouter {
    fn register(&self, client_handle: u32, route: ItemRoute) {
        self.routes
            .write()
            .unwrap()
            .insert(client_handle, Arc::new(route));
    }

    fn unregister(&self, client_handle: u32) {
        self.routes.write().unwrap().remove(&client_handle);
    }

    fn clear(&self) {
        self.routes.write().unwrap().clear();
        *self.namespaces.write().unwrap() = None;
    }

    fn set_connection_info(&self, namespaces: Arc<Vec<String>>, application_uri: String) {
        *self.namespaces.write().unwrap() = Some(namespaces);
        *self.application_uri.write().unwrap() = application_uri;
        self.missed_keep_alives.store(0, Ordering::SeqCst);
    }

    fn current_namespaces(&self) -> Option<Arc<Vec<String>>> {
        self.namespaces.read().unwrap().clone()
    }

    fn request_disconnect(&self) {
        if !self.disconnect_requested.swap(true, Ordering::SeqCst) {
            self.changed.notify_one();
        }
    }

    fn missed_count(&self) -> u64 {
        self.missed.load(Ordering::SeqCst)
    }
}

impl SessionObserver for NotificationRouter {
    fn on_data_change(&self, client_handle: u32, value: DataChangeValue) {
        let route = match self.routes.read().unwrap().get(&client_handle) {
            Some(route) => route.clone(),
            None => return,
        };
        metrics::NOTIFICATIONS_RECEIVED
            .with_label_values(&[self.endpoint_url.as_str()])
            .inc();

        if self.suppressed.contains(value.status) {
            metrics::NOTIFICATIONS_SUPPRESSED.inc();
            return;
        }

        let record = TelemetryShaper::build_record(
            &self.endpoint_url,
            route.node_id.clone(),
            route.expanded_node_id.clone(),
            &self.application_uri.read().unwrap(),
            route.display_name.clone(),
            &value.value,
            value.source_timestamp,
            value.status,
        );

        if route.skip_next.swap(false, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint_url, "skipping first notification");
            return;
        }

        if let Some(cell) = &route.heartbeat {
            cell.update(record.clone());
        }

        let shaped = self.shaper.shape(&record);
        if !self.hub.enqueue(shaped) {
            self.missed.fetch_add(1, Ordering::SeqCst);
            metrics::MISSED_MESSAGES.inc();
        }
    }

    fn on_event(&self, client_handle: u32, fields: Vec<serde_json::Value>) {
        let route = match self.routes.read().unwrap().get(&client_handle) {
            Some(route) => route.clone(),
            None => return,
        };
        metrics::NOTIFICATIONS_RECEIVED
            .with_label_values(&[self.endpoint_url.as_str()])
            .inc();

        let names = route.event_field_names.clone().unwrap_or_default();
        let record = EventRecord {
            endpoint_url: self.endpoint_url.clone(),
            node_id: route.node_id.clone(),
            expanded_node_id: route.expanded_node_id.clone(),
            application_uri: self.application_uri.read().unwrap().clone(),
            display_name: route.display_name.clone(),
            fields: names.into_iter().zip(fields).collect(),
            receive_time: Utc::now(),
        };

        let shaped = self.shaper.shape_event(&record);
        if !self.hub.enqueue(shaped) {
            self.missed.fetch_add(1, Ordering::SeqCst);
            metrics::MISSED_MESSAGES.inc();
        }
    }

    fn on_keep_alive(&self, code: u32) {
        if status::is_good(code) {
            self.missed_keep_alives.store(0, Ordering::SeqCst);
            return;
        }
        let missed = self.missed_keep_alives.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            endpoint = %self.endpoint_url,
            missed,
            status = %status::symbol(code),
            "keep-alive missed"
        );
        if missed >= self.keep_alive_threshold {
            self.request_disconnect();
        }
    }

    fn on_connection_lost(&self, code: u32) {
        warn!(
            endpoint = %self.endpoint_url,
            status = %status::symbol(code),
            "connection lost"
        );
        self.request_disconnect();
    }
}

// ---------------------------------------------------------------------------
// actual state

struct SessionHandle {
    session: Arc<dyn StackSession>,
    namespaces: Arc<Vec<String>>,
}

struct ActualItem {
    client_handle: u32,
    server_id: u32,
    heartbeat_task: Option<JoinHandle<()>>,
}

struct SubscriptionActual {
    id: u32,
    revised_publishing_interval_ms: f64,
    items: HashMap<ItemKey, ActualItem>,
}

#[derive(Default)]
struct EndpointActual {
    session: Option<SessionHandle>,
    last_connect_attempt: Option<Instant>,
    /// Keyed by requested publishing interval
    subscriptions: HashMap<i32, SubscriptionActual>,
    next_client_handle: u32,
}

struct EndpointRuntime {
    url: String,
    key: String,
    changed: Arc<Notify>,
    disconnect_requested: Arc<AtomicBool>,
    router: Arc<NotificationRouter>,
    state: Mutex<EndpointActual>,
}

impl EndpointRuntime {
    fn new(
        url: &str,
        shaper: Arc<TelemetryShaper>,
        suppressed: Arc<SuppressedStatusCodes>,
        hub: HubHandle,
        keep_alive_threshold: u32,
    ) -> Arc<Self> {
        let changed = Arc::new(Notify::new());
        let disconnect_requested = Arc::new(AtomicBool::new(false));
        let router = Arc::new(NotificationRouter {
            endpoint_url: url.to_string(),
            routes: std::sync::RwLock::new(HashMap::new()),
            application_uri: std::sync::RwLock::new(String::new()),
            namespaces: std::sync::RwLock::new(None),
            shaper,
            suppressed,
            hub,
            missed: AtomicU64::new(0),
            missed_keep_alives: AtomicU32::new(0),
            keep_alive_threshold,
            disconnect_requested: disconnect_requested.clone(),
            changed: changed.clone(),
        });
        Arc::new(Self {
            url: url.to_string(),
            key: endpoint_key(url),
            changed,
            disconnect_requested,
            router,
            state: Mutex::new(EndpointActual {
                next_client_handle: 1,
                ..Default::default()
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// tick outcome

/// State transitions computed during the act phase, applied to the store in
/// the commit phase. Items are addressed by their original node text plus
/// the interval pair so commits survive concurrent store edits.
#[derive(Default)]
struct TickOutcome {
    namespaces: Option<Arc<Vec<String>>>,
    monitored: Vec<(String, i32, i32)>,
    permanent_failures: Vec<(String, i32, i32, u32)>,
    removed: Vec<(String, i32, i32)>,
    /// Internal disconnect happened: every Monitored item falls back to
    /// Unmonitored
    reset_all: bool,
    /// Session closed and nothing left desired
    endpoint_idle: bool,
}

struct Addition {
    original: String,
    sampling_ms: i32,
    publishing_ms: i32,
    key: ItemKey,
    spec: ItemCreateSpec,
    heartbeat_secs: u32,
    heartbeat_cell: Option<Arc<HeartbeatCell>>,
}

// ---------------------------------------------------------------------------
// public surface

#[derive(Clone, Debug, Default)]
pub struct PublishNodeSpec {
    pub node: String,
    pub sampling_interval_ms: Option<i32>,
    pub publishing_interval_ms: Option<i32>,
    pub display_name: Option<String>,
    pub heartbeat_interval_secs: Option<u32>,
    pub skip_first: Option<bool>,
    pub use_security: Option<bool>,
    pub auth: Option<EndpointAuth>,
    pub event: Option<EventSpec>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The node is already in the desired state
    AlreadyPublished,
    /// The change was queued for the reconcile loop
    Accepted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnpublishOutcome {
    Accepted(usize),
    UnknownNode,
    UnknownEndpoint,
}

/// Snapshot used by diagnostics and tests.
#[derive(Clone, Debug, Default)]
pub struct EndpointStatus {
    pub connected: bool,
    pub subscription_count: usize,
    pub monitored_count: usize,
    /// Requested publishing interval → server-revised value
    pub publishing_intervals: Vec<(i32, f64)>,
}

impl EndpointStatus {
    pub fn requested_intervals(&self) -> Vec<i32> {
        self.publishing_intervals.iter().map(|(i, _)| *i).collect()
    }
}

pub struct Bridge {
    config: BridgeConfig,
    factory: Arc<dyn SessionFactory>,
    vault: Arc<CredentialVault>,
    shaper: Arc<TelemetryShaper>,
    suppressed: Arc<SuppressedStatusCodes>,
    hub: HubHandle,
    store: Mutex<NodeConfigStore>,
    endpoints: RwLock<HashMap<String, Arc<EndpointRuntime>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Self-reference handed to spawned reconcile loops
    self_ref: Weak<Bridge>,
}

impl Bridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BridgeConfig,
        factory: Arc<dyn SessionFactory>,
        vault: Arc<CredentialVault>,
        shaper: Arc<TelemetryShaper>,
        suppressed: Arc<SuppressedStatusCodes>,
        hub: HubHandle,
        store: NodeConfigStore,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            factory,
            vault,
            shaper,
            suppressed,
            hub,
            store: Mutex::new(store),
            endpoints: RwLock::new(HashMap::new()),
            cancel,
            tasks: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn reconcile loops for every endpoint already in the store.
    pub async fn start(&self) {
        let endpoints: Vec<String> = {
            let store = self.store.lock().await;
            store.endpoints.iter().map(|e| e.url.clone()).collect()
        };
        for url in endpoints {
            self.ensure_endpoint(&url).await;
        }
    }

    pub async fn version(&self) -> u64 {
        self.store.lock().await.version()
    }

    pub async fn snapshot(&self) -> Vec<DesiredEndpoint> {
        self.store.lock().await.endpoints.clone()
    }

    /// Persist the running configuration when the version advanced.
    pub async fn save_if_changed(&self, path: &Path) -> BridgeResult<bool> {
        self.store.lock().await.save_to_file(path)
    }

    pub async fn missed_messages(&self, endpoint_url: &str) -> u64 {
        let key = endpoint_key(endpoint_url);
        match self.endpoints.read().await.get(&key) {
            Some(rt) => rt.router.missed_count(),
            None => 0,
        }
    }

    pub async fn endpoint_status(&self, endpoint_url: &str) -> Option<EndpointStatus> {
        let key = endpoint_key(endpoint_url);
        let rt = self.endpoints.read().await.get(&key)?.clone();
        let state = rt.state.lock().await;
        Some(EndpointStatus {
            connected: state.session.is_some(),
            subscription_count: state.subscriptions.len(),
            monitored_count: state.subscriptions.values().map(|s| s.items.len()).sum(),
            publishing_intervals: state
                .subscriptions
                .iter()
                .map(|(interval, sub)| (*interval, sub.revised_publishing_interval_ms))
                .collect(),
        })
    }

    /// Upsert a desired monitored item. Duplicate publishes of the same
    /// logical node (after canonicalisation) are reported as already
    /// published.
    pub async fn publish_node(
        &self,
        endpoint_url: &str,
        spec: PublishNodeSpec,
    ) -> BridgeResult<PublishOutcome> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::ShuttingDown);
        }
        let node = NodeRef::parse(&spec.node)?;
        let key = endpoint_key(endpoint_url);
        let namespaces = self.current_namespaces(&key).await;
        let ns_slice = namespaces.as_deref().map(|v| v.as_slice());

        let outcome = {
            let mut store = self.store.lock().await;
            if store.find(&key).is_none() {
                store.endpoints.push(DesiredEndpoint::new(
                    endpoint_url,
                    spec.use_security.unwrap_or(true),
                    spec.auth.clone().unwrap_or(EndpointAuth::Anonymous),
                ));
            }

            let defaults = self.config.defaults;
            let settings = ItemSettings {
                sampling_interval_ms: spec
                    .sampling_interval_ms
                    .unwrap_or(defaults.sampling_interval_ms),
                publishing_interval_ms: spec
                    .publishing_interval_ms
                    .unwrap_or(defaults.publishing_interval_ms),
                display_name: spec.display_name.clone(),
                heartbeat_interval_secs: spec
                    .heartbeat_interval_secs
                    .unwrap_or(defaults.heartbeat_interval_secs),
                skip_first: spec.skip_first.unwrap_or(defaults.skip_first),
                queue_size: 1,
                discard_oldest: true,
            };
            let kind = match spec.event.clone() {
                Some(event) => ItemKind::Event(event),
                None => ItemKind::Value,
            };
            let mut item = DesiredItem::new(node, kind, settings);
            // the session is connected: resolve the other form right away
            if let Some(ns) = ns_slice {
                match item.node.counterpart(ns) {
                    Some(counterpart) => {
                        item.counterpart = Some(counterpart);
                        item.state = ItemState::Unmonitored;
                    }
                    None => warn!(
                        endpoint = %endpoint_url,
                        node = %item.node.original(),
                        "namespace not in server table, resolution deferred"
                    ),
                }
            }

            let endpoint = store.find_mut(&key).unwrap();
            let item_key = item.key(ns_slice);
            if let Some(existing) = endpoint
                .items
                .iter_mut()
                .find(|i| i.state != ItemState::RemovalRequested && i.key(ns_slice) == item_key)
            {
                if existing.last_error.is_some() {
                    // a reconfigure retries a permanently failed node
                    existing.last_error = None;
                    store.bump();
                    PublishOutcome::Accepted
                } else {
                    PublishOutcome::AlreadyPublished
                }
            } else {
                endpoint.items.push(item);
                store.bump();
                PublishOutcome::Accepted
            }
        };

        if outcome == PublishOutcome::Accepted {
            self.ensure_endpoint(endpoint_url).await;
            self.notify_endpoint(&key).await;
        }
        Ok(outcome)
    }

    /// Mark every desired item for this node (any interval pair) for
    /// removal.
    pub async fn unpublish_node(
        &self,
        endpoint_url: &str,
        node_text: &str,
    ) -> BridgeResult<UnpublishOutcome> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::ShuttingDown);
        }
        let node = NodeRef::parse(node_text)?;
        let key = endpoint_key(endpoint_url);
        let namespaces = self.current_namespaces(&key).await;
        let ns_slice = namespaces.as_deref().map(|v| v.as_slice());
        let identity = node.identity(ns_slice);

        let outcome = {
            let mut store = self.store.lock().await;
            let Some(endpoint) = store.find_mut(&key) else {
                return Ok(UnpublishOutcome::UnknownEndpoint);
            };
            let mut marked = 0;
            for item in endpoint.items.iter_mut() {
                if item.state != ItemState::RemovalRequested
                    && item.node.identity(ns_slice) == identity
                {
                    item.state = ItemState::RemovalRequested;
                    marked += 1;
                }
            }
            if marked == 0 {
                return Ok(UnpublishOutcome::UnknownNode);
            }
            store.bump();
            UnpublishOutcome::Accepted(marked)
        };

        self.notify_endpoint(&key).await;
        Ok(outcome)
    }

    /// Mark every item on one endpoint, or on all endpoints, for removal.
    pub async fn unpublish_all(&self, endpoint_url: Option<&str>) -> BridgeResult<usize> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::ShuttingDown);
        }
        let filter = endpoint_url.map(endpoint_key);
        let mut touched_keys = Vec::new();
        let marked = {
            let mut store = self.store.lock().await;
            if let Some(filter) = &filter {
                if !store.endpoints.iter().any(|e| &endpoint_key(&e.url) == filter) {
                    return Err(BridgeError::UnknownEndpoint(
                        endpoint_url.unwrap().to_string(),
                    ));
                }
            }
            let mut marked = 0;
            for endpoint in store.endpoints.iter_mut() {
                let ep_key = endpoint_key(&endpoint.url);
                if let Some(filter) = &filter {
                    if &ep_key != filter {
                        continue;
                    }
                }
                for item in endpoint.items.iter_mut() {
                    if item.state != ItemState::RemovalRequested {
                        item.state = ItemState::RemovalRequested;
                        marked += 1;
                    }
                }
                touched_keys.push(ep_key);
            }
            if marked > 0 {
                store.bump();
            }
            marked
        };

        for key in &touched_keys {
            self.notify_endpoint(key).await;
        }
        Ok(marked)
    }

    /// Cancel and join every reconcile loop; sessions close cleanly.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn current_namespaces(&self, key: &str) -> Option<Arc<Vec<String>>> {
        self.endpoints
            .read()
            .await
            .get(key)
            .and_then(|rt| rt.router.current_namespaces())
    }

    async fn notify_endpoint(&self, key: &str) {
        if let Some(rt) = self.endpoints.read().await.get(key) {
            rt.changed.notify_one();
        }
    }

    async fn ensure_endpoint(&self, url: &str) {
        let Some(bridge) = self.self_ref.upgrade() else {
            return;
        };
        let key = endpoint_key(url);
        let mut map = self.endpoints.write().await;
        if map.contains_key(&key) {
            return;
        }
        let rt = EndpointRuntime::new(
            url,
            self.shaper.clone(),
            self.suppressed.clone(),
            self.hub.clone(),
            self.config.keep_alive_disconnect_threshold,
        );
        map.insert(key, rt.clone());
        drop(map);

        let task = tokio::spawn(async move { bridge.endpoint_loop(rt).await });
        self.tasks.lock().await.push(task);
    }

    async fn endpoint_loop(self: Arc<Self>, rt: Arc<EndpointRuntime>) {
        info!(endpoint = %rt.url, "reconcile loop started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.tick(&rt).await {
                info!(endpoint = %rt.url, "endpoint retired");
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = rt.changed.notified() => {}
                _ = tokio::time::sleep(self.config.reconcile_period) => {}
            }
        }
        let mut state = rt.state.lock().await;
        self.close_session(&rt, &mut state, true).await;
        info!(endpoint = %rt.url, "reconcile loop stopped");
    }

    /// One reconcile tick. Returns true when the endpoint is gone and the
    /// loop should exit.
    async fn tick(&self, rt: &Arc<EndpointRuntime>) -> bool {
        // phase 1: snapshot the desired state (store lock only)
        let desired = {
            let store = self.store.lock().await;
            store
                .find(&rt.key)
                .map(|e| (e.items.clone(), e.use_security, e.auth.clone()))
        };
        let Some((items, use_security, auth)) = desired else {
            let mut state = rt.state.lock().await;
            self.close_session(rt, &mut state, true).await;
            drop(state);
            self.endpoints.write().await.remove(&rt.key);
            return true;
        };

        // phase 2: act on the session (endpoint-list read + endpoint lock)
        let outcome = {
            let _endpoints = self.endpoints.read().await;
            let mut state = rt.state.lock().await;
            let outcome = self
                .reconcile_actual(rt, &mut state, &items, use_security, &auth)
                .await;
            Self::prune_orphan_routes(rt, &state);
            outcome
        };

        // phase 3: commit state transitions (store lock only)
        self.commit(rt, outcome).await
    }

    async fn reconcile_actual(
        &self,
        rt: &Arc<EndpointRuntime>,
        state: &mut EndpointActual,
        items: &[DesiredItem],
        use_security: bool,
        auth: &EndpointAuth,
    ) -> TickOutcome {
        let mut out = TickOutcome::default();

        // internal disconnect requested by keep-alive/connection callbacks
        if rt.disconnect_requested.swap(false, Ordering::SeqCst) && state.session.is_some() {
            warn!(endpoint = %rt.url, "internal disconnect, resetting session state");
            self.close_session(rt, state, false).await;
            out.reset_all = true;
            rt.changed.notify_one();
            return out;
        }

        let active: Vec<&DesiredItem> = items
            .iter()
            .filter(|i| i.state != ItemState::RemovalRequested)
            .collect();
        let eligible_exists = active.iter().any(|i| i.last_error.is_none());

        // without a session nothing is actually monitored, so pending
        // removals complete immediately
        if state.session.is_none() {
            for item in items.iter().filter(|i| i.state == ItemState::RemovalRequested) {
                out.removed.push((
                    item.node.original(),
                    item.settings.sampling_interval_ms,
                    item.settings.publishing_interval_ms,
                ));
            }
        }

        // step 1: session health
        if state.session.is_none() {
            if !eligible_exists {
                out.endpoint_idle = active.is_empty();
                return out;
            }
            if let Some(at) = state.last_connect_attempt {
                if at.elapsed() < self.config.session_connect_wait {
                    return out;
                }
            }
            state.last_connect_attempt = Some(Instant::now());

            let credentials = match auth {
                EndpointAuth::Anonymous => None,
                EndpointAuth::UsernamePassword(encrypted) => {
                    match self.vault.decrypt(encrypted) {
                        Ok(credential) => Some(credential),
                        Err(e) => {
                            error!(endpoint = %rt.url, error = %e, "credential decrypt failed, endpoint stays disconnected");
                            return out;
                        }
                    }
                }
            };
            let settings = SessionSettings {
                endpoint_url: rt.url.clone(),
                use_security,
                credentials,
                operation_timeout: self.config.operation_timeout,
            };
            let observer: Arc<dyn SessionObserver> = rt.router.clone();
            match self.factory.connect(&settings, observer).await {
                Ok(session) => {
                    let namespaces = match session.namespace_array().await {
                        Ok(ns) => Arc::new(ns),
                        Err(e) => {
                            warn!(endpoint = %rt.url, error = %e, "namespace table fetch failed");
                            session.disconnect().await;
                            return out;
                        }
                    };
                    let application_uri = session.application_uri().await.unwrap_or_default();
                    rt.router
                        .set_connection_info(namespaces.clone(), application_uri);
                    rt.disconnect_requested.store(false, Ordering::SeqCst);
                    state.session = Some(SessionHandle {
                        session,
                        namespaces,
                    });
                    metrics::CONNECTED_ENDPOINTS.inc();
                    info!(endpoint = %rt.url, "session connected");
                }
                Err(e) => {
                    info!(endpoint = %rt.url, error = %e, "session connect failed");
                    return out;
                }
            }
        }

        let Some(handle) = &state.session else {
            return out;
        };
        let session = handle.session.clone();
        let namespaces = handle.namespaces.clone();
        out.namespaces = Some(namespaces.clone());

        // step 3: subscription provisioning per requested publishing interval
        let wanted: BTreeSet<i32> = active
            .iter()
            .filter(|i| i.last_error.is_none())
            .map(|i| i.settings.publishing_interval_ms)
            .collect();
        for interval in &wanted {
            if state.subscriptions.contains_key(interval) {
                continue;
            }
            match session.create_subscription(*interval as f64).await {
                Ok(created) => {
                    debug!(
                        endpoint = %rt.url,
                        requested_ms = interval,
                        revised_ms = created.revised_publishing_interval_ms,
                        subscription = created.id,
                        "subscription created"
                    );
                    state.subscriptions.insert(
                        *interval,
                        SubscriptionActual {
                            id: created.id,
                            revised_publishing_interval_ms: created
                                .revised_publishing_interval_ms,
                            items: HashMap::new(),
                        },
                    );
                }
                Err(e) => {
                    self.stack_error_invalidates(rt, &e, "create subscription");
                    return out;
                }
            }
        }

        // steps 2+4: resolve namespaces and add missing monitored items
        let additions = self.collect_additions(rt, state, &active, &namespaces);
        if !additions.is_empty()
            && !self
                .apply_additions(rt, state, &session, additions, &mut out)
                .await
        {
            return out;
        }

        // step 5: removals, one batch per subscription
        if !self.apply_removals(rt, state, &session, items, &namespaces, &mut out).await {
            return out;
        }

        // step 6: prune empty subscriptions
        let prunable: Vec<i32> = state
            .subscriptions
            .iter()
            .filter(|(interval, sub)| sub.items.is_empty() && !wanted.contains(interval))
            .map(|(interval, _)| *interval)
            .collect();
        for interval in prunable {
            let id = state.subscriptions[&interval].id;
            match session.delete_subscription(id).await {
                Ok(()) => {
                    debug!(endpoint = %rt.url, subscription = id, "subscription pruned");
                    state.subscriptions.remove(&interval);
                }
                Err(e) => {
                    if self.stack_error_invalidates(rt, &e, "delete subscription") {
                        return out;
                    }
                }
            }
        }

        // step 7: prune the session when it carries no subscriptions
        if state.subscriptions.is_empty() && !eligible_exists {
            self.close_session(rt, state, true).await;
            out.endpoint_idle = active.is_empty();
        }

        out
    }

    fn collect_additions(
        &self,
        rt: &Arc<EndpointRuntime>,
        state: &mut EndpointActual,
        active: &[&DesiredItem],
        namespaces: &Arc<Vec<String>>,
    ) -> Vec<Addition> {
        let mut additions = Vec::new();
        for item in active {
            if item.last_error.is_some() {
                continue;
            }
            let key = item.key(Some(namespaces.as_slice()));
            let already = state
                .subscriptions
                .get(&item.settings.publishing_interval_ms)
                .map(|sub| sub.items.contains_key(&key))
                // no subscription yet (creation failed): retry next tick
                .unwrap_or(true);
            if already {
                continue;
            }

            let resolved = item
                .node
                .resolve(namespaces)
                .or_else(|| {
                    item.counterpart
                        .as_ref()
                        .and_then(|c| c.resolve(namespaces))
                });
            let Some(resolved) = resolved else {
                warn!(
                    endpoint = %rt.url,
                    node = %item.node.original(),
                    "namespace not present on server, resolution deferred"
                );
                continue;
            };

            let client_handle = state.next_client_handle;
            state.next_client_handle = state.next_client_handle.wrapping_add(1).max(1);

            let event_filter = match &item.kind {
                ItemKind::Value => None,
                ItemKind::Event(spec) => Some(spec.clone()),
            };
            let heartbeat_secs = item.settings.heartbeat_interval_secs;
            additions.push(Addition {
                original: item.node.original(),
                sampling_ms: item.settings.sampling_interval_ms,
                publishing_ms: item.settings.publishing_interval_ms,
                key,
                spec: ItemCreateSpec {
                    client_handle,
                    node: resolved,
                    sampling_interval_ms: item.settings.sampling_interval_ms as f64,
                    queue_size: item.settings.queue_size,
                    discard_oldest: item.settings.discard_oldest,
                    event_filter,
                },
                heartbeat_secs,
                heartbeat_cell: (heartbeat_secs > 0).then(HeartbeatCell::new),
            });

            // routes exist before the server can deliver the first
            // notification
            let node_id = item.node_id_string().or_else(|| {
                item.node
                    .counterpart(namespaces)
                    .and_then(|c| c.node_id_string())
            });
            let expanded = item.expanded_string().or_else(|| {
                item.node
                    .counterpart(namespaces)
                    .and_then(|c| c.expanded_string())
            });
            rt.router.register(
                client_handle,
                ItemRoute {
                    node_id,
                    expanded_node_id: expanded,
                    display_name: item.settings.display_name.clone(),
                    event_field_names: match &item.kind {
                        ItemKind::Value => None,
                        ItemKind::Event(spec) => Some(
                            spec.select_clauses.iter().map(|c| c.field_name()).collect(),
                        ),
                    },
                    skip_next: AtomicBool::new(item.settings.skip_first),
                    heartbeat: additions.last().unwrap().heartbeat_cell.clone(),
                },
            );
        }
        additions
    }

    /// Create monitored items in server batches. Returns false when the
    /// session was invalidated and the tick must stop.
    async fn apply_additions(
        &self,
        rt: &Arc<EndpointRuntime>,
        state: &mut EndpointActual,
        session: &Arc<dyn StackSession>,
        mut additions: Vec<Addition>,
        out: &mut TickOutcome,
    ) -> bool {
        if self.config.fetch_display_names {
            let missing: Vec<usize> = additions
                .iter()
                .enumerate()
                .filter(|(_, a)| a.spec.event_filter.is_none())
                .filter(|(_, a)| {
                    rt.router
                        .routes
                        .read()
                        .unwrap()
                        .get(&a.spec.client_handle)
                        .map(|r| r.display_name.is_none())
                        .unwrap_or(false)
                })
                .map(|(i, _)| i)
                .collect();
            if !missing.is_empty() {
                let nodes: Vec<_> = missing
                    .iter()
                    .map(|i| additions[*i].spec.node.clone())
                    .collect();
                match session.read_display_names(&nodes).await {
                    Ok(names) => {
                        let mut routes = rt.router.routes.write().unwrap();
                        for (slot, name) in missing.iter().zip(names) {
                            let Some(name) = name else { continue };
                            let handle = additions[*slot].spec.client_handle;
                            if let Some(route) = routes.remove(&handle) {
                                let mut route =
                                    Arc::try_unwrap(route).unwrap_or_else(|arc| ItemRoute {
                                        node_id: arc.node_id.clone(),
                                        expanded_node_id: arc.expanded_node_id.clone(),
                                        display_name: arc.display_name.clone(),
                                        event_field_names: arc.event_field_names.clone(),
                                        skip_next: AtomicBool::new(
                                            arc.skip_next.load(Ordering::SeqCst),
                                        ),
                                        heartbeat: arc.heartbeat.clone(),
                                    });
                                route.display_name = Some(name);
                                routes.insert(handle, Arc::new(route));
                            }
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %rt.url, error = %e, "display-name fetch failed");
                    }
                }
            }
        }

        // group per target subscription, then batch
        let mut grouped: HashMap<i32, Vec<Addition>> = HashMap::new();
        for addition in additions.drain(..) {
            grouped.entry(addition.publishing_ms).or_default().push(addition);
        }

        for (publishing_ms, group) in grouped {
            let Some(subscription_id) = state.subscriptions.get(&publishing_ms).map(|s| s.id)
            else {
                for addition in &group {
                    rt.router.unregister(addition.spec.client_handle);
                }
                continue;
            };

            let mut queue = group;
            while !queue.is_empty() {
                let chunk: Vec<Addition> =
                    queue.drain(..queue.len().min(ITEM_BATCH_SIZE)).collect();
                let specs: Vec<ItemCreateSpec> = chunk.iter().map(|a| a.spec.clone()).collect();

                let results = match session
                    .create_monitored_items(subscription_id, specs)
                    .await
                {
                    Ok(results) => results,
                    Err(e) => {
                        for addition in &chunk {
                            rt.router.unregister(addition.spec.client_handle);
                        }
                        return !self.stack_error_invalidates(rt, &e, "create monitored items");
                    }
                };

                for (addition, result) in chunk.into_iter().zip(results) {
                    if status::invalidates_session(result.status) {
                        warn!(
                            endpoint = %rt.url,
                            status = %status::symbol(result.status),
                            "monitored item add invalidated the session"
                        );
                        rt.router.unregister(addition.spec.client_handle);
                        rt.router.request_disconnect();
                        return false;
                    }
                    if status::is_permanent_node_error(result.status) {
                        warn!(
                            endpoint = %rt.url,
                            node = %addition.original,
                            status = %status::symbol(result.status),
                            "node rejected by server, not retried until reconfiguration"
                        );
                        rt.router.unregister(addition.spec.client_handle);
                        out.permanent_failures.push((
                            addition.original,
                            addition.sampling_ms,
                            addition.publishing_ms,
                            result.status,
                        ));
                        continue;
                    }
                    if !status::is_good(result.status) {
                        warn!(
                            endpoint = %rt.url,
                            node = %addition.original,
                            status = %status::symbol(result.status),
                            "monitored item add failed, will retry"
                        );
                        rt.router.unregister(addition.spec.client_handle);
                        continue;
                    }

                    let heartbeat_task = addition.heartbeat_cell.as_ref().map(|cell| {
                        self.spawn_heartbeat(cell.clone(), addition.heartbeat_secs)
                    });
                    debug!(
                        endpoint = %rt.url,
                        node = %addition.original,
                        revised_sampling_ms = result.revised_sampling_interval_ms,
                        "monitored item active"
                    );
                    state
                        .subscriptions
                        .get_mut(&addition.publishing_ms)
                        .unwrap()
                        .items
                        .insert(
                            addition.key,
                            ActualItem {
                                client_handle: addition.spec.client_handle,
                                server_id: result.server_id,
                                heartbeat_task,
                            },
                        );
                    metrics::MONITORED_ITEMS.inc();
                    out.monitored.push((
                        addition.original,
                        addition.sampling_ms,
                        addition.publishing_ms,
                    ));
                }

                if let Err(e) = session.apply_publishing(&[subscription_id]).await {
                    if self.stack_error_invalidates(rt, &e, "apply publishing") {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Remove monitored items whose desired entries are marked for removal.
    /// Returns false when the session was invalidated.
    async fn apply_removals(
        &self,
        rt: &Arc<EndpointRuntime>,
        state: &mut EndpointActual,
        session: &Arc<dyn StackSession>,
        items: &[DesiredItem],
        namespaces: &Arc<Vec<String>>,
        out: &mut TickOutcome,
    ) -> bool {
        let removals: Vec<(ItemKey, String, i32, i32)> = items
            .iter()
            .filter(|i| i.state == ItemState::RemovalRequested)
            .map(|i| {
                (
                    i.key(Some(namespaces.as_slice())),
                    i.node.original(),
                    i.settings.sampling_interval_ms,
                    i.settings.publishing_interval_ms,
                )
            })
            .collect();
        if removals.is_empty() {
            return true;
        }

        for (key, original, sampling, publishing) in removals {
            let Some(sub) = state.subscriptions.get_mut(&publishing) else {
                // never monitored; just forget it
                out.removed.push((original, sampling, publishing));
                continue;
            };
            let Some(actual) = sub.items.get(&key) else {
                out.removed.push((original, sampling, publishing));
                continue;
            };
            let subscription_id = sub.id;
            let server_id = actual.server_id;
            match session
                .delete_monitored_items(subscription_id, &[server_id])
                .await
            {
                Ok(()) => {
                    let actual = sub.items.remove(&key).unwrap();
                    if let Some(task) = actual.heartbeat_task {
                        task.abort();
                    }
                    rt.router.unregister(actual.client_handle);
                    metrics::MONITORED_ITEMS.dec();
                    debug!(endpoint = %rt.url, node = %original, "monitored item removed");
                    out.removed.push((original, sampling, publishing));
                }
                Err(e) => {
                    if self.stack_error_invalidates(rt, &e, "delete monitored items") {
                        return false;
                    }
                }
            }
        }
        true
    }

    async fn commit(&self, rt: &Arc<EndpointRuntime>, outcome: TickOutcome) -> bool {
        let mut store = self.store.lock().await;
        let Some(endpoint) = store.find_mut(&rt.key) else {
            return false;
        };

        if outcome.reset_all {
            for item in endpoint.items.iter_mut() {
                if item.state == ItemState::Monitored {
                    item.state = ItemState::Unmonitored;
                }
            }
        }

        if let Some(namespaces) = &outcome.namespaces {
            for item in endpoint.items.iter_mut() {
                if item.state == ItemState::UnmonitoredNamespaceUpdateRequested {
                    match item.node.counterpart(namespaces) {
                        Some(counterpart) => {
                            item.counterpart = Some(counterpart);
                            item.state = ItemState::Unmonitored;
                        }
                        None => warn!(
                            endpoint = %rt.url,
                            node = %item.node.original(),
                            "namespace resolution still pending, retrying next tick"
                        ),
                    }
                }
            }
        }

        let matches = |item: &DesiredItem, original: &str, sampling: i32, publishing: i32| {
            item.node.original() == original
                && item.settings.sampling_interval_ms == sampling
                && item.settings.publishing_interval_ms == publishing
        };

        for (original, sampling, publishing) in &outcome.monitored {
            if let Some(item) = endpoint
                .items
                .iter_mut()
                .find(|i| matches(i, original, *sampling, *publishing))
            {
                if item.state != ItemState::RemovalRequested {
                    item.state = ItemState::Monitored;
                }
            }
        }

        for (original, sampling, publishing, code) in &outcome.permanent_failures {
            if let Some(item) = endpoint
                .items
                .iter_mut()
                .find(|i| matches(i, original, *sampling, *publishing))
            {
                item.last_error = Some(*code);
                if item.state == ItemState::Monitored {
                    item.state = ItemState::Unmonitored;
                }
            }
        }

        for (original, sampling, publishing) in &outcome.removed {
            endpoint.items.retain(|i| {
                !(i.state == ItemState::RemovalRequested
                    && matches(i, original, *sampling, *publishing))
            });
        }

        if endpoint.items.is_empty() && outcome.endpoint_idle {
            store.remove_endpoint(&rt.key);
            drop(store);
            self.endpoints.write().await.remove(&rt.key);
            return true;
        }
        false
    }

    /// Drop routes whose monitored item never materialised (failed batch,
    /// early tick exit). Keeps the routing table congruent with the actual
    /// item set.
    fn prune_orphan_routes(rt: &Arc<EndpointRuntime>, state: &EndpointActual) {
        if state.session.is_none() {
            return;
        }
        let live: HashSet<u32> = state
            .subscriptions
            .values()
            .flat_map(|sub| sub.items.values().map(|i| i.client_handle))
            .collect();
        rt.router
            .routes
            .write()
            .unwrap()
            .retain(|handle, _| live.contains(handle));
    }

    /// Classify a stack error: session-invalidation errors request an
    /// internal disconnect and return true.
    fn stack_error_invalidates(
        &self,
        rt: &Arc<EndpointRuntime>,
        error: &crate::stack::StackError,
        context: &str,
    ) -> bool {
        match error.status() {
            Some(code) if status::invalidates_session(code) => {
                warn!(
                    endpoint = %rt.url,
                    context,
                    status = %status::symbol(code),
                    "session invalidated"
                );
                rt.router.request_disconnect();
                true
            }
            _ => {
                warn!(endpoint = %rt.url, context, error = %error, "stack call failed");
                false
            }
        }
    }

    async fn close_session(
        &self,
        rt: &Arc<EndpointRuntime>,
        state: &mut EndpointActual,
        clean: bool,
    ) {
        if let Some(handle) = state.session.take() {
            if clean {
                let ids: Vec<u32> = state.subscriptions.values().map(|s| s.id).collect();
                for id in ids {
                    let _ = handle.session.delete_subscription(id).await;
                }
            }
            handle.session.disconnect().await;
            metrics::CONNECTED_ENDPOINTS.dec();
            info!(endpoint = %rt.url, "session closed");
        }
        for sub in state.subscriptions.values_mut() {
            for item in sub.items.values_mut() {
                if let Some(task) = item.heartbeat_task.take() {
                    task.abort();
                }
                metrics::MONITORED_ITEMS.dec();
            }
        }
        state.subscriptions.clear();
        rt.router.clear();
    }

    fn spawn_heartbeat(&self, cell: Arc<HeartbeatCell>, interval_secs: u32) -> JoinHandle<()> {
        let shaper = self.shaper.clone();
        let hub = self.hub.clone();
        let cancel = self.cancel.child_token();
        let period = Duration::from_secs(interval_secs.max(1) as u64);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if let Some(record) = cell.take_due(period) {
                    let shaped = shaper.shape(&record);
                    if hub.enqueue(shaped) {
                        metrics::HEARTBEATS_EMITTED.inc();
                    } else {
                        metrics::MISSED_MESSAGES.inc();
                    }
                }
            }
        })
    }
}
