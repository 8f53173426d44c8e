//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use persistent_streams::batch::{BatchContainer, EventPayload};
use persistent_streams::cache::MemoryQueueAdapterCache;
use persistent_streams::config::{BackoffConfig, PullingAgentConfig, PullingManagerConfig};
use persistent_streams::error::{
    BalancerError, CacheError, ConsumerError, PubSubError, ReceiverError, StreamError,
};
use persistent_streams::provider::{
    NoOpStreamFailureHandler, NoOpStreamFilter, PubSubSubscriptionState, QueueAdapter,
    QueueAdapterCache, QueueAdapterFactory, QueueAdapterReceiver, QueueBalanceListener, QueueCache,
    QueueCacheCursor, StreamConsumer, StreamFailureHandler, StreamPubSub, StreamQueueBalancer,
    StreamQueueMapper,
};
use persistent_streams::types::{
    AgentId, HandshakeToken, QualifiedStreamId, QueueId, SequenceToken, StreamId, SubscriptionId,
};
use persistent_streams::{
    AgentDeps, AgentHandle, AgentSnapshot, ManagerDeps, ManagerHandle, ManagerSnapshot,
    PullingAgent, PullingManager,
};

pub const PROVIDER: &str = "test-provider";

pub fn queue(n: u32) -> QueueId {
    QueueId::new("queue", n)
}

pub fn stream(key: &str) -> QualifiedStreamId {
    QualifiedStreamId::new(PROVIDER, StreamId::new("ns", key))
}

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        min_delay_ms: 1,
        max_delay_ms: 5,
        step_ms: 1,
        jitter: false,
    }
}

pub fn agent_config() -> PullingAgentConfig {
    PullingAgentConfig {
        get_queue_msgs_timer_period_ms: 10,
        init_queue_timeout_ms: 100,
        max_event_delivery_time_ms: 200,
        receiver_shutdown_timeout_ms: 100,
        delivery_backoff: fast_backoff(),
        queue_reader_backoff: fast_backoff(),
        ..Default::default()
    }
}

pub fn manager_config() -> PullingManagerConfig {
    PullingManagerConfig {
        agent: agent_config(),
        ..Default::default()
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Polls the agent's state until `check` holds or `timeout` elapses.
pub async fn wait_for_state(
    handle: &AgentHandle,
    timeout: Duration,
    check: impl Fn(&AgentSnapshot) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(state) = handle.state().await {
            if check(&state) {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ========== Batches ==========

#[derive(Debug)]
pub struct TestBatch {
    pub stream: StreamId,
    pub seq: u64,
}

impl BatchContainer for TestBatch {
    fn stream_id(&self) -> &StreamId {
        &self.stream
    }

    fn sequence_token(&self) -> SequenceToken {
        SequenceToken::new(self.seq, 0)
    }

    fn events(&self) -> Vec<(EventPayload, SequenceToken)> {
        vec![(Arc::new(self.seq), self.sequence_token())]
    }
}

pub fn batch(stream: &QualifiedStreamId, seq: u64) -> Arc<dyn BatchContainer> {
    Arc::new(TestBatch {
        stream: stream.stream.clone(),
        seq,
    })
}

// ========== Queue ==========

/// Receiver serving scripted pages, one per read.
#[derive(Default)]
pub struct FakeReceiver {
    pages: Mutex<VecDeque<Vec<Arc<dyn BatchContainer>>>>,
    pub reads: AtomicUsize,
    pub acknowledged: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub initialized: AtomicBool,
}

impl FakeReceiver {
    pub fn push_page(&self, page: Vec<Arc<dyn BatchContainer>>) {
        self.pages.lock().push_back(page);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueAdapterReceiver for FakeReceiver {
    async fn initialize(&self, _timeout: Duration) -> Result<(), ReceiverError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_queue_messages(
        &self,
        max: Option<usize>,
    ) -> Result<Vec<Arc<dyn BatchContainer>>, ReceiverError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut pages = self.pages.lock();
        let Some(mut page) = pages.pop_front() else {
            return Ok(Vec::new());
        };
        if let Some(max) = max {
            if page.len() > max {
                let rest = page.split_off(max);
                pages.push_front(rest);
            }
        }
        Ok(page)
    }

    async fn messages_delivered(
        &self,
        delivered: Vec<Arc<dyn BatchContainer>>,
    ) -> Result<(), ReceiverError> {
        self.acknowledged.fetch_add(delivered.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, _timeout: Duration) -> Result<(), ReceiverError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one shared receiver per queue.
#[derive(Default)]
pub struct FakeAdapter {
    receivers: Mutex<HashMap<QueueId, Arc<FakeReceiver>>>,
    pub fail_create: AtomicBool,
}

impl FakeAdapter {
    pub fn receiver(&self, queue: &QueueId) -> Arc<FakeReceiver> {
        self.receivers.lock().entry(queue.clone()).or_default().clone()
    }
}

impl QueueAdapter for FakeAdapter {
    fn name(&self) -> &str {
        "fake"
    }

    fn create_receiver(
        &self,
        queue: &QueueId,
    ) -> Result<Arc<dyn QueueAdapterReceiver>, ReceiverError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ReceiverError::new(format!("no receiver for {queue}")));
        }
        Ok(self.receiver(queue))
    }
}

// ========== Cache ==========

/// Memory cache whose pressure signal is driven by the test.
pub struct PressureCache {
    pub inner: Arc<dyn QueueCache>,
    pub pressure: Arc<AtomicBool>,
}

impl QueueCache for PressureCache {
    fn add_to_cache(&self, batches: &[Arc<dyn BatchContainer>]) {
        self.inner.add_to_cache(batches);
    }

    fn try_purge_from_cache(&self) -> Option<Vec<Arc<dyn BatchContainer>>> {
        self.inner.try_purge_from_cache()
    }

    fn is_under_pressure(&self) -> bool {
        self.pressure.load(Ordering::SeqCst) || self.inner.is_under_pressure()
    }

    fn max_add_count(&self) -> Option<usize> {
        self.inner.max_add_count()
    }

    fn cursor(
        &self,
        stream: &StreamId,
        token: Option<&SequenceToken>,
    ) -> Result<Box<dyn QueueCacheCursor>, CacheError> {
        self.inner.cursor(stream, token)
    }
}

pub struct PressureCacheFactory {
    pub memory: MemoryQueueAdapterCache,
    pub pressure: Arc<AtomicBool>,
}

impl QueueAdapterCache for PressureCacheFactory {
    fn create_queue_cache(&self, queue: &QueueId) -> Result<Arc<dyn QueueCache>, CacheError> {
        Ok(Arc::new(PressureCache {
            inner: self.memory.create_queue_cache(queue)?,
            pressure: self.pressure.clone(),
        }))
    }
}

// ========== Pub/sub ==========

#[derive(Default)]
pub struct FakePubSub {
    subscriptions: Mutex<HashMap<QualifiedStreamId, Vec<PubSubSubscriptionState>>>,
    pub registered: Mutex<Vec<(QualifiedStreamId, AgentId)>>,
    pub unregistered: Mutex<Vec<QualifiedStreamId>>,
    pub unregistered_consumers: Mutex<Vec<SubscriptionId>>,
    pub faulted: Mutex<Vec<SubscriptionId>>,
}

impl FakePubSub {
    pub fn subscribe(
        &self,
        stream: &QualifiedStreamId,
        consumer: Arc<dyn StreamConsumer>,
    ) -> SubscriptionId {
        self.subscribe_as(stream, SubscriptionId::new_explicit(), consumer)
    }

    pub fn subscribe_as(
        &self,
        stream: &QualifiedStreamId,
        subscription_id: SubscriptionId,
        consumer: Arc<dyn StreamConsumer>,
    ) -> SubscriptionId {
        self.subscriptions
            .lock()
            .entry(stream.clone())
            .or_default()
            .push(PubSubSubscriptionState {
                subscription_id,
                stream_id: stream.clone(),
                consumer,
                filter_data: None,
            });
        subscription_id
    }

    pub fn registrations(&self) -> usize {
        self.registered.lock().len()
    }
}

#[async_trait]
impl StreamPubSub for FakePubSub {
    async fn register_producer(
        &self,
        stream: &QualifiedStreamId,
        agent: &AgentId,
    ) -> Result<Vec<PubSubSubscriptionState>, PubSubError> {
        self.registered.lock().push((stream.clone(), agent.clone()));
        Ok(self
            .subscriptions
            .lock()
            .get(stream)
            .cloned()
            .unwrap_or_default())
    }

    async fn unregister_producer(
        &self,
        stream: &QualifiedStreamId,
        _agent: &AgentId,
    ) -> Result<(), PubSubError> {
        self.unregistered.lock().push(stream.clone());
        Ok(())
    }

    async fn unregister_consumer(
        &self,
        subscription: SubscriptionId,
        stream: &QualifiedStreamId,
    ) -> Result<(), PubSubError> {
        self.unregistered_consumers.lock().push(subscription);
        if let Some(subs) = self.subscriptions.lock().get_mut(stream) {
            subs.retain(|s| s.subscription_id != subscription);
        }
        Ok(())
    }

    async fn fault_subscription(
        &self,
        _stream: &QualifiedStreamId,
        subscription: SubscriptionId,
    ) -> Result<(), PubSubError> {
        self.faulted.lock().push(subscription);
        Ok(())
    }
}

// ========== Consumer ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Accept,
    Unavailable,
    Fail,
}

/// Records every call the agent makes.
pub struct RecordingConsumer {
    pub resume_from: Mutex<Option<HandshakeToken>>,
    /// Delay before `get_sequence_token` answers.
    pub handshake_delay: Mutex<Duration>,
    pub handshake_fails: AtomicBool,
    pub mode: Mutex<DeliveryMode>,
    pub delivered: Mutex<Vec<u64>>,
    pub attempts: AtomicUsize,
    pub errors: Mutex<Vec<StreamError>>,
}

impl RecordingConsumer {
    pub fn new() -> Arc<Self> {
        Self::with_mode(DeliveryMode::Accept)
    }

    pub fn with_mode(mode: DeliveryMode) -> Arc<Self> {
        Arc::new(Self {
            resume_from: Mutex::new(None),
            handshake_delay: Mutex::new(Duration::ZERO),
            handshake_fails: AtomicBool::new(false),
            mode: Mutex::new(mode),
            delivered: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn delivered(&self) -> Vec<u64> {
        self.delivered.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConsumer for RecordingConsumer {
    async fn get_sequence_token(
        &self,
        _subscription: SubscriptionId,
    ) -> Result<Option<HandshakeToken>, ConsumerError> {
        let delay = *self.handshake_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.handshake_fails.load(Ordering::SeqCst) {
            return Err(ConsumerError::Failed("no position stored".into()));
        }
        Ok(*self.resume_from.lock())
    }

    async fn deliver_batch(
        &self,
        _subscription: SubscriptionId,
        _stream: &QualifiedStreamId,
        batch: Arc<dyn BatchContainer>,
        _previous: Option<HandshakeToken>,
    ) -> Result<Option<HandshakeToken>, ConsumerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        match mode {
            DeliveryMode::Accept => {
                let mut delivered = self.delivered.lock();
                for (event, _) in batch.events() {
                    if let Some(n) = event.downcast_ref::<u64>() {
                        delivered.push(*n);
                    }
                }
                Ok(None)
            }
            DeliveryMode::Unavailable => Err(ConsumerError::Unavailable("consumer is gone".into())),
            DeliveryMode::Fail => Err(ConsumerError::Failed("consumer rejected batch".into())),
        }
    }

    async fn error_in_stream(
        &self,
        _subscription: SubscriptionId,
        error: StreamError,
    ) -> Result<(), ConsumerError> {
        self.errors.lock().push(error);
        Ok(())
    }
}

// ========== Failure handler ==========

/// Records every failure callback.
#[derive(Default)]
pub struct RecordingFailureHandler {
    pub fault: bool,
    pub delivery_failures: Mutex<Vec<SubscriptionId>>,
    pub subscription_failures: Mutex<Vec<(SubscriptionId, StreamError)>>,
}

impl RecordingFailureHandler {
    pub fn new(fault: bool) -> Arc<Self> {
        Arc::new(Self {
            fault,
            ..Default::default()
        })
    }
}

#[async_trait]
impl StreamFailureHandler for RecordingFailureHandler {
    fn should_fault_subscription_on_error(&self) -> bool {
        self.fault
    }

    async fn on_delivery_failure(
        &self,
        subscription: SubscriptionId,
        _provider: &str,
        _stream: &QualifiedStreamId,
        _token: Option<SequenceToken>,
    ) {
        self.delivery_failures.lock().push(subscription);
    }

    async fn on_subscription_failure(
        &self,
        subscription: SubscriptionId,
        _provider: &str,
        _stream: &QualifiedStreamId,
        _token: Option<SequenceToken>,
        error: &StreamError,
    ) {
        self.subscription_failures
            .lock()
            .push((subscription, error.clone()));
    }
}

// ========== Balancer ==========

#[derive(Default)]
pub struct FakeBalancer {
    queues: Mutex<HashSet<QueueId>>,
    listeners: Mutex<Vec<Arc<dyn QueueBalanceListener>>>,
    pub initialized: AtomicBool,
    pub shutdowns: AtomicUsize,
    pub fail_initialize: AtomicBool,
}

impl FakeBalancer {
    pub fn with_queues(queues: impl IntoIterator<Item = QueueId>) -> Arc<Self> {
        let balancer = Self::default();
        balancer.set_queues(queues);
        Arc::new(balancer)
    }

    pub fn set_queues(&self, queues: impl IntoIterator<Item = QueueId>) {
        *self.queues.lock() = queues.into_iter().collect();
    }

    /// Changes the owned queues and notifies every listener.
    pub fn rebalance(&self, queues: impl IntoIterator<Item = QueueId>) {
        self.set_queues(queues);
        self.notify();
    }

    pub fn notify(&self) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.queue_distribution_changed();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

#[async_trait]
impl StreamQueueBalancer for FakeBalancer {
    async fn initialize(&self, _mapper: Arc<dyn StreamQueueMapper>) -> Result<(), BalancerError> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(BalancerError::new("membership unavailable"));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BalancerError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn my_queues(&self) -> HashSet<QueueId> {
        self.queues.lock().clone()
    }

    fn subscribe(&self, listener: Arc<dyn QueueBalanceListener>) -> bool {
        self.listeners.lock().push(listener);
        true
    }
}

pub struct FixedMapper {
    pub queues: Vec<QueueId>,
}

impl StreamQueueMapper for FixedMapper {
    fn all_queues(&self) -> Vec<QueueId> {
        self.queues.clone()
    }

    fn queue_for_stream(&self, _stream: &StreamId) -> QueueId {
        self.queues.first().cloned().unwrap_or_else(|| queue(0))
    }
}

// ========== Factory ==========

pub struct FakeFactory {
    pub adapter: Arc<FakeAdapter>,
    pub cache: Arc<MemoryQueueAdapterCache>,
    /// Queues whose failure handler cannot be created.
    pub failing_queues: Mutex<HashSet<QueueId>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            adapter: Arc::new(FakeAdapter::default()),
            cache: Arc::new(MemoryQueueAdapterCache::default()),
            failing_queues: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl QueueAdapterFactory for FakeFactory {
    fn create_adapter(&self) -> Result<Arc<dyn QueueAdapter>, ReceiverError> {
        Ok(self.adapter.clone())
    }

    fn queue_adapter_cache(&self) -> Option<Arc<dyn QueueAdapterCache>> {
        Some(self.cache.clone())
    }

    fn stream_queue_mapper(&self) -> Arc<dyn StreamQueueMapper> {
        Arc::new(FixedMapper {
            queues: (0..8).map(queue).collect(),
        })
    }

    async fn delivery_failure_handler(
        &self,
        queue: &QueueId,
    ) -> Result<Arc<dyn StreamFailureHandler>, ReceiverError> {
        if self.failing_queues.lock().contains(queue) {
            return Err(ReceiverError::new("failure handler unavailable"));
        }
        Ok(Arc::new(NoOpStreamFailureHandler::default()))
    }
}

// ========== Agent harness ==========

pub struct AgentHarness {
    pub queue: QueueId,
    pub adapter: Arc<FakeAdapter>,
    pub pubsub: Arc<FakePubSub>,
    pub handle: AgentHandle,
    pub token: CancellationToken,
    pub task: tokio::task::JoinHandle<QueueId>,
}

impl AgentHarness {
    pub fn receiver(&self) -> Arc<FakeReceiver> {
        self.adapter.receiver(&self.queue)
    }
}

pub fn spawn_agent(
    config: PullingAgentConfig,
    cache_factory: Option<Arc<dyn QueueAdapterCache>>,
    pubsub: Arc<FakePubSub>,
    failure_handler: Arc<dyn StreamFailureHandler>,
) -> AgentHarness {
    let queue = queue(1);
    let adapter = Arc::new(FakeAdapter::default());
    let deps = AgentDeps {
        provider_name: PROVIDER.into(),
        queue_id: queue.clone(),
        agent_id: AgentId::new(PROVIDER, 0, &queue),
        adapter: adapter.clone(),
        cache_factory,
        pubsub: pubsub.clone(),
        filter: Arc::new(NoOpStreamFilter),
        failure_handler,
        config,
    };
    let token = CancellationToken::new();
    let (agent, handle) = PullingAgent::new(deps, token.clone());
    let task = tokio::spawn(agent.run());

    AgentHarness {
        queue,
        adapter,
        pubsub,
        handle,
        token,
        task,
    }
}

// ========== Manager harness ==========

pub struct ManagerHarness {
    pub factory: Arc<FakeFactory>,
    pub balancer: Arc<FakeBalancer>,
    pub pubsub: Arc<FakePubSub>,
    pub handle: ManagerHandle,
    pub task: tokio::task::JoinHandle<()>,
}

impl ManagerHarness {
    pub fn receiver(&self, queue: &QueueId) -> Arc<FakeReceiver> {
        self.factory.adapter.receiver(queue)
    }

    pub async fn active_queues(&self) -> Vec<QueueId> {
        self.handle
            .snapshot()
            .await
            .map(|snapshot| snapshot.active_queues)
            .unwrap_or_default()
    }
}

pub fn spawn_manager(queues: impl IntoIterator<Item = QueueId>) -> ManagerHarness {
    spawn_manager_with(FakeFactory::new(), FakeBalancer::with_queues(queues))
}

pub fn spawn_manager_with(factory: Arc<FakeFactory>, balancer: Arc<FakeBalancer>) -> ManagerHarness {
    let pubsub = Arc::new(FakePubSub::default());
    let deps = ManagerDeps {
        provider_name: PROVIDER.to_string(),
        adapter_factory: factory.clone(),
        balancer: balancer.clone(),
        pubsub: pubsub.clone(),
        filter: None,
        config: manager_config(),
    };
    let (manager, handle) =
        PullingManager::new(deps, CancellationToken::new()).expect("valid manager config");
    let task = tokio::spawn(manager.run());

    ManagerHarness {
        factory,
        balancer,
        pubsub,
        handle,
        task,
    }
}

/// Polls the manager's snapshot until `check` holds or `timeout` elapses.
pub async fn wait_for_manager(
    handle: &ManagerHandle,
    timeout: Duration,
    check: impl Fn(&ManagerSnapshot) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(snapshot) = handle.snapshot().await {
            if check(&snapshot) {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
