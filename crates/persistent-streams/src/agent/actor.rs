//! The queue pulling agent actor.
//!
//! One agent owns one queue partition. It pumps batches from the queue into
//! the cache, registers as producer for every stream it sees, and runs a
//! delivery loop per subscription. All state lives in the agent task; remote
//! calls run as spawned tasks whose results come back through a `JoinSet`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngExt;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::collection::StreamConsumerCollection;
use super::consumer::{ConsumerState, StreamConsumerData};
use super::delivery::{self, DeliveryContext, ErrorTarget};
use super::handle::AgentHandle;
use super::messages::{
    AgentEvent, AgentEventKind, AgentMessage, AgentSnapshot, ErrorOrigin, ErrorVerdict,
};
use crate::actor::{ActorHandle, ActorMetadata, AgentMetrics};
use crate::batch::{BatchContainer, CompositeBatch};
use crate::config::PullingAgentConfig;
use crate::error::{CacheError, ConsumerError, PubSubError, ReceiverError, Result, StreamError};
use crate::policies::{ExponentialBackoff, RetryPolicy, execute_with_retries};
use crate::provider::{
    PubSubSubscriptionState, QueueAdapter, QueueAdapterCache, QueueAdapterReceiver, QueueCache,
    QueueCacheCursor, StreamConsumer, StreamFailureHandler, StreamFilter, StreamPubSub,
};
use crate::types::{
    AgentId, HandshakeToken, QualifiedStreamId, QueueId, SequenceToken, StreamId, SubscriptionId,
};

/// Retries of a failed queue read before the pump gives up until the next tick.
pub const READ_LOOP_RETRY_MAX: u32 = 6;

/// Inactive streams are collected this many times per inactivity period.
const STREAM_INACTIVITY_CHECK_FREQUENCY: u32 = 10;

const PRIORITY_MAILBOX_CAPACITY: usize = 8;

/// Collaborators an agent is built from.
#[derive(Clone)]
pub struct AgentDeps {
    pub provider_name: Arc<str>,
    pub queue_id: QueueId,
    pub agent_id: AgentId,
    pub adapter: Arc<dyn QueueAdapter>,
    pub cache_factory: Option<Arc<dyn QueueAdapterCache>>,
    pub pubsub: Arc<dyn StreamPubSub>,
    pub filter: Arc<dyn StreamFilter>,
    pub failure_handler: Arc<dyn StreamFailureHandler>,
    pub config: PullingAgentConfig,
}

/// Next step of a consumer's delivery loop, decided while its entry is borrowed.
enum DeliveryStep {
    Idle,
    Deliver {
        consumer: Arc<dyn StreamConsumer>,
        batch: Arc<dyn BatchContainer>,
        previous: Option<HandshakeToken>,
        generation: u64,
    },
    Failed(CacheError),
}

/// Pulls one queue and delivers its streams to their subscribers.
pub struct PullingAgent {
    queue_id: QueueId,
    agent_id: AgentId,
    provider: Arc<str>,
    adapter: Arc<dyn QueueAdapter>,
    cache_factory: Option<Arc<dyn QueueAdapterCache>>,
    pubsub: Arc<dyn StreamPubSub>,
    filter: Arc<dyn StreamFilter>,
    failure_handler: Arc<dyn StreamFailureHandler>,
    config: PullingAgentConfig,
    reader_backoff: ExponentialBackoff,
    delivery_backoff: ExponentialBackoff,

    mailbox: mpsc::Receiver<AgentMessage>,
    priority_mailbox: mpsc::Receiver<AgentMessage>,
    /// Ends the agent task.
    cancellation_token: CancellationToken,
    /// Ends the current activation. Shared with the handle.
    activation: Arc<Mutex<CancellationToken>>,
    epoch: u64,
    next_generation: u64,

    receiver: Option<Arc<dyn QueueAdapterReceiver>>,
    receiver_init: Option<JoinHandle<()>>,
    cache: Option<Arc<dyn QueueCache>>,
    pump: Option<Interval>,
    streams: HashMap<QualifiedStreamId, StreamConsumerCollection>,
    tasks: JoinSet<AgentEvent>,
    last_cleanup: Instant,
    metrics: Arc<AgentMetrics>,
}

impl PullingAgent {
    /// Creates the agent and its handle. The caller spawns [`PullingAgent::run`].
    pub fn new(deps: AgentDeps, cancellation_token: CancellationToken) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::channel(deps.config.mailbox_capacity.max(1));
        let (priority_tx, priority_rx) = mpsc::channel(PRIORITY_MAILBOX_CAPACITY);
        let activation = Arc::new(Mutex::new(cancellation_token.child_token()));

        let handle = AgentHandle::new(
            ActorHandle::new(
                tx,
                priority_tx,
                cancellation_token.clone(),
                ActorMetadata::agent(deps.queue_id.to_string()),
            ),
            activation.clone(),
            deps.queue_id.clone(),
        );

        let agent = Self {
            reader_backoff: ExponentialBackoff::from(&deps.config.queue_reader_backoff),
            delivery_backoff: ExponentialBackoff::from(&deps.config.delivery_backoff),
            queue_id: deps.queue_id,
            agent_id: deps.agent_id,
            provider: deps.provider_name,
            adapter: deps.adapter,
            cache_factory: deps.cache_factory,
            pubsub: deps.pubsub,
            filter: deps.filter,
            failure_handler: deps.failure_handler,
            config: deps.config,
            mailbox: rx,
            priority_mailbox: priority_rx,
            cancellation_token,
            activation,
            epoch: 0,
            next_generation: 0,
            receiver: None,
            receiver_init: None,
            cache: None,
            pump: None,
            streams: HashMap::new(),
            tasks: JoinSet::new(),
            last_cleanup: Instant::now(),
            metrics: Arc::new(AgentMetrics::default()),
        };

        (agent, handle)
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// Run the agent's event loop until cancelled or every handle is dropped.
    pub async fn run(mut self) -> QueueId {
        debug!(queue = %self.queue_id, agent = %self.agent_id, "PullingAgent starting");

        loop {
            // Drain priority messages before anything else.
            if let Ok(msg) = self.priority_mailbox.try_recv() {
                self.handle_message(msg).await;
                continue;
            }

            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    debug!(queue = %self.queue_id, "PullingAgent cancelled");
                    break;
                }

                Some(msg) = self.priority_mailbox.recv() => {
                    self.handle_message(msg).await;
                }

                msg = self.mailbox.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => {
                            debug!(queue = %self.queue_id, "PullingAgent mailbox closed");
                            break;
                        }
                    }
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_joined(joined);
                }

                _ = Self::next_tick(&mut self.pump) => {
                    self.pump_queue().await;
                }
            }
        }

        self.shutdown().await;
        debug!(queue = %self.queue_id, "PullingAgent stopped");
        self.queue_id
    }

    async fn next_tick(pump: &mut Option<Interval>) {
        match pump {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn handle_message(&mut self, msg: AgentMessage) {
        match msg {
            AgentMessage::Initialize(reply) => {
                let result = self.initialize().await;
                let _ = reply.send(result);
            }
            AgentMessage::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
            AgentMessage::AddSubscriber {
                subscription_id,
                stream_id,
                consumer,
                filter_data,
            } => {
                self.add_subscriber(subscription_id, stream_id, consumer, filter_data, None);
            }
            AgentMessage::RemoveSubscriber {
                subscription_id,
                stream_id,
            } => {
                self.remove_subscriber(subscription_id, &stream_id);
            }
            AgentMessage::GetState(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn is_running(&self) -> bool {
        self.pump.is_some()
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            queue_id: self.queue_id.clone(),
            running: self.is_running(),
            stream_count: self.streams.len(),
            consumer_count: self.streams.values().map(StreamConsumerCollection::len).sum(),
            metrics: self.metrics.snapshot(),
        }
    }

    fn activation_token(&self) -> CancellationToken {
        self.activation.lock().clone()
    }

    fn delivery_context(&self) -> DeliveryContext {
        DeliveryContext {
            agent_id: self.agent_id.clone(),
            provider: self.provider.clone(),
            pubsub: self.pubsub.clone(),
            failure_handler: self.failure_handler.clone(),
            delivery_backoff: self.delivery_backoff.clone(),
            max_delivery_time: self.config.max_event_delivery_time(),
            token: self.activation_token(),
        }
    }

    // ========== Lifecycle ==========

    async fn initialize(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        info!(queue = %self.queue_id, "Initializing pulling agent");

        self.epoch += 1;
        *self.activation.lock() = self.cancellation_token.child_token();
        self.last_cleanup = Instant::now();

        if let Some(factory) = &self.cache_factory {
            let cache = factory.create_queue_cache(&self.queue_id).map_err(|e| {
                error!(queue = %self.queue_id, error = %e, "Failed to create queue cache");
                e
            })?;
            self.cache = Some(cache);
        }

        let receiver = match self.adapter.create_receiver(&self.queue_id) {
            Ok(receiver) => receiver,
            Err(e) => {
                error!(queue = %self.queue_id, error = %e, "Failed to create queue receiver");
                self.cache = None;
                return Err(e.into());
            }
        };

        // Receiver initialization runs in the background; the first pump tick waits for it.
        let init_receiver = receiver.clone();
        let timeout = self.config.init_queue_timeout();
        let queue_id = self.queue_id.clone();
        self.receiver_init = Some(tokio::spawn(async move {
            if let Err(e) = init_receiver.initialize(timeout).await {
                error!(queue = %queue_id, error = %e, "Failed to initialize queue receiver");
            }
        }));
        self.receiver = Some(receiver);

        let period = self.config.get_queue_msgs_timer_period();
        let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
        let offset = Duration::from_millis(rand::rng().random_range(0..period_ms));
        let mut pump = tokio::time::interval_at(Instant::now() + offset, period);
        pump.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.pump = Some(pump);

        info!(queue = %self.queue_id, "Took queue under responsibility");
        Ok(())
    }

    async fn shutdown(&mut self) {
        if !self.is_running() {
            return;
        }
        info!(queue = %self.queue_id, streams = self.streams.len(), "Shutting down pulling agent");

        self.activation.lock().cancel();
        self.pump = None;
        self.cache = None;

        if let Some(init) = self.receiver_init.take() {
            if let Err(e) = init.await {
                warn!(queue = %self.queue_id, error = %e, "Receiver initialization task failed");
            }
        }

        if let Some(receiver) = self.receiver.take() {
            if let Err(e) = receiver.shutdown(self.config.receiver_shutdown_timeout()).await {
                warn!(queue = %self.queue_id, error = %e, "Failed to shut down queue receiver");
            }
        }

        let streams: Vec<QualifiedStreamId> = self
            .streams
            .drain()
            .map(|(stream, mut collection)| {
                collection.dispose_all();
                stream
            })
            .collect();

        if !streams.is_empty() {
            delivery::unregister_producers(self.pubsub.clone(), self.agent_id.clone(), streams)
                .await;
        }
        info!(queue = %self.queue_id, "Pulling agent shut down");
    }

    // ========== Queue pump ==========

    async fn pump_queue(&mut self) {
        if let Some(init) = self.receiver_init.take() {
            if let Err(e) = init.await {
                warn!(queue = %self.queue_id, error = %e, "Receiver initialization task failed");
            }
        }

        loop {
            if !self.is_running() {
                return;
            }

            match self.read_from_queue().await {
                Ok(true) => continue,
                Ok(false) => return,
                Err(e) => {
                    if !self.activation_token().is_cancelled() {
                        error!(
                            queue = %self.queue_id,
                            retries = READ_LOOP_RETRY_MAX,
                            error = %e,
                            "Giving up reading from queue until the next tick"
                        );
                    }
                    return;
                }
            }
        }
    }

    /// One pump pass. `Ok(true)` means data was read and the pump should go again.
    async fn read_from_queue(&mut self) -> std::result::Result<bool, ReceiverError> {
        let Some(receiver) = self.receiver.clone() else {
            return Ok(false);
        };

        let now = Instant::now();
        let inactivity = self.config.stream_inactivity_period();
        if now.saturating_duration_since(self.last_cleanup)
            > inactivity / STREAM_INACTIVITY_CHECK_FREQUENCY
        {
            self.last_cleanup = now;
            self.collect_inactive_streams(now, inactivity);
        }

        let mut max = None;
        if let Some(cache) = self.cache.clone() {
            if let Some(purged) = cache.try_purge_from_cache() {
                if let Err(e) = receiver.messages_delivered(purged).await {
                    warn!(queue = %self.queue_id, error = %e, "Failed to acknowledge purged messages");
                }
            }
            if cache.is_under_pressure() {
                self.metrics.record_pressure_pause();
                info!(queue = %self.queue_id, "Queue cache is under pressure, backing off");
                return Ok(false);
            }
            max = cache.max_add_count();
            if max == Some(0) {
                return Ok(false);
            }
        }

        let token = self.activation_token();
        let queue_id = &self.queue_id;
        let metrics = &self.metrics;
        let batches = execute_with_retries(
            &RetryPolicy::with_max_retries(READ_LOOP_RETRY_MAX),
            &self.reader_backoff,
            &token,
            |err: &ReceiverError, attempt| {
                metrics.record_read_failure();
                warn!(queue = %queue_id, attempt, error = %err, "Failed to read from queue");
                true
            },
            |_| {
                let receiver = receiver.clone();
                async move { receiver.get_queue_messages(max).await }
            },
        )
        .await?;

        if batches.is_empty() || !self.is_running() {
            return Ok(false);
        }
        self.metrics.record_read(batches.len());

        if let Some(cache) = &self.cache {
            cache.add_to_cache(&batches);
        }
        self.route_batches(&batches, now);
        Ok(true)
    }

    /// Wakes consumers of known streams and registers unknown ones.
    fn route_batches(&mut self, batches: &[Arc<dyn BatchContainer>], now: Instant) {
        let mut seen = HashSet::new();
        let mut first_tokens = Vec::new();
        for batch in batches {
            let stream = QualifiedStreamId::new(self.provider.clone(), batch.stream_id().clone());
            if seen.insert(stream.clone()) {
                first_tokens.push((stream, batch.sequence_token()));
            }
        }

        for (stream, first_token) in first_tokens {
            match self.streams.get_mut(&stream) {
                Some(collection) => {
                    collection.refresh_activity(now);
                    if !collection.stream_registered {
                        debug!(queue = %self.queue_id, %stream, "Read events before producer registration completed");
                    }
                    // Consumers whose handshake is done run even while others are pending.
                    self.start_inactive_cursors(&stream, first_token);
                }
                None => self.register_stream(stream, first_token, now),
            }
        }
    }

    fn start_inactive_cursors(&mut self, stream: &QualifiedStreamId, token: SequenceToken) {
        let Some(collection) = self.streams.get_mut(stream) else {
            return;
        };

        let mut idle = Vec::new();
        for data in collection.consumers_mut() {
            if !data.is_registered {
                debug!(subscription = %data.subscription_id, "Consumer handshake not finished, starting it later");
                continue;
            }
            if let Some(cursor) = data.cursor.as_mut() {
                cursor.refresh(&token);
            }
            if data.state == ConsumerState::Inactive {
                idle.push(data.subscription_id);
            }
        }

        for subscription in idle {
            self.run_consumer_cursor(stream, subscription);
        }
    }

    fn collect_inactive_streams(&mut self, now: Instant, window: Duration) {
        let inactive: Vec<QualifiedStreamId> = self
            .streams
            .iter()
            .filter(|(_, collection)| collection.is_inactive(now, window))
            .map(|(stream, _)| stream.clone())
            .collect();

        for stream in &inactive {
            if let Some(mut collection) = self.streams.remove(stream) {
                collection.dispose_all();
                debug!(queue = %self.queue_id, %stream, "Removed inactive stream");
            }
        }
        if !inactive.is_empty() {
            self.metrics.record_streams_collected(inactive.len());
        }
    }

    // ========== Producer registration ==========

    fn register_stream(
        &mut self,
        stream: QualifiedStreamId,
        first_token: SequenceToken,
        now: Instant,
    ) {
        let pin = self.cache.as_ref().and_then(|cache| {
            cache
                .cursor(&stream.stream, Some(&first_token))
                .map_err(|e| warn!(%stream, error = %e, "Failed to pin stream data in cache"))
                .ok()
        });

        let mut collection = StreamConsumerCollection::new(now);
        collection.begin_registration(pin);
        self.streams.insert(stream.clone(), collection);

        let ctx = self.delivery_context();
        let epoch = self.epoch;
        self.tasks.spawn(async move {
            let result = delivery::register_producer(ctx, stream.clone()).await;
            AgentEvent {
                epoch,
                stream_id: stream,
                kind: AgentEventKind::ProducerRegistered {
                    first_token,
                    result,
                },
            }
        });
    }

    // ========== Subscribers ==========

    fn add_subscriber(
        &mut self,
        subscription_id: SubscriptionId,
        stream_id: QualifiedStreamId,
        consumer: Arc<dyn StreamConsumer>,
        filter_data: Option<String>,
        cache_token: Option<SequenceToken>,
    ) {
        if !self.is_running() {
            return;
        }
        let Some(collection) = self.streams.get_mut(&stream_id) else {
            // Subscriptions are fetched from pub/sub once the stream's first events arrive.
            debug!(queue = %self.queue_id, stream = %stream_id, subscription = %subscription_id, "No events seen for stream yet, ignoring subscriber");
            return;
        };

        self.next_generation += 1;
        collection.add_consumer(
            subscription_id,
            stream_id.clone(),
            consumer,
            filter_data,
            self.next_generation,
        );
        debug!(queue = %self.queue_id, stream = %stream_id, subscription = %subscription_id, "Added subscriber");

        self.begin_handshake(&stream_id, subscription_id, cache_token);
    }

    fn remove_subscriber(&mut self, subscription_id: SubscriptionId, stream_id: &QualifiedStreamId) {
        let Some(collection) = self.streams.get_mut(stream_id) else {
            return;
        };
        if collection.remove_consumer(&subscription_id) {
            debug!(queue = %self.queue_id, stream = %stream_id, subscription = %subscription_id, "Removed subscriber");
        }
        if collection.is_empty() && !collection.is_registration_pending() {
            self.streams.remove(stream_id);
        }
    }

    fn consumer_entry<'a>(
        streams: &'a mut HashMap<QualifiedStreamId, StreamConsumerCollection>,
        stream: &QualifiedStreamId,
        subscription: &SubscriptionId,
    ) -> Option<&'a mut StreamConsumerData> {
        streams.get_mut(stream)?.get_mut(subscription)
    }

    // ========== Handshake ==========

    fn begin_handshake(
        &mut self,
        stream: &QualifiedStreamId,
        subscription: SubscriptionId,
        cache_token: Option<SequenceToken>,
    ) {
        // Without a cache there is no cursor to position.
        if self.cache.is_none() {
            self.finish_handshake(stream, subscription, cache_token, None);
            return;
        }

        let Some(data) = Self::consumer_entry(&mut self.streams, stream, &subscription) else {
            return;
        };
        let consumer = data.consumer.clone();
        let generation = data.generation;
        let ctx = self.delivery_context();
        let epoch = self.epoch;
        let stream_id = stream.clone();

        self.tasks.spawn(async move {
            let result = delivery::negotiate_handshake(ctx, consumer, subscription).await;
            AgentEvent {
                epoch,
                stream_id,
                kind: AgentEventKind::Handshake {
                    subscription_id: subscription,
                    generation,
                    cache_token,
                    result,
                },
            }
        });
    }

    fn on_handshake(
        &mut self,
        stream: &QualifiedStreamId,
        subscription: SubscriptionId,
        generation: u64,
        cache_token: Option<SequenceToken>,
        result: std::result::Result<Option<HandshakeToken>, ConsumerError>,
    ) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let Some(data) = Self::consumer_entry(&mut self.streams, stream, &subscription)
            .filter(|data| data.generation == generation)
        else {
            return;
        };

        let outcome = match result {
            Ok(Some(requested)) => {
                data.dispose_cursor();
                match cache.cursor(&stream.stream, Some(&requested.token())) {
                    Ok(cursor) => {
                        data.set_cursor(cursor);
                        Ok(Some(requested))
                    }
                    Err(e) => Err((Some(requested), StreamError::DataNotAvailable(e))),
                }
            }
            Ok(None) if data.cursor.is_none() => match cache.cursor(&stream.stream, cache_token.as_ref()) {
                Ok(cursor) => {
                    data.set_cursor(cursor);
                    Ok(None)
                }
                Err(e) => Err((None, StreamError::DataNotAvailable(e))),
            },
            Ok(None) => Ok(None),
            Err(ConsumerError::Unavailable(message)) => Err((
                None,
                StreamError::ConsumerUnavailable {
                    subscription,
                    message,
                },
            )),
            Err(e) => Err((
                None,
                StreamError::HandshakeFailure {
                    subscription,
                    message: e.to_string(),
                },
            )),
        };

        match outcome {
            Ok(requested) => self.finish_handshake(stream, subscription, cache_token, requested),
            Err((requested, error)) => {
                warn!(queue = %self.queue_id, %stream, %subscription, %error, "Handshake with consumer failed");
                self.spawn_error_protocol(
                    stream,
                    subscription,
                    error,
                    false,
                    requested.map(|token| token.token()),
                    ErrorOrigin::Handshake {
                        requested,
                        cache_token,
                    },
                );
            }
        }
    }

    fn finish_handshake(
        &mut self,
        stream: &QualifiedStreamId,
        subscription: SubscriptionId,
        cache_token: Option<SequenceToken>,
        requested: Option<HandshakeToken>,
    ) {
        let cache = self.cache.clone();
        let Some(collection) = self.streams.get_mut(stream) else {
            return;
        };
        let Some(data) = collection.get_mut(&subscription) else {
            collection.handshake_settled(&subscription);
            return;
        };

        data.last_token = requested;
        if data.cursor.is_none() {
            if let Some(cache) = &cache {
                match cache
                    .cursor(&stream.stream, cache_token.as_ref())
                    .or_else(|_| cache.cursor(&stream.stream, None))
                {
                    Ok(cursor) => data.set_cursor(cursor),
                    Err(e) => warn!(%stream, %subscription, error = %e, "Failed to open cache cursor"),
                }
            }
        }
        data.is_registered = true;
        let inactive = !data.is_active();
        collection.handshake_settled(&subscription);

        if inactive {
            self.run_consumer_cursor(stream, subscription);
        }
    }

    // ========== Delivery ==========

    fn run_consumer_cursor(&mut self, stream: &QualifiedStreamId, subscription: SubscriptionId) {
        let Some(data) = Self::consumer_entry(&mut self.streams, stream, &subscription) else {
            return;
        };
        if data.is_active() || data.cursor.is_none() {
            return;
        }
        data.state = ConsumerState::Active;
        self.advance_consumer(stream, subscription);
    }

    /// Pulls the next deliverable batch for an active consumer and sends it.
    fn advance_consumer(&mut self, stream: &QualifiedStreamId, subscription: SubscriptionId) {
        let step = {
            let Some(data) = Self::consumer_entry(&mut self.streams, stream, &subscription) else {
                return;
            };
            let read = match data.cursor.as_mut() {
                Some(cursor) => next_batch(
                    &mut **cursor,
                    self.filter.as_ref(),
                    &stream.stream,
                    data.filter_data.as_deref(),
                    self.config.batch_container_batch_size,
                ),
                None => Ok(None),
            };

            match read {
                Ok(None) => {
                    data.state = ConsumerState::Inactive;
                    DeliveryStep::Idle
                }
                Ok(Some(batch)) => DeliveryStep::Deliver {
                    consumer: data.consumer.clone(),
                    batch,
                    previous: data.last_token,
                    generation: data.generation,
                },
                Err(e) => {
                    data.dispose_cursor();
                    if let Some(cache) = &self.cache {
                        data.cursor = cache.cursor(&stream.stream, None).ok();
                    }
                    DeliveryStep::Failed(e)
                }
            }
        };

        match step {
            DeliveryStep::Idle => {}
            DeliveryStep::Deliver {
                consumer,
                batch,
                previous,
                generation,
            } => {
                let ctx = self.delivery_context();
                let epoch = self.epoch;
                let stream_id = stream.clone();
                self.tasks.spawn(async move {
                    let result = delivery::deliver_batch(
                        ctx,
                        consumer,
                        subscription,
                        stream_id.clone(),
                        batch.clone(),
                        previous,
                    )
                    .await;
                    AgentEvent {
                        epoch,
                        stream_id,
                        kind: AgentEventKind::Delivered {
                            subscription_id: subscription,
                            generation,
                            batch,
                            result,
                        },
                    }
                });
            }
            DeliveryStep::Failed(e) => {
                warn!(queue = %self.queue_id, %stream, %subscription, error = %e, "Failed to read from cache cursor");
                self.spawn_error_protocol(
                    stream,
                    subscription,
                    StreamError::DataNotAvailable(e),
                    true,
                    None,
                    ErrorOrigin::Delivery,
                );
            }
        }
    }

    fn on_delivered(
        &mut self,
        stream: &QualifiedStreamId,
        subscription: SubscriptionId,
        generation: u64,
        batch: Arc<dyn BatchContainer>,
        result: std::result::Result<Option<HandshakeToken>, ConsumerError>,
    ) {
        let cache = self.cache.clone();
        let outcome = {
            let Some(data) = Self::consumer_entry(&mut self.streams, stream, &subscription)
                .filter(|data| data.generation == generation)
            else {
                return;
            };

            match result {
                Ok(new_token) => {
                    self.metrics.record_delivery();
                    data.last_token = Some(HandshakeToken::Delivery(batch.sequence_token()));
                    match (new_token, &cache) {
                        (Some(token), Some(cache)) => {
                            // The consumer asked to rewind; skip the batch the token names.
                            data.last_token = Some(token);
                            let rewound = cache
                                .cursor(&stream.stream, Some(&token.token()))
                                .and_then(|mut cursor| cursor.move_next().map(|_| cursor));
                            match rewound {
                                Ok(cursor) => {
                                    data.set_cursor(cursor);
                                    Ok(())
                                }
                                Err(e) => Err((StreamError::DataNotAvailable(e), Some(token.token()))),
                            }
                        }
                        _ => Ok(()),
                    }
                }
                Err(e) => {
                    self.metrics.record_delivery_failure();
                    if let Some(cursor) = data.cursor.as_mut() {
                        cursor.record_delivery_failure();
                    }
                    data.dispose_cursor();
                    if let Some(cache) = &cache {
                        data.cursor = cache.cursor(&stream.stream, None).ok();
                    }

                    let error = match e {
                        ConsumerError::Unavailable(message) => StreamError::ConsumerUnavailable {
                            subscription,
                            message,
                        },
                        other => StreamError::DeliveryFailure {
                            subscription,
                            stream: stream.clone(),
                            message: other.to_string(),
                        },
                    };
                    Err((error, Some(batch.sequence_token())))
                }
            }
        };

        match outcome {
            Ok(()) => self.advance_consumer(stream, subscription),
            Err((error, token)) => {
                warn!(queue = %self.queue_id, %stream, %subscription, %error, "Failed to deliver batch");
                self.spawn_error_protocol(
                    stream,
                    subscription,
                    error,
                    true,
                    token,
                    ErrorOrigin::Delivery,
                );
            }
        }
    }

    // ========== Error protocol ==========

    fn spawn_error_protocol(
        &mut self,
        stream: &QualifiedStreamId,
        subscription: SubscriptionId,
        error: StreamError,
        is_delivery: bool,
        token: Option<SequenceToken>,
        origin: ErrorOrigin,
    ) {
        if !self.is_running() {
            return;
        }
        let Some(data) = Self::consumer_entry(&mut self.streams, stream, &subscription) else {
            return;
        };
        let generation = data.generation;
        let target = ErrorTarget {
            subscription,
            stream: stream.clone(),
            consumer: data.consumer.clone(),
            token,
            is_delivery,
        };

        let ctx = self.delivery_context();
        let epoch = self.epoch;
        let stream_id = stream.clone();
        self.tasks.spawn(async move {
            let verdict = delivery::run_error_protocol(ctx, target, error).await;
            AgentEvent {
                epoch,
                stream_id,
                kind: AgentEventKind::ErrorHandled {
                    subscription_id: subscription,
                    generation,
                    origin,
                    verdict,
                },
            }
        });
    }

    fn on_error_handled(
        &mut self,
        stream: &QualifiedStreamId,
        subscription: SubscriptionId,
        generation: u64,
        origin: ErrorOrigin,
        verdict: ErrorVerdict,
    ) {
        let current = Self::consumer_entry(&mut self.streams, stream, &subscription)
            .is_some_and(|data| data.generation == generation);
        if !current {
            return;
        }

        match verdict {
            ErrorVerdict::Faulted | ErrorVerdict::Unavailable => {
                self.remove_subscriber(subscription, stream);
            }
            ErrorVerdict::Continue => match origin {
                ErrorOrigin::Handshake {
                    requested,
                    cache_token,
                } => self.finish_handshake(stream, subscription, cache_token, requested),
                ErrorOrigin::Delivery => self.advance_consumer(stream, subscription),
            },
        }
    }

    // ========== Spawned work ==========

    fn handle_joined(&mut self, joined: std::result::Result<AgentEvent, JoinError>) {
        match joined {
            Ok(event) => self.handle_event(event),
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(queue = %self.queue_id, error = %e, "Agent task panicked"),
        }
    }

    fn handle_event(&mut self, event: AgentEvent) {
        if event.epoch != self.epoch || !self.is_running() {
            debug!(queue = %self.queue_id, stream = %event.stream_id, "Dropping completion from a previous activation");
            return;
        }
        let stream = event.stream_id;

        match event.kind {
            AgentEventKind::ProducerRegistered {
                first_token,
                result,
            } => self.on_producer_registered(&stream, first_token, result),
            AgentEventKind::Handshake {
                subscription_id,
                generation,
                cache_token,
                result,
            } => self.on_handshake(&stream, subscription_id, generation, cache_token, result),
            AgentEventKind::Delivered {
                subscription_id,
                generation,
                batch,
                result,
            } => self.on_delivered(&stream, subscription_id, generation, batch, result),
            AgentEventKind::ErrorHandled {
                subscription_id,
                generation,
                origin,
                verdict,
            } => self.on_error_handled(&stream, subscription_id, generation, origin, verdict),
        }
    }

    fn on_producer_registered(
        &mut self,
        stream: &QualifiedStreamId,
        first_token: SequenceToken,
        result: std::result::Result<Vec<PubSubSubscriptionState>, PubSubError>,
    ) {
        let Some(collection) = self.streams.get_mut(stream) else {
            return;
        };

        let subscriptions = match result {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!(queue = %self.queue_id, %stream, error = %e, "Producer registration abandoned");
                collection.abandon_registration();
                return;
            }
        };

        self.metrics.record_producer_registration();
        debug!(queue = %self.queue_id, %stream, subscriptions = subscriptions.len(), "Registered as stream producer");
        collection.expect_handshakes(subscriptions.iter().map(|s| s.subscription_id));

        for subscription in subscriptions {
            self.add_subscriber(
                subscription.subscription_id,
                stream.clone(),
                subscription.consumer,
                subscription.filter_data,
                Some(first_token),
            );
        }
    }
}

/// Reads the next deliverable batch from `cursor`, combining up to
/// `batch_size` batches when batching is configured.
fn next_batch(
    cursor: &mut dyn QueueCacheCursor,
    filter: &dyn StreamFilter,
    stream: &StreamId,
    filter_data: Option<&str>,
    batch_size: usize,
) -> std::result::Result<Option<Arc<dyn BatchContainer>>, CacheError> {
    if batch_size <= 1 {
        while cursor.move_next()? {
            let Some(batch) = cursor.current() else {
                break;
            };
            if should_deliver(filter, stream, batch.as_ref(), filter_data) {
                return Ok(Some(batch));
            }
        }
        return Ok(None);
    }

    let mut batches = Vec::new();
    while batches.len() < batch_size && cursor.move_next()? {
        if let Some(batch) = cursor.current() {
            if should_deliver(filter, stream, batch.as_ref(), filter_data) {
                batches.push(batch);
            }
        }
    }
    Ok(CompositeBatch::new(batches).map(|batch| Arc::new(batch) as Arc<dyn BatchContainer>))
}

/// A batch is delivered when any of its events passes the filter.
fn should_deliver(
    filter: &dyn StreamFilter,
    stream: &StreamId,
    batch: &dyn BatchContainer,
    filter_data: Option<&str>,
) -> bool {
    if filter.is_noop() {
        return true;
    }
    for (event, _) in batch.events() {
        match filter.should_deliver(stream, event.as_ref(), filter_data) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!(%stream, error = %e, "Stream filter failed, delivering batch");
                return true;
            }
        }
    }
    false
}
