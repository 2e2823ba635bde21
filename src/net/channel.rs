/**
 * Reconnecting, buffered watch transport
 *
 * A `TransportChannel` wraps one receive-only frame stream (a watch socket)
 * and fans its events out to registered handlers. Channels are shared
 * through a `ChannelRegistry` keyed by id; the registry is owned by whoever
 * coordinates subscriptions and is never a process-wide global, so tests can
 * build a fresh one per case.
 *
 * The channel knows nothing about Kubernetes. Frames are opaque strings,
 * optionally decoded to JSON before delivery.
 */
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::serde_json::{self, Value};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::k8s::sync::config::{
    BUFFER_FLUSH_INTERVAL_MS, DEFAULT_BUFFER_MAX_EVENTS, INITIAL_BACKOFF_SECONDS,
    MAX_BACKOFF_SECONDS,
};

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The socket seam: produces one connected frame stream per call. The
/// channel calls it again on every reconnect attempt.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<FrameStream>;
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub reconnect: bool,
    pub buffer_enabled: bool,
    pub buffer_flush_interval: Duration,
    pub buffer_max_events: usize,
    pub json_decode: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            buffer_enabled: true,
            buffer_flush_interval: Duration::from_millis(BUFFER_FLUSH_INTERVAL_MS),
            buffer_max_events: DEFAULT_BUFFER_MAX_EVENTS,
            json_decode: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Open,
    Error,
    Closed,
    Destroyed,
}

/// One delivered message: raw frame text, or its JSON decoding when the
/// channel was opened with `json_decode`.
#[derive(Debug, Clone)]
pub enum MessageFrame {
    Raw(String),
    Json(Value),
}

type MessageHandler = Arc<dyn Fn(&MessageFrame) + Send + Sync>;
type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    open: Vec<LifecycleHandler>,
    close: Vec<LifecycleHandler>,
    error: Vec<ErrorHandler>,
    message: Vec<MessageHandler>,
    destroy: Vec<LifecycleHandler>,
}

enum PumpEnd {
    Cancelled,
    Ended,
    Failed(String),
}

// A poisoned lock means a handler panicked mid-delivery; recover the guard
// instead of cascading the panic into the channel task.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn next_delay(current: Duration) -> Duration {
    current
        .saturating_mul(2)
        .min(Duration::from_secs(MAX_BACKOFF_SECONDS))
}

pub struct TransportChannel {
    id: String,
    url: String,
    options: ChannelOptions,
    connector: Arc<dyn SocketConnector>,
    state: Mutex<ChannelState>,
    handlers: Mutex<Handlers>,
    // Newest frame at the front, oldest at the back; flush drains from the
    // back so delivery order matches arrival order.
    buffer: Mutex<VecDeque<MessageFrame>>,
    paused: AtomicBool,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

impl TransportChannel {
    fn new(
        id: String,
        url: String,
        options: ChannelOptions,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        Self {
            id,
            url,
            options,
            connector,
            state: Mutex::new(ChannelState::Init),
            handlers: Mutex::new(Handlers::default()),
            buffer: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Messages evicted from the buffer since the channel was created.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn on_open(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.register(|h| h.open.push(Arc::new(handler)));
    }

    pub fn on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.register(|h| h.close.push(Arc::new(handler)));
    }

    pub fn on_error(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.register(|h| h.error.push(Arc::new(handler)));
    }

    pub fn on_message(&self, handler: impl Fn(&MessageFrame) + Send + Sync + 'static) {
        self.register(|h| h.message.push(Arc::new(handler)));
    }

    pub fn on_destroy(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.register(|h| h.destroy.push(Arc::new(handler)));
    }

    fn register(&self, push: impl FnOnce(&mut Handlers)) {
        if self.state() == ChannelState::Destroyed {
            debug!(id = %self.id, "ignoring handler registration on destroyed channel");
            return;
        }
        push(&mut *lock(&self.handlers));
    }

    /// Stop delivering buffered messages. Incoming frames keep accumulating
    /// (and keep evicting the oldest past the bound) until `unpause`.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume delivery, flushing everything buffered right away.
    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.flush();
    }

    /// Terminal: closes the stream, stops reconnecting, notifies `destroy`
    /// handlers and drops all registrations. Safe to call more than once.
    pub fn destroy(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ChannelState::Destroyed {
                return;
            }
            *state = ChannelState::Destroyed;
        }
        self.cancel.cancel();
        lock(&self.buffer).clear();
        debug!(id = %self.id, "watch channel destroyed");
        let destroy_handlers: Vec<LifecycleHandler> = {
            let mut handlers = lock(&self.handlers);
            let fired = handlers.destroy.clone();
            *handlers = Handlers::default();
            fired
        };
        for handler in destroy_handlers {
            handler();
        }
    }

    fn spawn_run(self: &Arc<Self>) {
        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.run().await });
    }

    async fn run(&self) {
        let mut delay = Duration::from_secs(INITIAL_BACKOFF_SECONDS);
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.connector.connect(&self.url).await {
                Ok(frames) => {
                    self.set_state(ChannelState::Open);
                    debug!(id = %self.id, url = %self.url, "watch channel open");
                    self.fire_open();
                    delay = Duration::from_secs(INITIAL_BACKOFF_SECONDS);
                    match self.pump(frames).await {
                        PumpEnd::Cancelled => return,
                        PumpEnd::Ended => {
                            self.flush();
                            self.set_state(ChannelState::Closed);
                            debug!(id = %self.id, "watch channel closed by peer");
                            self.fire_close();
                        }
                        PumpEnd::Failed(message) => {
                            self.flush();
                            self.set_state(ChannelState::Error);
                            warn!(id = %self.id, error = %message, "watch channel stream failed");
                            self.fire_error(&message);
                        }
                    }
                }
                Err(e) => {
                    self.set_state(ChannelState::Error);
                    warn!(id = %self.id, error = %e, "watch channel connect failed");
                    self.fire_error(&e.to_string());
                }
            }
            if !self.options.reconnect {
                return;
            }
            debug!(id = %self.id, delay_secs = delay.as_secs(), "scheduling reconnect");
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay);
        }
    }

    async fn pump(&self, mut frames: FrameStream) -> PumpEnd {
        let mut flush = tokio::time::interval(self.options.buffer_flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return PumpEnd::Cancelled,
                _ = flush.tick() => self.flush(),
                frame = frames.next() => match frame {
                    Some(Ok(raw)) => self.accept(raw),
                    Some(Err(e)) => return PumpEnd::Failed(e.to_string()),
                    None => return PumpEnd::Ended,
                },
            }
        }
    }

    fn accept(&self, raw: String) {
        let frame = if self.options.json_decode {
            match serde_json::from_str(&raw) {
                Ok(value) => MessageFrame::Json(value),
                Err(e) => {
                    warn!(id = %self.id, error = %e, "discarding undecodable frame");
                    return;
                }
            }
        } else {
            MessageFrame::Raw(raw)
        };
        if !self.options.buffer_enabled {
            self.fire_message(&frame);
            return;
        }
        let mut buffer = lock(&self.buffer);
        buffer.push_front(frame);
        if buffer.len() > self.options.buffer_max_events {
            buffer.pop_back();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let frame = lock(&self.buffer).pop_back();
            match frame {
                Some(frame) => self.fire_message(&frame),
                None => break,
            }
        }
    }

    // Never resurrect a destroyed channel.
    fn set_state(&self, next: ChannelState) {
        let mut state = lock(&self.state);
        if *state != ChannelState::Destroyed {
            *state = next;
        }
    }

    fn fire_open(&self) {
        let handlers = lock(&self.handlers).open.clone();
        for handler in handlers {
            handler();
        }
    }

    fn fire_close(&self) {
        let handlers = lock(&self.handlers).close.clone();
        for handler in handlers {
            handler();
        }
    }

    fn fire_error(&self, message: &str) {
        let handlers = lock(&self.handlers).error.clone();
        for handler in handlers {
            handler(message);
        }
    }

    fn fire_message(&self, frame: &MessageFrame) {
        let handlers = lock(&self.handlers).message.clone();
        for handler in handlers {
            handler(frame);
        }
    }
}

/// Owned map of live channels keyed by id. `open` is idempotent per id so
/// concurrent subscribers to the same query share one channel.
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Arc<TransportChannel>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Return the existing channel for `id`, or create one and start its
    /// connection task.
    pub fn open(
        &self,
        id: &str,
        url: &str,
        options: ChannelOptions,
        connector: Arc<dyn SocketConnector>,
    ) -> Arc<TransportChannel> {
        let mut channels = lock(&self.channels);
        if let Some(existing) = channels.get(id) {
            return Arc::clone(existing);
        }
        let channel = Arc::new(TransportChannel::new(
            id.to_owned(),
            url.to_owned(),
            options,
            connector,
        ));
        channel.spawn_run();
        channels.insert(id.to_owned(), Arc::clone(&channel));
        channel
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<TransportChannel>> {
        lock(&self.channels).get(id).map(Arc::clone)
    }

    /// Destroy and forget the channel for `id`; a no-op for unknown ids.
    pub fn destroy(&self, id: &str) {
        if let Some(channel) = lock(&self.channels).remove(id) {
            channel.destroy();
        }
    }

    pub fn destroy_all(&self) {
        let channels: Vec<_> = lock(&self.channels).drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.destroy();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.channels).is_empty()
    }
}
