//! Message runtime
//!
//! A pool of workers consumes the engine bus. Each message is queued on the
//! keyed mutex of its instance, so messages of one instance are handled one
//! at a time and in arrival order, while different instances run in
//! parallel. Follow-on messages go back onto the bus. Infrastructure failures
//! are redelivered with a delay and dead-lettered once the attempts run out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use metrics::counter;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::process::{EngineError, EngineMessage, InstanceId, MessageHandler};
use crate::infrastructure::mutex::{Acquire, KeyedMutex};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub workers: usize,
    /// Locks held longer than this are force-released
    pub lock_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_redeliveries: u32,
    pub redelivery_delay: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lock_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            max_redeliveries: 5,
            redelivery_delay: Duration::from_millis(200),
        }
    }
}

/// A message that failed every delivery attempt
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message: EngineMessage,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

type Reply = oneshot::Sender<Result<(), EngineError>>;

#[derive(Debug)]
struct Envelope {
    message: EngineMessage,
    attempt: u32,
    reply: Option<Reply>,
}

#[derive(Debug)]
struct Inner {
    handler: Arc<dyn MessageHandler>,
    config: RuntimeConfig,
    bus: mpsc::UnboundedSender<Envelope>,
    receiver: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    locks: KeyedMutex<InstanceId, Envelope>,
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    dead_letters: RwLock<Vec<DeadLetter>>,
}

#[derive(Debug)]
pub struct ProcessRuntime {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessRuntime {
    /// Spawn the workers and the stale-lock sweeper on the current tokio runtime
    pub fn start(handler: Arc<dyn MessageHandler>, config: RuntimeConfig) -> Self {
        let (bus, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let workers = config.workers.max(1);

        let inner = Arc::new(Inner {
            handler,
            config,
            bus,
            receiver: Mutex::new(receiver),
            locks: KeyedMutex::new(),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
            dead_letters: RwLock::new(Vec::new()),
        });

        let mut tasks = Vec::with_capacity(workers + 1);
        for worker in 0..workers {
            tasks.push(tokio::spawn(worker_loop(
                inner.clone(),
                worker,
                shutdown.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(sweep_loop(inner.clone(), shutdown.subscribe())));

        info!(workers = workers, "Process runtime started");

        Self {
            inner,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    /// Publish a message and wait for its own handling outcome
    pub async fn submit(&self, message: EngineMessage) -> Result<(), EngineError> {
        let (reply, outcome) = oneshot::channel();
        self.inner.publish(message, Some(reply))?;
        outcome.await.map_err(|_| EngineError::ShuttingDown)?
    }

    /// Publish a message without waiting
    pub fn publish(&self, message: EngineMessage) -> Result<(), EngineError> {
        self.inner.publish(message, None)
    }

    /// Resolve once no message is queued, in flight or waiting for redelivery
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.read().await.clone()
    }

    /// Receiver flipped to `true` when the runtime shuts down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop accepting messages and wait for the workers to exit
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Runtime task ended abnormally");
            }
        }
        info!(pending = self.pending(), "Process runtime stopped");
    }
}

impl Inner {
    fn publish(&self, message: EngineMessage, reply: Option<Reply>) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        self.send(Envelope {
            message,
            attempt: 0,
            reply,
        })
    }

    fn send(&self, envelope: Envelope) -> Result<(), EngineError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.bus.send(envelope).is_err() {
            self.settle();
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    fn settle(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Handle queued messages of one instance while this caller holds its lock
    async fn drain(self: &Arc<Self>, key: &InstanceId) {
        loop {
            match self.locks.try_acquire(key) {
                Acquire::Acquired(envelope, token) => {
                    self.deliver(envelope).await;
                    if !self.locks.release(token) {
                        break;
                    }
                }
                // The current holder drains after it releases
                Acquire::Busy | Acquire::Empty => break,
            }
        }
    }

    async fn deliver(self: &Arc<Self>, mut envelope: Envelope) {
        let kind = envelope.message.kind();
        let instance_id = envelope.message.instance_id().clone();

        let handled = AssertUnwindSafe(async {
            self.handler.handle(envelope.message.clone()).await
        })
        .catch_unwind()
        .await;
        let outcome = handled.unwrap_or_else(|panic| {
            let reason = panic_reason(panic.as_ref());
            counter!("flow_messages_total", "kind" => kind, "outcome" => "panicked").increment(1);
            error!(
                instance_id = %instance_id,
                kind = kind,
                panic = %reason,
                "Message handler panicked"
            );
            Err(EngineError::HandlerPanicked(reason))
        });

        match outcome {
            Ok(follow_ons) => {
                counter!("flow_messages_total", "kind" => kind, "outcome" => "ok").increment(1);
                debug!(
                    instance_id = %instance_id,
                    kind = kind,
                    follow_ons = follow_ons.len(),
                    "Message handled"
                );
                for message in follow_ons {
                    if let Err(e) = self.send(Envelope {
                        message,
                        attempt: 0,
                        reply: None,
                    }) {
                        warn!(instance_id = %instance_id, error = %e, "Dropping follow-on message");
                    }
                }
                reply(envelope.reply, Ok(()));
            }
            Err(e) if e.is_retryable() && envelope.attempt < self.config.max_redeliveries => {
                envelope.attempt += 1;
                counter!("flow_redeliveries_total", "kind" => kind).increment(1);
                warn!(
                    instance_id = %instance_id,
                    kind = kind,
                    attempt = envelope.attempt,
                    error = %e,
                    "Message failed, scheduling redelivery"
                );
                let inner = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(inner.config.redelivery_delay).await;
                    if inner.bus.send(envelope).is_err() {
                        inner.settle();
                    }
                });
                // Still pending until the redelivered copy settles
                return;
            }
            Err(e) if e.is_retryable() => {
                counter!("flow_dead_letters_total", "kind" => kind).increment(1);
                error!(
                    instance_id = %instance_id,
                    kind = kind,
                    attempts = envelope.attempt + 1,
                    error = %e,
                    "Message dead-lettered"
                );
                self.dead_letters.write().await.push(DeadLetter {
                    message: envelope.message,
                    error: e.to_string(),
                    attempts: envelope.attempt + 1,
                    failed_at: Utc::now(),
                });
                reply(envelope.reply, Err(e));
            }
            Err(e) => {
                counter!("flow_messages_total", "kind" => kind, "outcome" => "rejected")
                    .increment(1);
                warn!(
                    instance_id = %instance_id,
                    kind = kind,
                    error = %e,
                    "Message rejected"
                );
                reply(envelope.reply, Err(e));
            }
        }

        self.settle();
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        reason.to_string()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn reply(reply: Option<Reply>, outcome: Result<(), EngineError>) {
    if let Some(reply) = reply {
        // The submitter may have stopped waiting
        let _ = reply.send(outcome);
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = worker, "Worker started");
    loop {
        // Queue under the receiver lock so bus order is kept per instance
        let key = {
            let mut receiver = inner.receiver.lock().await;
            let envelope = tokio::select! {
                envelope = receiver.recv() => envelope,
                _ = shutdown.changed() => None,
            };
            envelope.map(|envelope| {
                let key = envelope.message.instance_id().clone();
                inner.locks.enqueue(key.clone(), envelope);
                key
            })
        };
        match key {
            Some(key) => inner.drain(&key).await,
            None => break,
        }
    }
    debug!(worker = worker, "Worker stopped");
}

async fn sweep_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.sweep_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for key in inner.locks.sweep_stale(inner.config.lock_ttl) {
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.drain(&key).await });
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::process::MockMessageHandler;
    use crate::domain::process::{NodeActivation, TemplateId};
    use crate::domain::DomainError;
    use std::sync::atomic::AtomicU32;

    fn activation(instance_id: &InstanceId, selector: &str) -> EngineMessage {
        EngineMessage::NodeActivate(NodeActivation::entry(
            instance_id.clone(),
            TemplateId::new("tpl").unwrap(),
            selector,
        ))
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            workers: 4,
            redelivery_delay: Duration::from_millis(5),
            max_redeliveries: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_follow_ons_are_published_until_idle() {
        let handled = Arc::new(AtomicU32::new(0));
        let counter = handled.clone();

        let mut handler = MockMessageHandler::new();
        handler.expect_handle().returning(move |message| {
            counter.fetch_add(1, Ordering::SeqCst);
            match &message {
                EngineMessage::NodeActivate(a) if a.selector == "start" => {
                    Ok(vec![activation(&a.instance_id, "next")])
                }
                _ => Ok(vec![]),
            }
        });

        let runtime = ProcessRuntime::start(Arc::new(handler), config());
        let id = InstanceId::generate();
        runtime.submit(activation(&id, "start")).await.unwrap();
        runtime.wait_idle().await;

        assert_eq!(handled.load(Ordering::SeqCst), 2);
        assert_eq!(runtime.pending(), 0);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejection_is_reported_to_submitter() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_| Err(EngineError::validation("bad input")));

        let runtime = ProcessRuntime::start(Arc::new(handler), config());
        let result = runtime
            .submit(activation(&InstanceId::generate(), "start"))
            .await;

        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert!(runtime.dead_letters().await.is_empty());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_storage_failure_is_redelivered() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let mut handler = MockMessageHandler::new();
        handler.expect_handle().returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DomainError::storage("connection reset").into())
            } else {
                Ok(vec![])
            }
        });

        let runtime = ProcessRuntime::start(Arc::new(handler), config());
        runtime
            .submit(activation(&InstanceId::generate(), "start"))
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(runtime.dead_letters().await.is_empty());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_redeliveries_are_dead_lettered() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(3)
            .returning(|_| Err(DomainError::storage("disk full").into()));

        let runtime = ProcessRuntime::start(Arc::new(handler), config());
        let result = runtime
            .submit(activation(&InstanceId::generate(), "start"))
            .await;
        runtime.wait_idle().await;

        assert!(matches!(result, Err(EngineError::Storage(_))));
        let dead = runtime.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        runtime.shutdown().await;
    }

    #[derive(Debug)]
    struct Recorder {
        active: AtomicUsize,
        overlap: AtomicBool,
        order: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: EngineMessage) -> Result<Vec<EngineMessage>, EngineError> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlap.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            if let EngineMessage::NodeActivate(a) = &message {
                self.order.lock().unwrap().push(a.selector.clone());
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_instance_is_handled_serially_in_order() {
        let recorder = Arc::new(Recorder {
            active: AtomicUsize::new(0),
            overlap: AtomicBool::new(false),
            order: std::sync::Mutex::new(Vec::new()),
        });
        let runtime = ProcessRuntime::start(recorder.clone(), config());

        let id = InstanceId::generate();
        for i in 0..20 {
            runtime.publish(activation(&id, &format!("n{:02}", i))).unwrap();
        }
        runtime.wait_idle().await;

        assert!(!recorder.overlap.load(Ordering::SeqCst));
        let order = recorder.order.lock().unwrap().clone();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order.len(), 20);
        assert_eq!(order, sorted);
        runtime.shutdown().await;
    }

    #[derive(Debug, Default)]
    struct Exploding {
        handled: AtomicU32,
    }

    #[async_trait::async_trait]
    impl MessageHandler for Exploding {
        async fn handle(&self, message: EngineMessage) -> Result<Vec<EngineMessage>, EngineError> {
            if let EngineMessage::NodeActivate(a) = &message {
                if a.selector == "boom" {
                    panic!("offset out of range");
                }
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_handler_panic_releases_the_instance() {
        let handler = Arc::new(Exploding::default());
        let runtime = ProcessRuntime::start(handler.clone(), config());
        let id = InstanceId::generate();

        let result = runtime.submit(activation(&id, "boom")).await;
        assert!(matches!(
            result,
            Err(EngineError::HandlerPanicked(reason)) if reason == "offset out of range"
        ));

        runtime.submit(activation(&id, "next")).await.unwrap();
        runtime.wait_idle().await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.pending(), 0);
        assert!(runtime.dead_letters().await.is_empty());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let handler = MockMessageHandler::new();
        let runtime = ProcessRuntime::start(Arc::new(handler), config());
        runtime.shutdown().await;

        let result = runtime.publish(activation(&InstanceId::generate(), "start"));
        assert!(matches!(result, Err(EngineError::ShuttingDown)));
    }
}
