//! State machine manager.
//!
//! Owns the processors of one machine and drives them from a dedicated tokio
//! task: tick, report the count to the wait strategy, sleep when idle. The
//! sleep is cut short by [`StateMachineManager::stop`]; a tick in flight is
//! always allowed to finish.

use crate::metrics::Metrics;
use crate::processor::Processor;
use crate::wait::{ExponentialWaitStrategy, WaitStrategy};
use leasehold_core::Payload;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Default time `stop()` waits for the loop to exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct Inner<P: Payload> {
    name: String,
    instance_id: String,
    processors: Vec<Processor<P>>,
    wait: Mutex<Box<dyn WaitStrategy>>,
    shutdown: AtomicBool,
    /// Set from `start()` until the loop task exits.
    active: AtomicBool,
    notify: Notify,
    metrics: Option<Arc<Metrics>>,
}

/// Clears `active` when the loop exits, however it exits.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<P: Payload> Inner<P> {
    async fn tick(&self) -> usize {
        let started = Instant::now();
        let mut total = 0;
        for processor in &self.processors {
            total += processor.process().await;
        }
        if let Some(metrics) = &self.metrics {
            metrics.ticks_total.with_label_values(&[self.name.as_str()]).inc();
            metrics
                .tick_duration
                .with_label_values(&[self.name.as_str()])
                .observe(started.elapsed().as_secs_f64());
        }
        total
    }

    async fn run(self: Arc<Self>) {
        let _active = ActiveGuard(&self.active);
        tracing::info!(
            manager = %self.name,
            instance = %self.instance_id,
            processors = self.processors.len(),
            "State machine manager started"
        );
        self.set_running(true);

        while !self.shutdown.load(Ordering::Acquire) {
            let processed = self.tick().await;
            let wait = {
                let mut strategy = self.wait.lock();
                strategy.success(processed);
                strategy.wait_time()
            };
            if let Some(metrics) = &self.metrics {
                metrics
                    .wait_seconds
                    .with_label_values(&[self.name.as_str()])
                    .set(wait.as_secs_f64());
            }

            if processed > 0 {
                tracing::debug!(manager = %self.name, processed, "tick");
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.set_running(false);
        tracing::info!(manager = %self.name, "State machine manager stopped");
    }

    fn set_running(&self, running: bool) {
        if let Some(metrics) = &self.metrics {
            metrics
                .managers_running
                .with_label_values(&[self.name.as_str()])
                .set(if running { 1.0 } else { 0.0 });
        }
    }
}

/// Schedules the processors of one state machine.
pub struct StateMachineManager<P: Payload> {
    inner: Arc<Inner<P>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl<P: Payload> StateMachineManager<P> {
    pub fn builder(
        name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> StateMachineManagerBuilder<P> {
        StateMachineManagerBuilder::new(name, instance_id)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Runs every processor once, in order. Returns the total processed.
    pub async fn tick(&self) -> usize {
        self.inner.tick().await
    }

    /// Starts the loop on a new tokio task.
    ///
    /// No-op while a loop is alive, including one that is still finishing
    /// its last tick after a timed-out `stop()`.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if self.inner.active.swap(true, Ordering::AcqRel) {
            if self.inner.shutdown.load(Ordering::Acquire) {
                tracing::warn!(
                    manager = %self.inner.name,
                    "previous loop is still stopping, start ignored"
                );
            }
            return;
        }
        self.inner.shutdown.store(false, Ordering::Release);
        *handle = Some(tokio::spawn(self.inner.clone().run()));
    }

    /// Signals the loop and waits up to the shutdown timeout for it to exit.
    /// On timeout the loop keeps its handle and exits after the tick in
    /// flight; a later `stop()` waits for it again.
    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        let Some(mut handle) = handle else {
            return;
        };

        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_one();

        match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(manager = %self.inner.name, error = %e, "manager task failed");
            }
            Err(_) => {
                tracing::warn!(
                    manager = %self.inner.name,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "manager did not stop within timeout"
                );
                let mut slot = self.handle.lock();
                if slot.is_none() {
                    *slot = Some(handle);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Wakes an idle loop so it ticks immediately.
    pub fn wake(&self) {
        self.inner.notify.notify_one();
    }
}

/// Builds a [`StateMachineManager`].
pub struct StateMachineManagerBuilder<P: Payload> {
    name: String,
    instance_id: String,
    processors: Vec<Processor<P>>,
    wait: Box<dyn WaitStrategy>,
    shutdown_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl<P: Payload> StateMachineManagerBuilder<P> {
    fn new(name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_id: instance_id.into(),
            processors: Vec::new(),
            wait: Box::new(ExponentialWaitStrategy::from_millis(500, 10_000)),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            metrics: None,
        }
    }

    pub fn processor(mut self, processor: Processor<P>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn wait_strategy(mut self, strategy: impl WaitStrategy + 'static) -> Self {
        self.wait = Box::new(strategy);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(mut self) -> StateMachineManager<P> {
        if let Some(metrics) = &self.metrics {
            for p in &mut self.processors {
                p.instrument(&self.name, metrics.clone());
            }
        }
        StateMachineManager {
            inner: Arc::new(Inner {
                name: self.name,
                instance_id: self.instance_id,
                processors: self.processors,
                wait: Mutex::new(self.wait),
                shutdown: AtomicBool::new(false),
                active: AtomicBool::new(false),
                notify: Notify::new(),
                metrics: self.metrics,
            }),
            handle: Mutex::new(None),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}
