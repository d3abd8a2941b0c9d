//! Per-job change dispatcher
//!
//! One tokio task consumes the job's watch stream and runs the registered
//! callbacks one at a time, in delivery order. Callbacks may therefore
//! read-then-write coordination state without further locking among
//! themselves.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::runtime::ShutdownSignal;
use crate::store::TreeEvent;

/// Type-erased change callback
pub type ListenerFn = Arc<dyn Fn(TreeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

type Registry = Arc<RwLock<Vec<(String, ListenerFn)>>>;

/// Handled only while no event is queued
enum Control {
    /// Acknowledged once every event queued before it has been handled
    Barrier(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

pub struct ListenerManager {
    job_name: String,
    listeners: Registry,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerManager {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            listeners: Arc::new(RwLock::new(Vec::new())),
            control: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Add a named callback; registering a name twice is a no-op
    pub fn register<F, Fut>(&self, name: &str, callback: F) -> bool
    where
        F: Fn(TreeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|(n, _)| n == name) {
            return false;
        }
        let callback: ListenerFn = Arc::new(move |event| callback(event).boxed());
        listeners.push((name.to_string(), callback));
        debug!("Registered listener {} for job {}", name, self.job_name);
        true
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.listeners.read().iter().any(|(n, _)| n == name)
    }

    pub fn listener_names(&self) -> Vec<String> {
        self.listeners.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Remove a callback; returns after any dispatch already under way
    /// has finished, so the callback never runs again
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut listeners = self.listeners.write();
            let before = listeners.len();
            listeners.retain(|(n, _)| n != name);
            listeners.len() != before
        };
        if removed {
            self.barrier().await;
            debug!("Unregistered listener {} for job {}", name, self.job_name);
        }
        removed
    }

    /// Wait until the dispatcher has drained its queue
    pub async fn barrier(&self) {
        let sender = self.control.lock().clone();
        if let Some(sender) = sender {
            let (ack, done) = oneshot::channel();
            if sender.send(Control::Barrier(ack)).is_ok() {
                let _ = done.await;
            }
        }
    }

    /// Spawn the dispatcher over `events`; a second call is ignored
    pub fn start(&self, events: mpsc::UnboundedReceiver<TreeEvent>, shutdown: ShutdownSignal) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *self.control.lock() = Some(control_tx);

        let dispatcher = Dispatcher {
            job_name: self.job_name.clone(),
            listeners: self.listeners.clone(),
            events,
            control: control_rx,
            shutdown,
        };
        *handle = Some(tokio::spawn(dispatcher.run()));
    }

    /// Stop the dispatcher once its queue is drained
    pub async fn stop(&self) {
        let sender = self.control.lock().take();
        if let Some(sender) = sender {
            let (ack, done) = oneshot::channel();
            if sender.send(Control::Stop(ack)).is_ok() {
                let _ = done.await;
            }
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Stop without waiting; used when the session is already gone
    pub fn abort(&self) {
        self.control.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

struct Dispatcher {
    job_name: String,
    listeners: Registry,
    events: mpsc::UnboundedReceiver<TreeEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    shutdown: ShutdownSignal,
}

impl Dispatcher {
    async fn run(mut self) {
        debug!("Dispatcher for job {} started", self.job_name);
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        info!("Watch stream of job {} closed", self.job_name);
                        break;
                    }
                },
                control = self.control.recv() => match control {
                    Some(Control::Barrier(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(Control::Stop(ack)) => {
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
        debug!("Dispatcher for job {} stopped", self.job_name);
    }

    async fn dispatch(&self, event: TreeEvent) {
        if self.shutdown.is_shutdown() {
            return;
        }
        let listeners: Vec<(String, ListenerFn)> = self.listeners.read().clone();
        for (name, callback) in listeners {
            if AssertUnwindSafe(callback(event.clone())).catch_unwind().await.is_err() {
                error!("Listener {} of job {} panicked on {}", name, self.job_name, event.path);
            }
        }
    }
}
