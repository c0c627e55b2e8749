//! Request dispatch.
//!
//! The policy is fixed when the handler is built:
//! - `Direct`: every request runs on its own freshly spawned task
//! - `Pooled`: a fixed set of workers pulls from one shared bounded queue,
//!   and enqueueing waits while the queue is full
//!
//! Neither mode keeps requests from one connection in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{Request, Router};
use crate::config::Config;
use crate::error::{Error, Result};

/// How requests are handed to routers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// One ad-hoc task per request, no backpressure.
    Direct,
    /// `workers` persistent tasks sharing a queue of `queue_len` requests.
    Pooled { workers: usize, queue_len: usize },
}

impl DispatchPolicy {
    pub fn from_config(config: &Config) -> Self {
        if config.worker_pool_size == 0 {
            DispatchPolicy::Direct
        } else {
            DispatchPolicy::Pooled {
                workers: config.worker_pool_size,
                queue_len: config.max_worker_task_len.max(1),
            }
        }
    }
}

struct TaskQueue {
    tx: mpsc::Sender<Request>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Request>>>,
}

/// Router table plus the dispatch policy.
pub struct MsgHandler {
    apis: RwLock<HashMap<u32, Arc<dyn Router>>>,
    policy: DispatchPolicy,
    task_queue: Option<TaskQueue>,
    pool_started: AtomicBool,
    shutdown: CancellationToken,
}

impl MsgHandler {
    pub fn new(config: &Config) -> Self {
        Self::with_policy(DispatchPolicy::from_config(config))
    }

    pub fn with_policy(policy: DispatchPolicy) -> Self {
        let task_queue = match policy {
            DispatchPolicy::Direct => None,
            DispatchPolicy::Pooled { queue_len, .. } => {
                let (tx, rx) = mpsc::channel(queue_len.max(1));
                Some(TaskQueue {
                    tx,
                    rx: Arc::new(AsyncMutex::new(rx)),
                })
            }
        };

        Self {
            apis: RwLock::new(HashMap::new()),
            policy,
            task_queue,
            pool_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Bind a router to a message id.
    pub fn add_router(&self, msg_id: u32, router: Arc<dyn Router>) -> Result<()> {
        let mut apis = self.apis.write().unwrap_or_else(|p| p.into_inner());
        if apis.contains_key(&msg_id) {
            return Err(Error::DuplicateRouter(msg_id));
        }
        apis.insert(msg_id, router);
        debug!(msg_id, "Router registered");
        Ok(())
    }

    /// Run the router for `request` to completion on the current task.
    pub async fn do_msg_handler(&self, request: &Request) {
        let router = {
            let apis = self.apis.read().unwrap_or_else(|p| p.into_inner());
            apis.get(&request.msg_id()).cloned()
        };

        let Some(router) = router else {
            warn!(
                conn_id = request.conn().conn_id(),
                msg_id = request.msg_id(),
                "No router for message, dropped"
            );
            return;
        };

        router.pre_handle(request).await;
        router.handle(request).await;
        router.post_handle(request).await;
    }

    /// Start the persistent workers. Only the first call in pooled mode
    /// does anything.
    pub fn start_worker_pool(self: &Arc<Self>) {
        let (DispatchPolicy::Pooled { workers, queue_len }, Some(queue)) =
            (self.policy, &self.task_queue)
        else {
            return;
        };
        if self.pool_started.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(workers, queue_len, "Starting worker pool");
        for worker_id in 0..workers {
            tokio::spawn(Arc::clone(self).worker_loop(worker_id, Arc::clone(&queue.rx)));
        }
    }

    /// Queue a request for the worker pool, waiting while the queue is full.
    pub async fn send_msg_to_task_queue(&self, request: Request) -> Result<()> {
        let Some(queue) = &self.task_queue else {
            return Err(Error::TaskQueueClosed);
        };
        if self.shutdown.is_cancelled() {
            return Err(Error::TaskQueueClosed);
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::TaskQueueClosed),
            sent = queue.tx.send(request) => sent.map_err(|_| Error::TaskQueueClosed),
        }
    }

    /// Hand a request over according to the policy.
    pub async fn dispatch(self: &Arc<Self>, request: Request) -> Result<()> {
        match self.policy {
            DispatchPolicy::Direct => {
                let handler = Arc::clone(self);
                tokio::spawn(async move {
                    handler.do_msg_handler(&request).await;
                });
                Ok(())
            }
            DispatchPolicy::Pooled { .. } => self.send_msg_to_task_queue(request).await,
        }
    }

    /// Let workers exit once their current request finishes.
    ///
    /// Requests still queued are dropped, along with the connection handles
    /// they carry.
    pub fn stop_worker_pool(&self) {
        self.shutdown.cancel();

        // A worker parked in `recv` holds the lock; it drains on its way out
        if let Some(queue) = &self.task_queue {
            if let Ok(mut rx) = queue.rx.try_lock() {
                drain_task_queue(&mut rx);
            }
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<AsyncMutex<mpsc::Receiver<Request>>>,
    ) {
        debug!(worker = worker_id, "Worker started");

        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = async { rx.lock().await.recv().await } => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            trace!(
                worker = worker_id,
                conn_id = request.conn().conn_id(),
                msg_id = request.msg_id(),
                "Worker picked up request"
            );

            // A panicking router takes down its own task, not the worker
            let handler = Arc::clone(&self);
            let job = tokio::spawn(async move { handler.do_msg_handler(&request).await });
            if let Err(e) = job.await {
                error!(worker = worker_id, error = %e, "Router task failed");
            }
        }

        drain_task_queue(&mut *rx.lock().await);
        debug!(worker = worker_id, "Worker exited");
    }
}

/// Close the queue to new requests and drop whatever is still buffered.
fn drain_task_queue(rx: &mut mpsc::Receiver<Request>) {
    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, "Dropped queued requests");
    }
}
