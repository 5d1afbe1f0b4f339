//! Component E: one supervisor process, owning the shared
//! [`ImageBufferCache`]/[`MetadataExtractor`] context and a fixed pool
//! of worker threads for a single authenticated user.

use crate::hdf5_reader::ImageBufferCache;
use crate::metadata::MetadataExtractor;
use crate::queue::QueueClient;
use crate::worker::{self, ResultSink, WorkerContext};
use anyhow::Result;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owns the worker pool backing one private queue. Workers share a
/// single [`WorkerContext`] (and therefore a single frame-discovery
/// cache keyed by master file) for the lifetime of the supervisor.
pub struct Supervisor {
    private_key: String,
    queue: Arc<dyn QueueClient>,
    ctx: Arc<WorkerContext>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn `n_worker_threads` workers against `private_key`, sharing
    /// one [`WorkerContext`]. `property_table_path` mirrors
    /// [`crate::config::MetadataSettings::property_table_path`]: `None`
    /// uses the embedded property table.
    pub fn start(
        private_key: String,
        queue: Arc<dyn QueueClient>,
        property_table_path: Option<PathBuf>,
        n_worker_threads: u32,
        sink: Arc<dyn ResultSink + Send + Sync>,
    ) -> Result<Self> {
        let metadata = MetadataExtractor::with_table_override(property_table_path.as_deref())?;
        let ctx = Arc::new(WorkerContext {
            buffers: Arc::new(ImageBufferCache::new()),
            metadata: Arc::new(metadata),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(n_worker_threads as usize);

        for worker_id in 0..n_worker_threads {
            let queue = queue.clone();
            let ctx = ctx.clone();
            let sink = sink.clone();
            let shutdown = shutdown.clone();
            let private_key = private_key.clone();
            let handle = std::thread::spawn(move || {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if let Err(e) = worker::run(queue.as_ref(), &private_key, &ctx, sink.as_ref()) {
                    error!("worker {} on {} exited with error: {}", worker_id, private_key, e);
                }
            });
            handles.push(handle);
        }

        Ok(Self {
            private_key,
            queue,
            ctx,
            shutdown,
            handles,
        })
    }

    /// Push one `"end"` sentinel per worker, join every thread (logging
    /// rather than failing on an individual join error, matching the
    /// original's treatment of pthread_join failures), then delete the
    /// private queue key.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        for _ in 0..self.handles.len() {
            self.queue.lpush(&self.private_key, "end")?;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("a worker thread on {} panicked during shutdown", self.private_key);
            }
        }
        self.queue.del(&self.private_key)?;
        info!("supervisor for {} torn down", self.private_key);
        Ok(())
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueueClient;
    use crate::request::RequestDescriptor;
    use serde_json::Value;

    struct NullSink;
    impl ResultSink for NullSink {
        fn send_jpeg(&self, _request: &RequestDescriptor, _jpeg: Vec<u8>, _meta: Value) -> Result<()> {
            Ok(())
        }
        fn send_profile(&self, _request: &RequestDescriptor, _xml: String, _meta: Value) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn shutdown_removes_the_private_queue_key() {
        let queue = Arc::new(InMemoryQueueClient::new());
        queue.lpush("private:test", "noop").unwrap();
        let sink: Arc<dyn ResultSink + Send + Sync> = Arc::new(NullSink);
        let supervisor =
            Supervisor::start("private:test".to_string(), queue.clone(), None, 2, sink).unwrap();
        supervisor.shutdown().unwrap();
        assert!(!queue.exists("private:test").unwrap());
    }
}
