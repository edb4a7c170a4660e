//! Bounded worker pool for media downloads.
//!
//! A fixed number of threads pull [`MediaJob`]s off a shared queue. Each
//! post hands its jobs a dedicated reply channel and a cancel token; when a
//! post times out the orchestrator flips the token and drops the receiver,
//! so late results vanish instead of leaking into the next post's
//! accounting.

use super::{DownloadResult, MediaDownloader};
use crate::error::{LoaderError, Result};
use crate::events::MediaOutcome;
use crate::shutdown::SharedShutdown;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::debug;

/// One media download queued for a worker.
pub struct MediaJob {
    /// Source URL.
    pub url: String,
    /// Final destination path.
    pub dest: PathBuf,
    /// Index of the job within its post.
    pub index: usize,
    /// Post-level cancel token; a cancelled job reports `Failed` without
    /// touching the network.
    pub cancel: Arc<AtomicBool>,
    /// Reply channel of the submitting post.
    pub reply: Sender<(usize, DownloadResult)>,
}

/// Fixed-size pool of download workers.
pub struct WorkerPool {
    queue: Option<Sender<MediaJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing `downloader`.
    pub fn new(
        size: usize,
        downloader: Arc<MediaDownloader>,
        shutdown: Option<SharedShutdown>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<MediaJob>();
        let rx = Arc::new(Mutex::new(rx));

        let size = size.max(1);
        let mut handles = Vec::with_capacity(size);
        for worker in 0..size {
            let rx = Arc::clone(&rx);
            let downloader = Arc::clone(&downloader);
            let shutdown = shutdown.clone();
            let handle = std::thread::Builder::new()
                .name(format!("media-worker-{worker}"))
                .spawn(move || worker_loop(&rx, &downloader, shutdown.as_deref()))
                .map_err(|e| LoaderError::Init(format!("spawn worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            queue: Some(tx),
            handles,
        })
    }

    /// Queue a job. Returns `false` once the pool has been shut down.
    pub fn submit(&self, job: MediaJob) -> bool {
        match &self.queue {
            Some(queue) => queue.send(job).is_ok(),
            None => false,
        }
    }

    /// Shut down without waiting: close the queue and abandon the worker
    /// threads. Running downloads finish on their own deadlines; their late
    /// replies land in dropped channels.
    pub fn shutdown_now(&mut self) {
        self.queue = None;
        let abandoned = self.handles.len();
        self.handles.clear();
        debug!(abandoned, "worker pool shut down without waiting");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Normal teardown: close the queue and wait for workers to drain.
        self.queue = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    rx: &Mutex<Receiver<MediaJob>>,
    downloader: &MediaDownloader,
    shutdown: Option<&crate::shutdown::ShutdownCoordinator>,
) {
    loop {
        let job = {
            let guard = rx.lock().unwrap_or_else(|e| e.into_inner());
            guard.recv()
        };
        let job = match job {
            Ok(job) => job,
            Err(_) => break,
        };

        if shutdown.map_or(false, |s| s.is_shutdown_requested())
            || job.cancel.load(Ordering::SeqCst)
        {
            let _ = job.reply.send((
                job.index,
                DownloadResult {
                    outcome: MediaOutcome::Failed,
                    path: job.dest,
                },
            ));
            continue;
        }

        let result = downloader.download(&job.url, &job.dest);
        let _ = job.reply.send((job.index, result));
    }
}
