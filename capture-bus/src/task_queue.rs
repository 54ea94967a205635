use std::{
    sync::mpsc,
    thread::{self, JoinHandle},
};

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Single-worker FIFO executor.
///
/// The worker thread owns `S` (for a media track: its encoder and scratch
/// state), so jobs get exclusive `&mut` access without locking. Jobs run in
/// submission order. There is no cancellation: once submitted a job runs.
pub struct TaskQueue<S> {
    name: String,
    tx: Option<mpsc::Sender<Job<S>>>,
    handle: Option<JoinHandle<S>>,
}

impl<S: Send + 'static> TaskQueue<S> {
    pub fn new(name: &str, state: S) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job<S>>();
        let worker_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log::debug!("task queue {} started", worker_name);
                let mut state = state;
                while let Ok(job) = rx.recv() {
                    job(&mut state);
                }
                log::debug!("task queue {} drained", worker_name);
                state
            })?;

        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueues `job` and returns without waiting for it.
    pub fn submit<F>(&self, job: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("task queue {} is closed", self.name))?;
        tx.send(Box::new(job))
            .map_err(|_| anyhow::anyhow!("task queue {} worker has stopped", self.name))
    }

    /// Closes the queue and blocks until every queued job has run.
    /// Returns the worker state on the first call, `None` afterwards or if
    /// the worker panicked.
    pub fn drain_and_wait(&mut self) -> Option<S> {
        drop(self.tx.take());
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(state) => Some(state),
            Err(_) => {
                log::error!("task queue {} worker panicked", self.name);
                None
            }
        }
    }
}

impl<S> Drop for TaskQueue<S> {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("task queue {} worker panicked", self.name);
            }
        }
    }
}
