use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use shell::{WorkerPool, WorkerPools};
use tracing::{debug, warn};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PauseGate {
    paused: Mutex<bool>,
    changed: Condvar,
}

impl PauseGate {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.paused
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, paused: bool) {
        *self.lock() = paused;
        self.changed.notify_all();
    }

    fn wait_while_paused(&self) {
        let mut paused = self.lock();
        while *paused {
            paused = self
                .changed
                .wait(paused)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Submits jobs to one pool from any thread.
#[derive(Clone)]
pub(crate) struct JobQueue {
    sender: Sender<Job>,
    pending: Arc<AtomicUsize>,
}

impl JobQueue {
    pub(crate) fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(Box::new(job)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!("job submitted after pool shutdown");
        }
    }
}

/// Job pool backed by a crossbeam channel.
///
/// Threaded pools run jobs on their own thread and `update` only reports
/// the backlog. Inline pools run up to `max_iterations` jobs per `update` on
/// the caller's thread.
pub(crate) struct ChannelWorkerPool {
    name: &'static str,
    queue: JobQueue,
    receiver: Receiver<Job>,
    pending: Arc<AtomicUsize>,
    gate: Arc<PauseGate>,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ChannelWorkerPool {
    pub(crate) fn spawn(name: &'static str, threaded: bool) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(PauseGate::default());

        let (stop, worker) = if threaded {
            let (stop, stopped) = bounded::<()>(1);
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);
            let gate = Arc::clone(&gate);
            let worker = thread::Builder::new()
                .name(format!("worker-{name}"))
                .spawn(move || run_worker(&receiver, &stopped, &pending, &gate))?;
            (Some(stop), Some(worker))
        } else {
            (None, None)
        };

        Ok(Self {
            name,
            queue: JobQueue {
                sender,
                pending: Arc::clone(&pending),
            },
            receiver,
            pending,
            gate,
            stop,
            worker,
        })
    }

    pub(crate) fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

fn run_worker(
    receiver: &Receiver<Job>,
    stopped: &Receiver<()>,
    pending: &AtomicUsize,
    gate: &PauseGate,
) {
    loop {
        select! {
            recv(receiver) -> job => {
                let Ok(job) = job else {
                    return;
                };
                gate.wait_while_paused();
                job();
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            recv(stopped) -> _ => return,
        }
    }
}

impl WorkerPool for ChannelWorkerPool {
    fn update(&mut self, max_iterations: usize) -> usize {
        if self.worker.is_none() {
            for _ in 0..max_iterations {
                let Ok(job) = self.receiver.try_recv() else {
                    break;
                };
                job();
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        self.pending()
    }

    fn pause(&mut self) {
        self.gate.set(true);
    }

    fn resume(&mut self) {
        self.gate.set(false);
    }
}

impl Drop for ChannelWorkerPool {
    fn drop(&mut self) {
        // Jobs still queued are discarded.
        self.stop = None;
        self.gate.set(false);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(pool = self.name, "worker thread panicked");
            }
        }
        debug!(pool = self.name, "worker_pool_stopped");
    }
}

/// Queues for submitting into the five pools after they move into the loop.
#[derive(Clone)]
pub(crate) struct PoolQueues {
    pub texture_cache: JobQueue,
    pub image_decode: JobQueue,
    pub texture_fetch: JobQueue,
    pub vfs: JobQueue,
    pub lfs: JobQueue,
}

pub(crate) fn spawn_pools(threaded: bool) -> std::io::Result<(WorkerPools, PoolQueues)> {
    let texture_cache = ChannelWorkerPool::spawn("texture_cache", threaded)?;
    let image_decode = ChannelWorkerPool::spawn("image_decode", threaded)?;
    let texture_fetch = ChannelWorkerPool::spawn("texture_fetch", threaded)?;
    let vfs = ChannelWorkerPool::spawn("vfs", threaded)?;
    let lfs = ChannelWorkerPool::spawn("lfs", threaded)?;

    let queues = PoolQueues {
        texture_cache: texture_cache.queue(),
        image_decode: image_decode.queue(),
        texture_fetch: texture_fetch.queue(),
        vfs: vfs.queue(),
        lfs: lfs.queue(),
    };

    Ok((
        WorkerPools {
            texture_cache: Box::new(texture_cache),
            image_decode: Box::new(image_decode),
            texture_fetch: Box::new(texture_fetch),
            vfs: Box::new(vfs),
            lfs: Box::new(lfs),
        },
        queues,
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn inline_pool_runs_jobs_only_inside_update() {
        let mut pool = ChannelWorkerPool::spawn("inline", false).expect("spawn");
        let queue = pool.queue();
        let ran = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            queue.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(pool.update(0), 3);
        assert_eq!(pool.update(2), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(pool.update(5), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn threaded_pool_drains_in_background() {
        let mut pool = ChannelWorkerPool::spawn("threaded", true).expect("spawn");
        let queue = pool.queue();
        for _ in 0..10 {
            queue.submit(|| {});
        }

        assert!(wait_until(|| pool.update(1) == 0));
    }

    #[test]
    fn paused_pool_holds_its_backlog() {
        let mut pool = ChannelWorkerPool::spawn("paused", true).expect("spawn");
        let queue = pool.queue();
        pool.pause();
        thread::sleep(Duration::from_millis(20));
        queue.submit(|| {});
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.update(0), 1);

        pool.resume();
        assert!(wait_until(|| pool.update(0) == 0));
    }

    #[test]
    fn drop_joins_worker_while_queues_live() {
        let pool = ChannelWorkerPool::spawn("drop", true).expect("spawn");
        let queue = pool.queue();
        queue.submit(|| {});
        drop(pool);
        queue.submit(|| {});
    }
}
