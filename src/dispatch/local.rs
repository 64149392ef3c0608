//! In-process backend: fixed pool of threads, fed by a channel.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Sender, Receiver},
    },
    thread,
};
use nohash::IntMap;
use crate::{
    Error,
    err::{add_path, error},
    ext,
    genome::Record,
};
use super::{
    CancelToken,
    backend::{Backend, Handle, TaskSpec, TaskState},
    worker::{Worker, WorkerContext},
};

struct Slot {
    state: TaskState,
    output: Option<Vec<Record>>,
    cancel: CancelToken,
}

type Slots = Arc<Mutex<IntMap<Handle, Slot>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Workers never panic while holding the lock (panics are caught outside), the data stays consistent.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs tasks on a fixed number of local threads.
pub struct LocalBackend {
    next_id: AtomicU64,
    slots: Slots,
    sender: Mutex<Option<Sender<(Handle, TaskSpec)>>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl LocalBackend {
    pub fn new(worker: impl Worker + 'static, threads: usize) -> Self {
        Self::from_arc(Arc::new(worker), threads)
    }

    pub fn from_arc(worker: Arc<dyn Worker>, threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let slots = Slots::default();
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let pool_thread = PoolThread {
                worker: Arc::clone(&worker),
                receiver: Arc::clone(&receiver),
                slots: Arc::clone(&slots),
            };
            handles.push(thread::spawn(move || pool_thread.run()));
        }
        log::debug!("Started local backend with {} threads", threads);
        Self {
            next_id: AtomicU64::new(0),
            slots,
            sender: Mutex::new(Some(sender)),
            handles,
        }
    }

    /// Number of known (not released) tasks.
    pub fn n_tasks(&self) -> usize {
        lock(&self.slots).len()
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn submit(&self, task: TaskSpec) -> Result<Handle, Error> {
        let handle = Handle(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.slots).insert(handle, Slot {
            state: TaskState::Queued,
            output: None,
            cancel: CancelToken::new(),
        });
        let sender = lock(&self.sender);
        let res = sender.as_ref()
            .ok_or_else(|| error!(RuntimeError, "Local backend is shut down"))
            .and_then(|s| s.send((handle, task)).map_err(|_| error!(RuntimeError, "Local backend threads stopped")));
        if let Err(e) = res {
            lock(&self.slots).remove(&handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn poll(&self, handle: Handle) -> Result<TaskState, Error> {
        lock(&self.slots).get(&handle).map(|slot| slot.state.clone())
            .ok_or_else(|| error!(RuntimeError, "Unknown local task {}", handle))
    }

    fn cancel(&self, handle: Handle) -> Result<(), Error> {
        if let Some(slot) = lock(&self.slots).get_mut(&handle) {
            slot.cancel.cancel();
            if slot.state == TaskState::Queued {
                slot.state = TaskState::Cancelled;
            }
        }
        Ok(())
    }

    fn fetch_output(&self, handle: Handle) -> Result<Vec<Record>, Error> {
        let mut slots = lock(&self.slots);
        let slot = slots.get_mut(&handle).ok_or_else(|| error!(RuntimeError, "Unknown local task {}", handle))?;
        match (&slot.state, slot.output.take()) {
            (TaskState::Succeeded, Some(output)) => Ok(output),
            (state, _) => Err(error!(RuntimeError, "Cannot fetch output of task {} in state {:?}", handle, state)),
        }
    }

    fn release(&self, handle: Handle) {
        lock(&self.slots).remove(&handle);
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        for slot in lock(&self.slots).values() {
            slot.cancel.cancel();
        }
        // Closing the channel stops the threads.
        lock(&self.sender).take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Local backend thread panicked");
            }
        }
    }
}

struct PoolThread {
    worker: Arc<dyn Worker>,
    receiver: Arc<Mutex<Receiver<(Handle, TaskSpec)>>>,
    slots: Slots,
}

impl PoolThread {
    fn run(self) {
        loop {
            let msg = lock(&self.receiver).recv();
            let Ok((handle, task)) = msg else { return };
            let cancel = {
                let mut slots = lock(&self.slots);
                match slots.get_mut(&handle) {
                    Some(slot) if slot.state == TaskState::Queued => {
                        slot.state = TaskState::Running;
                        slot.cancel.clone()
                    }
                    // Cancelled or released before start.
                    _ => continue,
                }
            };
            let (state, output) = self.execute(&task, cancel);
            if let Some(slot) = lock(&self.slots).get_mut(&handle) {
                slot.state = state;
                slot.output = output;
            }
        }
    }

    fn execute(&self, task: &TaskSpec, cancel: CancelToken) -> (TaskState, Option<Vec<Record>>) {
        if let Err(e) = ext::sys::mkdir(&task.work_dir).map_err(add_path!(task.work_dir)) {
            return (TaskState::Failed(e.to_string()), None);
        }
        let ctx = WorkerContext {
            attempt: task.attempt,
            work_dir: task.work_dir.clone(),
            algo: Arc::clone(&task.algo),
            cancel,
        };
        log::trace!("Running {} ({})", task.name, task.chunk.region());
        let timer = std::time::Instant::now();
        let res = panic::catch_unwind(AssertUnwindSafe(|| self.worker.run(&task.chunk, &ctx)));
        log::trace!("Finished {} in {}", task.name, ext::fmt::Duration(timer.elapsed()));
        match res {
            Ok(Ok(records)) => (TaskState::Succeeded, Some(records)),
            Ok(Err(Error::Cancelled(_))) => (TaskState::Cancelled, None),
            Ok(Err(Error::JobPreempted(_))) => (TaskState::Preempted, None),
            Ok(Err(e)) => (TaskState::Failed(e.to_string()), None),
            Err(payload) => {
                let msg = payload.downcast_ref::<&str>().map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown reason".to_owned());
                (TaskState::Failed(format!("worker panicked: {}", msg)), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};
    use super::*;
    use crate::{
        dispatch::{backend::Resources, worker::AlgoConfig},
        genome::{Chromosome, GeneticMap, Span},
        plan::{self, Chunk, EmptyPolicy},
    };

    fn chunk() -> Arc<Chunk> {
        let records = (0..20).map(|p| Record::new(p, "0|1")).collect();
        let chrom = Chromosome::new("chr1", records, Arc::new(GeneticMap::uniform())).unwrap()
            .with_extent(Span::new(0, 20)).unwrap();
        let windows = plan::plan("chr1", chrom.extent(), 20, 5).unwrap();
        Arc::new(plan::extract(&chrom, &windows[0], EmptyPolicy::Fail).unwrap())
    }

    fn task(dir: &std::path::Path, chunk: &Arc<Chunk>, attempt: u32) -> TaskSpec {
        TaskSpec {
            name: format!("task{}", attempt),
            chunk: Arc::clone(chunk),
            attempt,
            work_dir: dir.join(format!("attempt_{}", attempt)),
            resources: Resources::estimate(chunk, 1),
            algo: Arc::new(AlgoConfig::default()),
        }
    }

    fn wait(backend: &LocalBackend, handle: Handle) -> TaskState {
        let timer = Instant::now();
        loop {
            let state = backend.poll(handle).unwrap();
            if state.is_finished() || timer.elapsed() > Duration::from_secs(10) {
                return state;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn run_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let worker = |chunk: &Chunk, ctx: &WorkerContext| {
            assert!(ctx.work_dir.exists());
            match ctx.attempt {
                1 => Ok(chunk.records()[..3].to_vec()),
                2 => Err(Error::JobFailed("bad input".to_owned())),
                3 => Err(Error::JobPreempted("node lost".to_owned())),
                _ => panic!("unexpected attempt"),
            }
        };
        let backend = LocalBackend::new(worker, 2);
        let chunk = chunk();
        let handles: Vec<_> = (1..=4).map(|i| backend.submit(task(dir.path(), &chunk, i)).unwrap()).collect();
        assert_eq!(wait(&backend, handles[0]), TaskState::Succeeded);
        assert_eq!(backend.fetch_output(handles[0]).unwrap().len(), 3);
        assert!(matches!(wait(&backend, handles[1]), TaskState::Failed(_)));
        assert!(backend.fetch_output(handles[1]).is_err());
        assert_eq!(wait(&backend, handles[2]), TaskState::Preempted);
        match wait(&backend, handles[3]) {
            TaskState::Failed(reason) => assert!(reason.contains("unexpected attempt")),
            state => panic!("Unexpected state {:?}", state),
        }
        assert!(dir.path().join("attempt_1").exists());
        for &handle in &handles {
            backend.release(handle);
        }
        assert_eq!(backend.n_tasks(), 0);
        assert!(backend.poll(handles[0]).is_err());
    }

    #[test]
    fn cancel_running() {
        let dir = tempfile::tempdir().unwrap();
        let worker = |_chunk: &Chunk, ctx: &WorkerContext| {
            let timer = Instant::now();
            while !ctx.cancel.is_cancelled() {
                if timer.elapsed() > Duration::from_secs(10) {
                    return Ok(Vec::<Record>::new());
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(Error::Cancelled("stopped".to_owned()))
        };
        let backend = LocalBackend::new(worker, 1);
        let chunk = chunk();
        let h1 = backend.submit(task(dir.path(), &chunk, 1)).unwrap();
        // Second task waits in the queue behind the first one.
        let h2 = backend.submit(task(dir.path(), &chunk, 2)).unwrap();
        while backend.poll(h1).unwrap() == TaskState::Queued {
            thread::sleep(Duration::from_millis(2));
        }
        backend.cancel(h2).unwrap();
        assert_eq!(backend.poll(h2).unwrap(), TaskState::Cancelled);
        backend.cancel(h1).unwrap();
        assert_eq!(wait(&backend, h1), TaskState::Cancelled);
        assert!(!dir.path().join("attempt_2").exists());
    }
}
