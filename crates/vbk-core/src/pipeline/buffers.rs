use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::error::{Result, VbkError};

/// Reusable per-block working memory.
#[derive(Default)]
pub struct BufferSlot {
    pub raw: Vec<u8>,
    pub compressed: Vec<u8>,
    pub ciphered: Vec<u8>,
    pub output: Vec<u8>,
    pub hasher: Sha256,
}

impl BufferSlot {
    /// SHA-256 of `data`, reusing the slot's hasher state.
    pub fn digest_of(hasher: &mut Sha256, data: &[u8]) -> [u8; 32] {
        hasher.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize_reset());
        out
    }
}

struct Slot {
    available: AtomicBool,
    buffers: Mutex<BufferSlot>,
}

/// Fixed set of buffer slots plus the shared gate around native disk calls
/// and the executor for detached follow-up work.
pub struct BufferPool {
    slots: Vec<Slot>,
    running: AtomicBool,
    wait_lock: Mutex<()>,
    freed: Condvar,
    poll_interval: Duration,
    native_gate: Mutex<()>,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    executor: SubtaskExecutor,
}

impl BufferPool {
    pub fn new(slot_count: usize, poll_interval: Duration, subtask_threads: usize) -> Result<Self> {
        let slots = (0..slot_count.max(1))
            .map(|_| Slot {
                available: AtomicBool::new(true),
                buffers: Mutex::new(BufferSlot::default()),
            })
            .collect();
        Ok(Self {
            slots,
            running: AtomicBool::new(true),
            wait_lock: Mutex::new(()),
            freed: Condvar::new(),
            poll_interval,
            native_gate: Mutex::new(()),
            in_use: AtomicUsize::new(0),
            peak_in_use: AtomicUsize::new(0),
            executor: SubtaskExecutor::new(subtask_threads)?,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Block until a slot can be claimed. Returns `None` once the pool is stopped.
    pub fn acquire(&self) -> Option<SlotGuard<'_>> {
        let mut waiting = self.wait_lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if !self.is_running() {
                return None;
            }
            for (index, slot) in self.slots.iter().enumerate() {
                if slot
                    .available
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    drop(waiting);
                    let now = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
                    self.peak_in_use.fetch_max(now, Ordering::Relaxed);
                    let buffers = slot.buffers.lock().unwrap_or_else(PoisonError::into_inner);
                    return Some(SlotGuard {
                        pool: self,
                        index,
                        buffers: Some(buffers),
                    });
                }
            }
            waiting = self
                .freed
                .wait_timeout(waiting, self.poll_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, index: usize) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.slots[index].available.store(true, Ordering::Release);
        let _waiting = self.wait_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.freed.notify_all();
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Stop handing out slots. In-flight blocks finish their current stage.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!("buffer pool stopped");
        }
        let _waiting = self.wait_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.freed.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Slots currently claimed.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use.load(Ordering::Relaxed)
    }

    /// Run a native disk call. At most one runs at a time across the pool.
    pub fn native<T>(&self, op: &str, call: impl FnOnce() -> T) -> T {
        let _gate = self.native_gate.lock().unwrap_or_else(PoisonError::into_inner);
        trace!(op, "native gate acquired");
        let out = call();
        trace!(op, "native gate released");
        out
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.executor.submit(task);
    }

    /// Wait for detached tasks. Returns false if some were still pending at `timeout`.
    pub fn wait_sub_tasks(&self, timeout: Duration) -> bool {
        self.executor.wait(timeout)
    }
}

/// Exclusive use of one slot. Dropping it returns the slot to the pool.
pub struct SlotGuard<'a> {
    pool: &'a BufferPool,
    index: usize,
    buffers: Option<MutexGuard<'a, BufferSlot>>,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for SlotGuard<'_> {
    type Target = BufferSlot;

    fn deref(&self) -> &BufferSlot {
        match &self.buffers {
            Some(buffers) => &**buffers,
            None => unreachable!("slot buffers are only taken on drop"),
        }
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut BufferSlot {
        match &mut self.buffers {
            Some(buffers) => &mut **buffers,
            None => unreachable!("slot buffers are only taken on drop"),
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        drop(self.buffers.take());
        self.pool.release(self.index);
    }
}

/// Detached task runner with a pending counter the orchestrator can wait on.
struct SubtaskExecutor {
    pool: rayon::ThreadPool,
    pending: Arc<Pending>,
}

struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

/// Decrements the pending count even if the task panics.
struct PendingToken(Arc<Pending>);

impl Drop for PendingToken {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.0.drained.notify_all();
        }
    }
}

impl SubtaskExecutor {
    fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("vbk-subtask-{i}"))
            .build()
            .map_err(|e| VbkError::Other(format!("subtask thread pool: {e}")))?;
        Ok(Self {
            pool,
            pending: Arc::new(Pending {
                count: Mutex::new(0),
                drained: Condvar::new(),
            }),
        })
    }

    fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self
            .pending
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        let token = PendingToken(Arc::clone(&self.pending));
        self.pool.spawn(move || {
            let _token = token;
            task();
        });
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self
            .pending
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .pending
                .drained
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}
