/// Thread and memory accounting for the whole node.
///
/// Pure bookkeeping: the pool never inspects the host, totals come from the
/// daemon configuration at startup.
#[derive(Debug)]
pub struct ResourcePool {
    total_threads: u32,
    free_threads: u32,
    total_memory_mb: u64,
    free_memory_mb: u64,
}

impl ResourcePool {
    pub fn new(total_threads: u32, total_memory_mb: u64) -> Self {
        Self {
            total_threads,
            free_threads: total_threads,
            total_memory_mb,
            free_memory_mb: total_memory_mb,
        }
    }

    pub fn total_threads(&self) -> u32 {
        self.total_threads
    }

    pub fn free_threads(&self) -> u32 {
        self.free_threads
    }

    pub fn total_memory_mb(&self) -> u64 {
        self.total_memory_mb
    }

    pub fn free_memory_mb(&self) -> u64 {
        self.free_memory_mb
    }

    /// Atomically reserve threads and memory. Either both counts are
    /// decremented or nothing changes.
    pub fn try_reserve(&mut self, threads: u32, memory_mb: u64) -> bool {
        if threads > self.free_threads || memory_mb > self.free_memory_mb {
            return false;
        }
        self.free_threads -= threads;
        self.free_memory_mb -= memory_mb;
        true
    }

    /// Return a previous reservation to the pool.
    ///
    /// Releasing more than was reserved means the scheduler's accounting is
    /// corrupt, so this aborts rather than clamping.
    pub fn release(&mut self, threads: u32, memory_mb: u64) {
        let free_threads = self.free_threads + threads;
        let free_memory_mb = self.free_memory_mb + memory_mb;
        assert!(
            free_threads <= self.total_threads && free_memory_mb <= self.total_memory_mb,
            "resource pool over-release: {} threads / {} MB freed against {} / {} total",
            free_threads,
            free_memory_mb,
            self.total_threads,
            self.total_memory_mb
        );
        self.free_threads = free_threads;
        self.free_memory_mb = free_memory_mb;
    }
}
