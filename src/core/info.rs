/// Point-in-time usage snapshot for the `qinfo` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub used_threads: u32,
    pub total_threads: u32,
    pub used_memory_mb: u64,
    pub total_memory_mb: u64,
    pub used_gpus: usize,
    pub total_gpus: usize,
}

impl std::fmt::Display for QueueInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "threads:{}/{},memory:{}/{},gpus:{}/{}",
            self.used_threads,
            self.total_threads,
            self.used_memory_mb,
            self.total_memory_mb,
            self.used_gpus,
            self.total_gpus
        )
    }
}
