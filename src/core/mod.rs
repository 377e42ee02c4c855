pub mod gpu;
pub mod info;
pub mod job;
pub mod pool;
pub mod scheduler;
