use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};
use strum::Display;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Display)]
pub enum JobStatus {
    #[strum(to_string = "running")]
    Running,
    #[strum(to_string = "waiting")]
    Waiting,
    #[strum(to_string = "held")]
    Held,
}

/// Immutable submission-time description of a job, as carried by the
/// `request:` protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Server-assigned via `get_id`, echoed back in the request.
    pub id: u32,
    /// Where to reach the submitting client for the start notification.
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub threads: u32,
    pub memory_mb: u64,
    pub gpus: u32,
    /// Time limit in hours, 0 = unlimited.
    pub hours: u32,
    pub depends_on: BTreeSet<u32>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub request: JobRequest,
    pub status: JobStatus,
    /// Populated only while running; length equals `request.gpus`.
    pub gpu_ids: Option<Vec<u32>>,
    pub started_at: Option<SystemTime>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            request,
            status: JobStatus::Waiting,
            gpu_ids: None,
            started_at: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.request.id
    }

    pub fn has_exceeded_time_limit(&self, now: SystemTime) -> bool {
        if self.request.hours == 0 {
            return false;
        }
        let Some(started_at) = self.started_at else {
            return false;
        };
        let limit = Duration::from_secs(u64::from(self.request.hours) * 3600);
        now.duration_since(started_at)
            .map(|elapsed| elapsed > limit)
            .unwrap_or(false)
    }
}

#[derive(Default)]
pub struct JobRequestBuilder {
    id: u32,
    host: String,
    port: u16,
    name: String,
    user: String,
    threads: u32,
    memory_mb: u64,
    gpus: u32,
    hours: u32,
    depends_on: BTreeSet<u32>,
}

impl JobRequestBuilder {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            host: "localhost".to_string(),
            user: "nobody".to_string(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn origin(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }

    pub fn threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    pub fn memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn gpus(mut self, gpus: u32) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn hours(mut self, hours: u32) -> Self {
        self.hours = hours;
        self
    }

    pub fn depends_on(mut self, ids: &[u32]) -> Self {
        self.depends_on = ids.iter().copied().collect();
        self
    }

    pub fn build(self) -> JobRequest {
        JobRequest {
            id: self.id,
            host: self.host,
            port: self.port,
            name: self.name,
            user: self.user,
            threads: self.threads,
            memory_mb: self.memory_mb,
            gpus: self.gpus,
            hours: self.hours,
            depends_on: self.depends_on,
        }
    }
}

impl JobRequest {
    pub fn builder(id: u32) -> JobRequestBuilder {
        JobRequestBuilder::new(id)
    }
}
