use crate::core::gpu::GpuDeviceSet;
use crate::core::info::QueueInfo;
use crate::core::job::{Job, JobRequest, JobStatus};
use crate::core::pool::ResourcePool;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::time::SystemTime;

/// Job ids are assigned from 1 and wrap before this bound.
pub const MAX_JOB_ID: u32 = 10_000_000;

/// Why a submission was refused at admission. Every variant is a permanent
/// condition: the job is never created and the client should not retry
/// unchanged.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("invalid job id {0}")]
    InvalidId(u32),
    #[error("job id {0} is already in use")]
    DuplicateId(u32),
    #[error("{requested} threads requested but the node has {total}")]
    TooManyThreads { requested: u32, total: u32 },
    #[error("{requested} MB requested but the node has {total} MB")]
    TooMuchMemory { requested: u64, total: u64 },
    #[error("{requested} GPUs requested but the node has {total}")]
    TooManyGpus { requested: u32, total: usize },
    #[error("job {0} cannot depend on itself")]
    SelfDependency(u32),
}

/// A pending start notification produced by a scheduling pass.
///
/// Scheduling commits the allocation and enqueues one of these; delivery to
/// the job's origin happens later, outside the scheduler lock, and its
/// outcome never feeds back into scheduling state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartNotice {
    pub job_id: u32,
    pub host: String,
    pub port: u16,
    pub gpu_ids: Vec<u32>,
}

/// Which job field a `qdel` pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSpec {
    Id,
    Name,
}

/// One job matched by `find_jobs`. Carries the owner so the caller can run
/// the permission check as a separate step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMatch {
    pub job_id: u32,
    pub name: String,
    pub user: String,
}

/// Deletion permission: root may delete anything, everyone else only their
/// own jobs. Exact string equality, no groups.
pub fn may_delete(requester: &str, owner: &str) -> bool {
    requester == "root" || requester == owner
}

pub struct Scheduler {
    pool: ResourcePool,
    gpus: GpuDeviceSet,
    jobs: HashMap<u32, Job>,
    // Disjoint id sets partitioning `jobs`; BTreeSet keeps FIFO-by-id order.
    running: BTreeSet<u32>,
    waiting: BTreeSet<u32>,
    held: BTreeSet<u32>,
    next_job_id: u32,
    abort_on_time_limit: bool,
    outbox: Vec<StartNotice>,
}

impl Scheduler {
    pub fn new(
        total_threads: u32,
        total_memory_mb: u64,
        device_ids: &[u32],
        reserved_ids: &[u32],
        abort_on_time_limit: bool,
    ) -> Self {
        Self {
            pool: ResourcePool::new(total_threads, total_memory_mb),
            gpus: GpuDeviceSet::new(device_ids, reserved_ids),
            jobs: HashMap::new(),
            running: BTreeSet::new(),
            waiting: BTreeSet::new(),
            held: BTreeSet::new(),
            next_job_id: 1,
            abort_on_time_limit,
            outbox: Vec::new(),
        }
    }

    pub fn abort_on_time_limit(&self) -> bool {
        self.abort_on_time_limit
    }

    /// Hand out the next job id, cycling below [`MAX_JOB_ID`] and never 0.
    /// Ids still held by live jobs are skipped so a wrapped counter cannot
    /// hand out an id whose submission would then collide.
    pub fn allocate_job_id(&mut self) -> u32 {
        loop {
            let id = self.next_job_id;
            self.next_job_id += 1;
            if self.next_job_id >= MAX_JOB_ID {
                self.next_job_id = 1;
            }
            if !self.jobs.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn get_job(&self, job_id: u32) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Admission control. A request is rejected iff it can never run on this
    /// node: a single resource exceeding the node TOTAL (reserved GPUs count
    /// toward the total but can never be allocated, so such a request would
    /// otherwise starve forever), an unusable or duplicate id, or a
    /// self-dependency. Current free capacity plays no part here.
    ///
    /// On acceptance the job is created as waiting and a scheduling pass is
    /// triggered, so it may be running by the time this returns.
    pub fn submit_job(&mut self, request: JobRequest) -> Result<(), RejectReason> {
        if request.id == 0 || request.id >= MAX_JOB_ID {
            return Err(RejectReason::InvalidId(request.id));
        }
        if self.jobs.contains_key(&request.id) {
            return Err(RejectReason::DuplicateId(request.id));
        }
        if request.threads > self.pool.total_threads() {
            return Err(RejectReason::TooManyThreads {
                requested: request.threads,
                total: self.pool.total_threads(),
            });
        }
        if request.memory_mb > self.pool.total_memory_mb() {
            return Err(RejectReason::TooMuchMemory {
                requested: request.memory_mb,
                total: self.pool.total_memory_mb(),
            });
        }
        if request.gpus as usize > self.gpus.total() {
            return Err(RejectReason::TooManyGpus {
                requested: request.gpus,
                total: self.gpus.total(),
            });
        }
        if request.depends_on.contains(&request.id) {
            return Err(RejectReason::SelfDependency(request.id));
        }

        let job_id = request.id;
        self.jobs.insert(job_id, Job::new(request));
        self.waiting.insert(job_id);
        tracing::info!("Accepted job {job_id} as waiting");

        self.schedule();
        Ok(())
    }

    /// One scheduling pass: scan the waiting set (as of entry) in ascending
    /// id order and start every job whose dependencies are gone and whose
    /// resources fit. Non-preemptive and greedy; a blocked large job does not
    /// stop smaller jobs behind it from starting.
    fn schedule(&mut self) {
        let candidates: Vec<u32> = self.waiting.iter().copied().collect();
        for job_id in candidates {
            // Eligibility is re-evaluated live within the pass.
            if !self.waiting.contains(&job_id) {
                continue;
            }
            let job = &self.jobs[&job_id];

            // A dependency is satisfied only once its id is no longer known
            // (deleted or finished).
            if job.request.depends_on.iter().any(|d| self.jobs.contains_key(d)) {
                continue;
            }

            let (threads, memory_mb, gpus) =
                (job.request.threads, job.request.memory_mb, job.request.gpus);
            if !self.pool.try_reserve(threads, memory_mb) {
                continue;
            }
            let Some(gpu_ids) = self.gpus.try_allocate(gpus) else {
                // Devices were the bottleneck; give the threads and memory back.
                self.pool.release(threads, memory_mb);
                continue;
            };

            self.waiting.remove(&job_id);
            self.running.insert(job_id);
            let job = self.jobs.get_mut(&job_id).expect("job vanished mid-pass");
            job.status = JobStatus::Running;
            job.gpu_ids = Some(gpu_ids.clone());
            job.started_at = Some(SystemTime::now());
            tracing::info!("Job {job_id} started on GPUs {gpu_ids:?}");

            self.outbox.push(StartNotice {
                job_id,
                host: job.request.host.clone(),
                port: job.request.port,
                gpu_ids,
            });
        }
    }

    /// Drain start notices produced by scheduling passes since the last call.
    /// The caller delivers them outside the scheduler's critical section.
    pub fn take_notices(&mut self) -> Vec<StartNotice> {
        std::mem::take(&mut self.outbox)
    }

    /// Remove a job, releasing its allocation if it was running, then run a
    /// scheduling pass over whatever became feasible. Unknown ids are a
    /// no-op (duplicate and late completion notices are expected).
    pub fn delete_job(&mut self, job_id: u32) -> bool {
        let Some(job) = self.jobs.remove(&job_id) else {
            return false;
        };
        match job.status {
            JobStatus::Running => {
                self.running.remove(&job_id);
                self.pool.release(job.request.threads, job.request.memory_mb);
                let gpu_ids = job.gpu_ids.as_deref().unwrap_or(&[]);
                self.gpus.release(gpu_ids);
            }
            JobStatus::Waiting => {
                self.waiting.remove(&job_id);
            }
            JobStatus::Held => {
                self.held.remove(&job_id);
            }
        }
        tracing::info!("Deleted job {job_id} ({})", job.status);
        self.schedule();
        true
    }

    /// Park a waiting job so scheduling passes skip it. Running jobs cannot
    /// be held.
    pub fn hold_job(&mut self, job_id: u32) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        if job.status != JobStatus::Waiting {
            return false;
        }
        job.status = JobStatus::Held;
        self.waiting.remove(&job_id);
        self.held.insert(job_id);
        true
    }

    /// Move a held job back to waiting and retry scheduling.
    pub fn release_job(&mut self, job_id: u32) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        if job.status != JobStatus::Held {
            return false;
        }
        job.status = JobStatus::Waiting;
        self.held.remove(&job_id);
        self.waiting.insert(job_id);
        self.schedule();
        true
    }

    /// Glob-match jobs across all three collections by id or name.
    ///
    /// This only matches; whether the requester may actually delete a match
    /// is decided per job by the caller via [`may_delete`], so denied
    /// matches still show up in the report.
    pub fn find_jobs(&self, spec: MatchSpec, pattern: &str) -> Vec<JobMatch> {
        let re = glob_to_regex(pattern);
        let mut ids: Vec<u32> = self.jobs.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| {
                let job = &self.jobs[&id];
                let field = match spec {
                    MatchSpec::Id => id.to_string(),
                    MatchSpec::Name => job.request.name.clone(),
                };
                if re.is_match(&field) {
                    Some(JobMatch {
                        job_id: id,
                        name: job.request.name.clone(),
                        user: job.request.user.clone(),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            used_threads: self.pool.total_threads() - self.pool.free_threads(),
            total_threads: self.pool.total_threads(),
            used_memory_mb: self.pool.total_memory_mb() - self.pool.free_memory_mb(),
            total_memory_mb: self.pool.total_memory_mb(),
            used_gpus: self.gpus.allocated_count(),
            total_gpus: self.gpus.total(),
        }
    }

    /// All jobs grouped running, waiting, held, each group ascending by id.
    pub fn jobs_sorted(&self) -> Vec<&Job> {
        self.running
            .iter()
            .chain(self.waiting.iter())
            .chain(self.held.iter())
            .map(|id| &self.jobs[id])
            .collect()
    }

    /// Running jobs whose declared time limit has elapsed as of `now`. The
    /// scheduler never reads the clock itself; the monitor task passes it in.
    pub fn overdue_jobs(&self, now: SystemTime) -> Vec<u32> {
        self.running
            .iter()
            .filter(|id| self.jobs[id].has_exceeded_time_limit(now))
            .copied()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn backdate_started_at(&mut self, job_id: u32, started_at: SystemTime) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.started_at = Some(started_at);
        }
    }

    #[cfg(test)]
    fn assert_partition(&self) {
        assert_eq!(
            self.running.len() + self.waiting.len() + self.held.len(),
            self.jobs.len()
        );
        for id in self.jobs.keys() {
            let n = [&self.running, &self.waiting, &self.held]
                .iter()
                .filter(|s| s.contains(id))
                .count();
            assert_eq!(n, 1, "job {id} is in {n} collections");
        }
    }
}

/// Translate a `qdel` glob (`*` = any sequence) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Regex {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).expect("escaped glob is always a valid regex")
}
