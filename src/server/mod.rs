//! The network dispatcher: accepts connections, parses one command per
//! connection, and relays it into the scheduler.
//!
//! All scheduler access goes through a single `RwLock`, so every operation
//! observes fully consistent accounting. Start notices are drained from the
//! scheduler's outbox and delivered only after the lock is released;
//! allocation success is never contingent on delivery success.

pub mod monitor;
pub mod notify;
pub mod proto;

use crate::config::Config;
use crate::core::job::Job;
use crate::core::scheduler::{may_delete, Scheduler};
use proto::Request;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

pub type SharedState = Arc<RwLock<Scheduler>>;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(
        config.resources.threads,
        config.resources.memory_mb,
        &config.resources.gpus,
        &config.resources.reserved_gpus,
        config.daemon.abort_on_time_limit,
    );
    let state: SharedState = Arc::new(RwLock::new(scheduler));
    let notify_timeout = Duration::from_secs(config.daemon.notify_timeout_secs);

    if config.daemon.abort_on_time_limit {
        tokio::spawn(monitor::run(Arc::clone(&state), notify_timeout));
    }

    let addr = format!("{}:{}", config.daemon.host, config.daemon.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {addr}");

    tokio::select! {
        result = serve(listener, state, notify_timeout) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down");
            Ok(())
        }
    }
}

pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    notify_timeout: Duration,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state, notify_timeout).await {
                tracing::debug!("Connection from {peer} ended with error: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: SharedState,
    notify_timeout: Duration,
) -> anyhow::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let request = match proto::parse_request(&line) {
        Ok(request) => request,
        Err(e) => {
            // Nothing was parsed into a scheduler call, so nothing mutated.
            writer.write_all(format!("error:{e}\n").as_bytes()).await?;
            return Ok(());
        }
    };

    match request {
        Request::GetId => {
            let id = state.write().await.allocate_job_id();
            writer.write_all(format!("{id}\n").as_bytes()).await?;
        }
        Request::Submit(job_request) => {
            let (reply, notices) = {
                let mut scheduler = state.write().await;
                match scheduler.submit_job(job_request) {
                    Ok(()) => ("accept".to_string(), scheduler.take_notices()),
                    Err(e) => (e.to_string(), Vec::new()),
                }
            };
            writer.write_all(format!("{reply}\n").as_bytes()).await?;
            notify::deliver_start_notices(notices, notify_timeout);
        }
        Request::Finished(job_id) => {
            handle_terminal_event(&mut writer, &state, job_id, "finished", notify_timeout).await?;
        }
        Request::Timeout(job_id) => {
            if state.read().await.abort_on_time_limit() {
                handle_terminal_event(&mut writer, &state, job_id, "timeout", notify_timeout)
                    .await?;
            } else {
                tracing::debug!("Ignoring timeout notice for job {job_id}");
                writer.write_all(b"ok\n").await?;
            }
        }
        Request::Hold(job_id) => {
            let held = state.write().await.hold_job(job_id);
            writer
                .write_all(if held { b"ok\n" } else { b"unknown\n" })
                .await?;
        }
        Request::Release(job_id) => {
            let (released, notices) = {
                let mut scheduler = state.write().await;
                let released = scheduler.release_job(job_id);
                (released, scheduler.take_notices())
            };
            writer
                .write_all(if released { b"ok\n" } else { b"unknown\n" })
                .await?;
            notify::deliver_start_notices(notices, notify_timeout);
        }
        Request::QInfo => {
            let info = state.read().await.info();
            writer.write_all(format!("{info}\n").as_bytes()).await?;
        }
        Request::QStat { verbose } => {
            handle_qstat(&mut reader, &mut writer, &state, verbose).await?;
        }
        Request::QDel => {
            handle_qdel(&mut reader, &mut writer, &state, notify_timeout).await?;
        }
    }

    Ok(())
}

/// `finished` and `timeout` both notify the origin best-effort and then
/// delete. Unknown ids are late or duplicate notices and stay a no-op.
async fn handle_terminal_event(
    writer: &mut OwnedWriteHalf,
    state: &SharedState,
    job_id: u32,
    event: &str,
    notify_timeout: Duration,
) -> anyhow::Result<()> {
    let (origin, notices) = {
        let mut scheduler = state.write().await;
        let origin = scheduler
            .get_job(job_id)
            .map(|job| (job.request.host.clone(), job.request.port));
        if origin.is_some() {
            scheduler.delete_job(job_id);
        }
        (origin, scheduler.take_notices())
    };

    writer.write_all(b"ok\n").await?;
    if let Some((host, port)) = origin {
        notify::notify(&host, port, event, notify_timeout).await;
    }
    notify::deliver_start_notices(notices, notify_timeout);
    Ok(())
}

/// One line per job, grouped running/waiting/held and sorted by id within
/// each group. The client acknowledges each line; the listing ends with
/// `end`.
async fn handle_qstat(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    state: &SharedState,
    verbose: bool,
) -> anyhow::Result<()> {
    let lines: Vec<String> = {
        let scheduler = state.read().await;
        scheduler
            .jobs_sorted()
            .iter()
            .map(|job| format_job_line(job, verbose))
            .collect()
    };

    writer.write_all(format!("{}\n", lines.len()).as_bytes()).await?;
    let mut ack = String::new();
    for line in lines {
        writer.write_all(format!("{line}\n").as_bytes()).await?;
        ack.clear();
        if reader.read_line(&mut ack).await? == 0 {
            // Client went away mid-listing; nothing to clean up.
            return Ok(());
        }
    }
    writer.write_all(b"end\n").await?;
    Ok(())
}

fn format_job_line(job: &Job, verbose: bool) -> String {
    let request = &job.request;
    if !verbose {
        return format!("{}:{}:{}", request.id, job.status, request.name);
    }

    let deps = request
        .depends_on
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("+");
    let gpu_ids = job
        .gpu_ids
        .as_deref()
        .map(notify::format_gpu_ids)
        .unwrap_or_default();
    let started = job
        .started_at
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{}:{}:{}:{}:{}:{}:{}:{}:[{}]:{}",
        request.id,
        job.status,
        request.name,
        request.user,
        request.threads,
        request.memory_mb,
        request.gpus,
        deps,
        gpu_ids,
        started
    )
}

/// Interactive bulk deletion: `specifier:pattern:user` lines until an empty
/// one. Matching and authorization are separate steps so denied matches are
/// still reported; each batch's report ends with a blank line.
async fn handle_qdel(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    state: &SharedState,
    notify_timeout: Duration,
) -> anyhow::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            return Ok(());
        }

        let query = match proto::parse_qdel_line(&line) {
            Ok(query) => query,
            Err(e) => {
                writer.write_all(format!("error:{e}\n\n").as_bytes()).await?;
                continue;
            }
        };

        let (report, notices) = {
            let mut scheduler = state.write().await;
            let matches = scheduler.find_jobs(query.spec, &query.pattern);
            let mut report = Vec::with_capacity(matches.len());
            if matches.is_empty() {
                report.push("not-found".to_string());
            }
            for m in matches {
                if may_delete(&query.user, &m.user) {
                    scheduler.delete_job(m.job_id);
                    report.push(format!("{}:deleted", m.job_id));
                } else {
                    tracing::info!(
                        "User {} denied deletion of job {} owned by {}",
                        query.user,
                        m.job_id,
                        m.user
                    );
                    report.push(format!("{}:permission-denied", m.job_id));
                }
            }
            (report, scheduler.take_notices())
        };

        for entry in report {
            writer.write_all(format!("{entry}\n").as_bytes()).await?;
        }
        writer.write_all(b"\n").await?;
        notify::deliver_start_notices(notices, notify_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourcesConfig;

    async fn spawn_test_server(resources: ResourcesConfig) -> (std::net::SocketAddr, SharedState) {
        let scheduler = Scheduler::new(
            resources.threads,
            resources.memory_mb,
            &resources.gpus,
            &resources.reserved_gpus,
            true,
        );
        let state: SharedState = Arc::new(RwLock::new(scheduler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve_state = Arc::clone(&state);
        tokio::spawn(serve(listener, serve_state, Duration::from_millis(200)));
        (addr, state)
    }

    fn test_resources() -> ResourcesConfig {
        ResourcesConfig {
            threads: 4,
            memory_mb: 4096,
            gpus: vec![0, 1],
            reserved_gpus: vec![],
        }
    }

    async fn roundtrip(addr: std::net::SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(format!("{request}\n").as_bytes()).await.unwrap();
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await.unwrap();
        reply.trim_end().to_string()
    }

    #[tokio::test]
    async fn test_get_id_and_submit() {
        let (addr, state) = spawn_test_server(test_resources()).await;

        assert_eq!(roundtrip(addr, "get_id").await, "1");
        assert_eq!(roundtrip(addr, "get_id").await, "2");

        let reply = roundtrip(addr, "request:1,127.0.0.1,1,prep,2,1024,1,0,alice,").await;
        assert_eq!(reply, "accept");
        assert_eq!(state.read().await.job_count(), 1);

        // Exceeds total threads: rejected, never created.
        let reply = roundtrip(addr, "request:2,127.0.0.1,1,big,5,0,0,0,alice,").await;
        assert!(reply.contains("threads"), "unexpected reply: {reply}");
        assert_eq!(state.read().await.job_count(), 1);
    }

    #[tokio::test]
    async fn test_start_notification_reaches_origin() {
        let (addr, _state) = spawn_test_server(test_resources()).await;

        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (stream, _) = origin.accept().await.unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).await.unwrap();
            line
        });

        let request = format!("request:5,127.0.0.1,{origin_port},train,1,0,2,0,alice,");
        assert_eq!(roundtrip(addr, &request).await, "accept");
        assert_eq!(accept.await.unwrap(), "run:0,1\n");
    }

    #[tokio::test]
    async fn test_finished_frees_resources() {
        let (addr, state) = spawn_test_server(test_resources()).await;

        assert_eq!(
            roundtrip(addr, "request:1,127.0.0.1,1,a,4,0,0,0,alice,").await,
            "accept"
        );
        assert_eq!(
            roundtrip(addr, "request:2,127.0.0.1,1,b,4,0,0,0,alice,").await,
            "accept"
        );

        assert_eq!(roundtrip(addr, "finished:1").await, "ok");
        // Duplicate notice stays a harmless no-op.
        assert_eq!(roundtrip(addr, "finished:1").await, "ok");

        let scheduler = state.read().await;
        assert!(scheduler.get_job(1).is_none());
        assert_eq!(
            scheduler.get_job(2).unwrap().status,
            crate::core::job::JobStatus::Running
        );
    }

    #[tokio::test]
    async fn test_qinfo_snapshot() {
        let (addr, _state) = spawn_test_server(test_resources()).await;
        assert_eq!(roundtrip(addr, "qinfo").await, "threads:0/4,memory:0/4096,gpus:0/2");

        assert_eq!(
            roundtrip(addr, "request:1,127.0.0.1,1,a,2,1024,1,0,alice,").await,
            "accept"
        );
        assert_eq!(roundtrip(addr, "qinfo").await, "threads:2/4,memory:1024/4096,gpus:1/2");
    }

    #[tokio::test]
    async fn test_qstat_acknowledged_listing() {
        let (addr, _state) = spawn_test_server(test_resources()).await;
        roundtrip(addr, "request:1,127.0.0.1,1,a,4,0,0,0,alice,").await;
        roundtrip(addr, "request:2,127.0.0.1,1,b,4,0,0,0,bob,").await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"qstat:terse\n").await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "2");

        let mut jobs = Vec::new();
        for _ in 0..2 {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            jobs.push(line.trim_end().to_string());
            write_half.write_all(b"ack\n").await.unwrap();
        }
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "end");

        // Running group first, then waiting.
        assert_eq!(jobs, vec!["1:running:a", "2:waiting:b"]);
    }

    #[tokio::test]
    async fn test_qdel_mixed_ownership() {
        let (addr, state) = spawn_test_server(test_resources()).await;
        roundtrip(addr, "request:1,127.0.0.1,1,test1,1,0,0,0,alice,").await;
        roundtrip(addr, "request:2,127.0.0.1,1,test2,1,0,0,0,bob,").await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"qdel\n").await.unwrap();
        stream.write_all(b"name:test*:alice\n").await.unwrap();
        stream.write_all(b"\n").await.unwrap();
        let mut reader = BufReader::new(stream);

        let mut batch = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 || line == "\n" {
                break;
            }
            batch.push(line.trim_end().to_string());
        }
        assert_eq!(batch, vec!["1:deleted", "2:permission-denied"]);

        let scheduler = state.read().await;
        assert!(scheduler.get_job(1).is_none());
        assert!(scheduler.get_job(2).is_some());
    }

    #[tokio::test]
    async fn test_qdel_not_found() {
        let (addr, _state) = spawn_test_server(test_resources()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"qdel\nid:99*:root\n\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "not-found");
    }

    #[tokio::test]
    async fn test_malformed_request_mutates_nothing() {
        let (addr, state) = spawn_test_server(test_resources()).await;
        let reply = roundtrip(addr, "request:1,127.0.0.1,1,a,NaN,0,0,0,alice,").await;
        assert!(reply.starts_with("error:"), "unexpected reply: {reply}");
        assert_eq!(state.read().await.job_count(), 0);
    }

    #[tokio::test]
    async fn test_hold_and_release_over_the_wire() {
        let (addr, state) = spawn_test_server(test_resources()).await;
        roundtrip(addr, "request:1,127.0.0.1,1,a,4,0,0,0,alice,").await;
        roundtrip(addr, "request:2,127.0.0.1,1,b,4,0,0,0,alice,").await;

        assert_eq!(roundtrip(addr, "hold:2").await, "ok");
        assert_eq!(roundtrip(addr, "hold:99").await, "unknown");
        assert_eq!(roundtrip(addr, "finished:1").await, "ok");
        // Held jobs are skipped even with the node idle.
        assert_eq!(
            state.read().await.get_job(2).unwrap().status,
            crate::core::job::JobStatus::Held
        );
        assert_eq!(roundtrip(addr, "release:2").await, "ok");
        assert_eq!(
            state.read().await.get_job(2).unwrap().status,
            crate::core::job::JobStatus::Running
        );
    }

    #[test]
    fn test_format_job_line_verbose() {
        let mut job = Job::new(
            crate::core::job::JobRequest::builder(7)
                .name("train")
                .user("alice")
                .threads(2)
                .memory_mb(1024)
                .gpus(2)
                .depends_on(&[3, 5])
                .build(),
        );
        assert_eq!(format_job_line(&job, false), "7:waiting:train");

        job.status = crate::core::job::JobStatus::Running;
        job.gpu_ids = Some(vec![0, 1]);
        let line = format_job_line(&job, true);
        assert!(line.starts_with("7:running:train:alice:2:1024:2:3+5:[0,1]:"));
    }
}
