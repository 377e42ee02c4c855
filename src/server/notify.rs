//! Best-effort client notifications.
//!
//! The scheduler commits allocations before any of this runs; an
//! unreachable client is logged and forgotten, never surfaced back into
//! scheduling state.

use crate::core::scheduler::StartNotice;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Open a connection to `host:port`, send one line, close. Failures and
/// timeouts are logged at warn level and swallowed.
pub async fn notify(host: &str, port: u16, message: &str, timeout: Duration) {
    if let Err(e) = try_notify(host, port, message, timeout).await {
        tracing::warn!("Failed to notify {host}:{port} with '{message}': {e}");
    }
}

async fn try_notify(host: &str, port: u16, message: &str, timeout: Duration) -> anyhow::Result<()> {
    let deliver = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(format!("{message}\n").as_bytes()).await?;
        stream.shutdown().await?;
        Ok::<_, anyhow::Error>(())
    };
    tokio::time::timeout(timeout, deliver)
        .await
        .map_err(|_| anyhow::anyhow!("delivery timed out after {timeout:?}"))?
}

/// Deliver drained start notices concurrently so one slow client cannot
/// delay the others.
pub fn deliver_start_notices(notices: Vec<StartNotice>, timeout: Duration) {
    for notice in notices {
        tokio::spawn(async move {
            let payload = format!("run:{}", format_gpu_ids(&notice.gpu_ids));
            notify(&notice.host, notice.port, &payload, timeout).await;
        });
    }
}

pub fn format_gpu_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
