use clap::Parser;
mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let jobqd = cli::JobQd::parse();
    tracing_subscriber::fmt()
        .with_max_level(jobqd.verbose.tracing_level_filter())
        .init();

    let config = jobq::config::load_config(jobqd.config.as_ref())?;
    jobq::server::run(config).await
}
