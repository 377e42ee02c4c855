use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "jobqd", author, version, about = "Job queue daemon")]
pub struct JobQd {
    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}
