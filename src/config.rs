use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Kill running jobs that exceed their declared hours. When off,
    /// timeout notices are ignored and jobs run until they report
    /// completion or are deleted.
    #[serde(default)]
    pub abort_on_time_limit: bool,
    /// Per-delivery timeout for client notifications, in seconds.
    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResourcesConfig {
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// GPU device ids the scheduler manages.
    #[serde(default)]
    pub gpus: Vec<u32>,
    /// Device ids permanently excluded from allocation (still counted in
    /// the total).
    #[serde(default)]
    pub reserved_gpus: Vec<u32>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6041
}

fn default_notify_timeout_secs() -> u64 {
    5
}

fn default_threads() -> u32 {
    8
}

fn default_memory_mb() -> u64 {
    16 * 1024
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            abort_on_time_limit: false,
            notify_timeout_secs: default_notify_timeout_secs(),
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            memory_mb: default_memory_mb(),
            gpus: Vec::new(),
            reserved_gpus: Vec::new(),
        }
    }
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("jobq"))
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            eprintln!("Warning: Config file {config_path:?} not found.");
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("jobq.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    // Double underscore between key segments so multi-word fields stay
    // addressable: JOBQ_RESOURCES__MEMORY_MB, JOBQ_DAEMON__ABORT_ON_TIME_LIMIT.
    settings
        .add_source(
            config::Environment::with_prefix("JOBQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("resources.gpus")
                .with_list_parse_key("resources.reserved_gpus"),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // load_config reads the process environment; serialize those tests so
    // one test's JOBQ_* variables cannot bleed into another.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.port, 6041);
        assert!(!config.daemon.abort_on_time_limit);
        assert_eq!(config.resources.threads, 8);
        assert!(config.resources.gpus.is_empty());
    }

    #[test]
    fn test_load_config_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        temp_file
            .write_all(
                b"[daemon]\nport = 7000\nabort_on_time_limit = true\n\
                  [resources]\nthreads = 32\nmemory_mb = 65536\ngpus = [0, 1, 2, 3]\nreserved_gpus = [3]\n",
            )
            .unwrap();
        let config = load_config(Some(&temp_file.path().to_path_buf())).unwrap();
        assert_eq!(config.daemon.port, 7000);
        assert!(config.daemon.abort_on_time_limit);
        assert_eq!(config.resources.threads, 32);
        assert_eq!(config.resources.gpus, vec![0, 1, 2, 3]);
        assert_eq!(config.resources.reserved_gpus, vec![3]);
    }

    #[test]
    fn test_load_config_missing_file_falls_back_to_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = load_config(Some(&PathBuf::from("/tmp/jobq-does-not-exist.toml"))).unwrap();
        assert_eq!(config.daemon.port, 6041);
    }

    #[test]
    fn test_env_overrides_singleword_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("JOBQ_DAEMON__PORT", "7777");
        let config = load_config(None);
        std::env::remove_var("JOBQ_DAEMON__PORT");
        assert_eq!(config.unwrap().daemon.port, 7777);
    }

    #[test]
    fn test_env_overrides_multiword_keys() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("JOBQ_RESOURCES__MEMORY_MB", "1234");
        std::env::set_var("JOBQ_DAEMON__ABORT_ON_TIME_LIMIT", "true");
        std::env::set_var("JOBQ_DAEMON__NOTIFY_TIMEOUT_SECS", "9");
        std::env::set_var("JOBQ_RESOURCES__RESERVED_GPUS", "0,2");
        let config = load_config(None);
        std::env::remove_var("JOBQ_RESOURCES__MEMORY_MB");
        std::env::remove_var("JOBQ_DAEMON__ABORT_ON_TIME_LIMIT");
        std::env::remove_var("JOBQ_DAEMON__NOTIFY_TIMEOUT_SECS");
        std::env::remove_var("JOBQ_RESOURCES__RESERVED_GPUS");

        let config = config.unwrap();
        assert_eq!(config.resources.memory_mb, 1234);
        assert!(config.daemon.abort_on_time_limit);
        assert_eq!(config.daemon.notify_timeout_secs, 9);
        assert_eq!(config.resources.reserved_gpus, vec![0, 2]);
    }
}
