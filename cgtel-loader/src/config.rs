use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/cgtel/cgtel.toml";
const ENV_CONFIG_PATH: &str = "CGTEL_CONFIG";
const ENV_BPF_PATH: &str = "CGTEL_BPF_PATH";

#[derive(Debug, Deserialize, Clone)]
#[allow(dead_code)]
pub struct Config {
    #[serde(default = "default_bpf_object_path")]
    pub bpf_object_path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,
    /// Syscall numbers to track, written into `tracked_syscalls` before the
    /// probes attach. Empty by default: zero tracked syscalls means zero
    /// overhead on the syscall probe's early-return path.
    #[serde(default)]
    pub tracked_syscalls: Vec<u32>,
    #[serde(default = "default_enable_optional_probes")]
    pub enable_optional_probes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bpf_object_path: default_bpf_object_path(),
            poll_interval_ms: default_poll_interval_ms(),
            drain_batch_size: default_drain_batch_size(),
            tracked_syscalls: Vec::new(),
            enable_optional_probes: default_enable_optional_probes(),
        }
    }
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `CGTEL_CONFIG` environment variable; the object path it names can be
    /// further overridden with `CGTEL_BPF_PATH`. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config: Self = match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        };
        if let Ok(path) = std::env::var(ENV_BPF_PATH) {
            config.bpf_object_path = path;
        }
        config
    }

    pub fn bpf_object_path(&self) -> PathBuf {
        PathBuf::from(&self.bpf_object_path)
    }
}

fn default_bpf_object_path() -> String {
    "/usr/local/share/cgtel/cgtel-ebpf-probes".to_string()
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_drain_batch_size() -> usize {
    256
}
fn default_enable_optional_probes() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Config::load() reads process-global env vars; serialize the tests that
    // touch them so they don't race each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_file_missing() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/cgtel.toml");
        let config = Config::load();
        assert_eq!(config.poll_interval_ms, default_poll_interval_ms());
        assert_eq!(config.drain_batch_size, default_drain_batch_size());
        assert!(config.tracked_syscalls.is_empty());
        std::env::remove_var(ENV_CONFIG_PATH);
    }

    #[test]
    fn overrides_from_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "poll_interval_ms = 500\ndrain_batch_size = 64\ntracked_syscalls = [0, 1]"
        )
        .unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        let config = Config::load();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.drain_batch_size, 64);
        assert_eq!(config.tracked_syscalls, vec![0, 1]);
        std::env::remove_var(ENV_CONFIG_PATH);
    }

    #[test]
    fn bpf_path_env_override_wins_over_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "bpf_object_path = \"/from/file\"").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        std::env::set_var(ENV_BPF_PATH, "/from/env");
        let config = Config::load();
        assert_eq!(config.bpf_object_path, "/from/env");
        std::env::remove_var(ENV_CONFIG_PATH);
        std::env::remove_var(ENV_BPF_PATH);
    }
}
