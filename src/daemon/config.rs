//! Daemon configuration
//!
//! Defaults live under `~/.warmsh` (or `$WARMSH_HOME`). They can be
//! overridden by `~/.warmsh/config` and then by environment variables, all
//! using the same keys:
//! - WARMSH_SOCKET (socket path)
//! - WARMSH_LOG_FILE (daemon log file)
//! - WARMSH_SHELL (program each worker runs)
//! - WARMSH_POLL_INTERVAL_MS (accept loop wake-up interval)
//! - WARMSH_REQUEST_TIMEOUT_MS (how long a client may take to send its request)

use anyhow::{anyhow, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the state directory (default `~/.warmsh`)
pub const HOME_ENV: &str = "WARMSH_HOME";

const SOCKET_KEY: &str = "WARMSH_SOCKET";
const LOG_FILE_KEY: &str = "WARMSH_LOG_FILE";
const SHELL_KEY: &str = "WARMSH_SHELL";
const POLL_INTERVAL_KEY: &str = "WARMSH_POLL_INTERVAL_MS";
const REQUEST_TIMEOUT_KEY: &str = "WARMSH_REQUEST_TIMEOUT_MS";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Directory holding the socket, pid file and log by default
    pub state_dir: PathBuf,
    /// Listening socket path
    pub socket_path: PathBuf,
    /// Pid file written while the daemon runs
    pub pid_path: PathBuf,
    /// Daemon log file
    pub log_path: PathBuf,
    /// Program run by each worker
    pub shell: PathBuf,
    /// Upper bound on how long the accept loop sleeps between checks
    pub poll_interval: Duration,
    /// Read timeout while receiving a session request
    pub request_timeout: Duration,
}

impl DaemonConfig {
    /// Defaults rooted at `state_dir`
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let shell = env::var_os("SHELL")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/bin/sh"));

        Self {
            socket_path: state_dir.join("daemon.sock"),
            pid_path: state_dir.join("daemon.pid"),
            log_path: state_dir.join("warmshd.log"),
            shell,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state_dir,
        }
    }

    /// Defaults, then the config file, then the environment
    pub fn load() -> Result<Self> {
        let mut config = Self::with_state_dir(Self::default_state_dir()?);
        if let Ok(content) = fs::read_to_string(config.config_file()) {
            config.apply(&content);
        }
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    /// `$WARMSH_HOME`, or `~/.warmsh`
    pub fn default_state_dir() -> Result<PathBuf> {
        if let Some(dir) = env::var_os(HOME_ENV).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
        Ok(home.join(".warmsh"))
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join("config")
    }

    /// Create the state directory with owner-only permissions
    pub fn ensure_state_dir(&self) -> Result<()> {
        ensure_private_dir(&self.state_dir)?;
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                ensure_private_dir(parent)?;
            }
        }
        Ok(())
    }

    /// Apply `KEY=value` lines from a config file
    pub fn apply(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = parse_assignment(line) {
                self.set(&key, &unquote(&value));
            }
        }
    }

    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in [
            SOCKET_KEY,
            LOG_FILE_KEY,
            SHELL_KEY,
            POLL_INTERVAL_KEY,
            REQUEST_TIMEOUT_KEY,
        ] {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                self.set(key, &value);
            }
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        match key {
            SOCKET_KEY => {
                self.socket_path = self.resolve(value);
                self.pid_path = self.socket_path.with_extension("pid");
            }
            LOG_FILE_KEY => self.log_path = self.resolve(value),
            SHELL_KEY => self.shell = PathBuf::from(value),
            POLL_INTERVAL_KEY => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.poll_interval = Duration::from_millis(ms.max(1));
                }
            }
            REQUEST_TIMEOUT_KEY => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.request_timeout = Duration::from_millis(ms.max(1));
                }
            }
            _ => {}
        }
    }

    fn resolve(&self, value: &str) -> PathBuf {
        let path = Path::new(value);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.state_dir.join(path)
        }
    }
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;

        // Set directory permissions to 0700 (owner only)
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(dir)?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}
