//! Client-side configuration: defaults, an optional per-user config file,
//! and environment overrides, in that order.

use std::path::{Path, PathBuf};

use chorus_timing::MicroSeconds;
use directories::{BaseDirs, ProjectDirs};
use tracing::warn;

/// Default UNIX rendezvous socket of a local server.
pub const DEFAULT_UNIX_SOCKET: &str = "/tmp/chorus/native";
/// Default TCP port.
pub const DEFAULT_PORT: u16 = 4713;

pub const ENV_SERVER: &str = "CHORUS_SERVER";
pub const ENV_SINK: &str = "CHORUS_SINK";
pub const ENV_SOURCE: &str = "CHORUS_SOURCE";
pub const ENV_DAEMON_BINARY: &str = "CHORUS_DAEMON_BINARY";
pub const ENV_COOKIE: &str = "CHORUS_COOKIE";
pub const ENV_AUTOSPAWN: &str = "CHORUS_AUTOSPAWN";
/// Set on an autospawned daemon; carries the fd number of the socketpair
/// end it should serve.
pub const ENV_PASSED_FD: &str = "CHORUS_PASSED_FD";
pub const ENV_AUTOSPAWNED: &str = "CHORUS_AUTOSPAWNED";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub default_server: Option<String>,
    pub default_sink: Option<String>,
    pub default_source: Option<String>,
    pub daemon_binary: PathBuf,
    pub extra_arguments: Vec<String>,
    pub autospawn: bool,
    pub cookie_file: Option<PathBuf>,
    /// Deadline for ordinary request replies.
    pub reply_timeout: MicroSeconds,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_server: None,
            default_sink: None,
            default_source: None,
            daemon_binary: PathBuf::from("chorusd"),
            extra_arguments: Vec::new(),
            autospawn: true,
            cookie_file: None,
            reply_timeout: MicroSeconds::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Defaults, overlaid with the per-user config file (if present),
    /// overlaid with the environment.
    pub fn load() -> Self {
        let mut conf = Self::default();
        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                conf.apply_file(&path);
            }
        }
        conf.apply_env();
        conf
    }

    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "chorus").map(|d| d.config_dir().join("client.conf"))
    }

    /// `key = value` lines; `#` starts a comment. Unknown keys are
    /// reported and skipped.
    pub fn apply_file(&mut self, path: &Path) {
        let Ok(text) = std::fs::read_to_string(path) else {
            warn!(path = %path.display(), "could not read client config");
            return;
        };

        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(path = %path.display(), lineno = lineno + 1, "ignoring malformed line");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "default-server" => self.default_server = Some(value.to_owned()),
                "default-sink" => self.default_sink = Some(value.to_owned()),
                "default-source" => self.default_source = Some(value.to_owned()),
                "daemon-binary" => self.daemon_binary = PathBuf::from(value),
                "extra-arguments" => {
                    self.extra_arguments =
                        value.split_whitespace().map(str::to_owned).collect();
                }
                "autospawn" => self.autospawn = parse_bool(value).unwrap_or(self.autospawn),
                "cookie-file" => self.cookie_file = Some(PathBuf::from(value)),
                "reply-timeout-msec" => match value.parse::<u64>() {
                    Ok(ms) if ms > 0 => self.reply_timeout = MicroSeconds::from_millis(ms),
                    _ => warn!(path = %path.display(), lineno = lineno + 1, "invalid timeout"),
                },
                _ => {
                    warn!(path = %path.display(), lineno = lineno + 1, key, "unknown config key");
                }
            }
        }
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(ENV_SERVER) {
            self.default_server = Some(v);
        }
        if let Ok(v) = std::env::var(ENV_SINK) {
            self.default_sink = Some(v);
        }
        if let Ok(v) = std::env::var(ENV_SOURCE) {
            self.default_source = Some(v);
        }
        if let Ok(v) = std::env::var(ENV_DAEMON_BINARY) {
            self.daemon_binary = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(ENV_COOKIE) {
            self.cookie_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var(ENV_AUTOSPAWN) {
            if let Some(b) = parse_bool(&v) {
                self.autospawn = b;
            }
        }
    }

    /// Where the authentication cookie lives.
    pub fn cookie_path(&self) -> Option<PathBuf> {
        if let Some(p) = &self.cookie_file {
            return Some(p.clone());
        }
        if let Some(dirs) = ProjectDirs::from("", "", "chorus") {
            return Some(dirs.config_dir().join("cookie"));
        }
        BaseDirs::new().map(|d| d.home_dir().join(".chorus-cookie"))
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn file_overlay_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.conf");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# a comment").unwrap();
        writeln!(f, "default-server = /run/chorus/native  # trailing comment").unwrap();
        writeln!(f, "autospawn = no").unwrap();
        writeln!(f, "extra-arguments = --log-level debug").unwrap();
        writeln!(f, "bogus line without equals").unwrap();
        writeln!(f, "unknown-key = 1").unwrap();

        let mut conf = ClientConfig::default();
        conf.apply_file(&path);
        assert_eq!(conf.default_server.as_deref(), Some("/run/chorus/native"));
        assert!(!conf.autospawn);
        assert_eq!(conf.extra_arguments, ["--log-level", "debug"]);
    }

    #[test]
    fn cookie_file_override_wins() {
        let mut conf = ClientConfig::default();
        conf.cookie_file = Some(PathBuf::from("/tmp/some-cookie"));
        assert_eq!(conf.cookie_path().unwrap(), PathBuf::from("/tmp/some-cookie"));
    }
}
