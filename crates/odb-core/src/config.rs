use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{DestinationId, GroupId, UserId},
    errors::Error,
    messaging::types::Destination,
    model::types::OllamaCliConfig,
    Result,
};

pub const DEFAULT_MODEL: &str = "qwen2.5:0.5b-instruct";

/// Typed configuration, fixed for the lifetime of a run.
#[derive(Clone, Debug)]
pub struct Config {
    // Identity
    pub bot_user_id: UserId,
    pub bot_mentions: Vec<String>,
    pub target_destination: Option<DestinationId>,

    // Rate limiting
    pub posts_per_window: usize,
    pub window: Duration,

    // Escalation
    pub violation_window: Duration,
    pub kick_after: usize,
    pub ban_after: usize,
    pub sweep_interval: Duration,

    // Log channel discovery
    pub log_channel_marker: String,

    // Inference
    pub ollama: OllamaCliConfig,
    pub ready_timeout: Duration,
    pub inference_timeout: Duration,
    pub message_chunk_size: usize,

    // URL fetch
    pub fetch_max_chars: usize,
    pub fetch_max_bytes: usize,
    pub fetch_max_redirects: usize,
    pub fetch_timeout: Duration,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,

    // Stdio transport
    pub stdio_destinations: Vec<(GroupId, Destination)>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        inject_extra_paths();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (process env in production, maps in tests).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let u64_of = |key: &str| get(key).and_then(|s| s.trim().parse::<u64>().ok());
        let usize_of = |key: &str| get(key).and_then(|s| s.trim().parse::<usize>().ok());

        // Required
        let bot_user_id = get("ODB_BOT_USER_ID")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(UserId)
            .ok_or_else(|| {
                Error::Config("ODB_BOT_USER_ID environment variable is required".to_string())
            })?;

        let bot_mentions = {
            let parsed = parse_csv(get("ODB_BOT_MENTIONS"));
            if parsed.is_empty() {
                vec![
                    format!("<@{}>", bot_user_id.0),
                    format!("<@!{}>", bot_user_id.0),
                ]
            } else {
                parsed
            }
        };
        let target_destination = u64_of("ODB_TARGET_DESTINATION_ID").map(DestinationId);

        // Rate limiting
        let posts_per_window = usize_of("ODB_POSTS_PER_WINDOW").unwrap_or(4);
        let window = Duration::from_secs(u64_of("ODB_WINDOW_SECONDS").unwrap_or(10));

        // Escalation
        let violation_window =
            Duration::from_secs(u64_of("ODB_VIOLATION_WINDOW_SECONDS").unwrap_or(10 * 60));
        let kick_after = usize_of("ODB_KICK_AFTER").unwrap_or(3);
        let ban_after = usize_of("ODB_BAN_AFTER").unwrap_or(6);
        let sweep_interval =
            Duration::from_secs(u64_of("ODB_SWEEP_INTERVAL_SECONDS").unwrap_or(300).max(1));

        let log_channel_marker = get("ODB_LOG_CHANNEL_MARKER")
            .and_then(non_empty)
            .unwrap_or_else(|| "bot".to_string())
            .to_lowercase();

        // Inference
        let ollama_path = get("OLLAMA_PATH")
            .and_then(non_empty)
            .map(PathBuf::from)
            .or_else(|| which_in_path("ollama"))
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/ollama"));
        let ollama = OllamaCliConfig {
            ollama_path,
            model: get("OLLAMA_MODEL")
                .and_then(non_empty)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            host: get("OLLAMA_PROBE_HOST")
                .and_then(non_empty)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: get("OLLAMA_PORT")
                .and_then(|s| s.trim().parse::<u16>().ok())
                .unwrap_or(11434),
            probe_timeout: Duration::from_millis(u64_of("OLLAMA_PROBE_TIMEOUT_MS").unwrap_or(2000)),
        };
        let ready_timeout =
            Duration::from_secs(u64_of("OLLAMA_READY_TIMEOUT_SECONDS").unwrap_or(20));
        let inference_timeout =
            Duration::from_secs(u64_of("INFERENCE_TIMEOUT_SECONDS").unwrap_or(1800));
        let message_chunk_size = usize_of("MESSAGE_CHUNK_SIZE").unwrap_or(1900);

        // URL fetch
        let fetch_max_chars = usize_of("FETCH_MAX_CHARS").unwrap_or(4000);
        let fetch_max_bytes = usize_of("FETCH_MAX_BYTES").unwrap_or(2_000_000);
        let fetch_max_redirects = usize_of("FETCH_MAX_REDIRECTS").unwrap_or(3);
        let fetch_timeout = Duration::from_secs(u64_of("FETCH_TIMEOUT_SECONDS").unwrap_or(15));

        // Audit logging
        let audit_log_path = PathBuf::from(
            get("AUDIT_LOG_PATH").unwrap_or_else(|| "/tmp/odb-audit.log".to_string()),
        );
        let audit_log_json = get("AUDIT_LOG_JSON").map(|s| parse_bool(&s)).unwrap_or(false);

        let stdio_destinations = parse_destinations(get("STDIO_DESTINATIONS"))?;

        let cfg = Self {
            bot_user_id,
            bot_mentions,
            target_destination,
            posts_per_window,
            window,
            violation_window,
            kick_after,
            ban_after,
            sweep_interval,
            log_channel_marker,
            ollama,
            ready_timeout,
            inference_timeout,
            message_chunk_size,
            fetch_max_chars,
            fetch_max_bytes,
            fetch_max_redirects,
            fetch_timeout,
            audit_log_path,
            audit_log_json,
            stdio_destinations,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.posts_per_window == 0 {
            return Err(Error::Config(
                "ODB_POSTS_PER_WINDOW must be at least 1".to_string(),
            ));
        }
        if self.kick_after == 0 {
            return Err(Error::Config("ODB_KICK_AFTER must be at least 1".to_string()));
        }
        if self.ban_after <= self.kick_after {
            return Err(Error::Config(format!(
                "ODB_BAN_AFTER ({}) must be greater than ODB_KICK_AFTER ({})",
                self.ban_after, self.kick_after
            )));
        }
        if self.message_chunk_size == 0 {
            return Err(Error::Config(
                "MESSAGE_CHUNK_SIZE must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn inject_extra_paths() {
    let Some(home) = home_dir() else {
        return;
    };

    // Usual install locations of the ollama binary when launched from a service manager.
    let extras = [
        home.join(".local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
        PathBuf::from("/usr/local/bin"),
    ];

    let current = env::var_os("PATH").unwrap_or_else(|| OsString::from(""));
    let mut parts: Vec<OsString> = env::split_paths(&current)
        .map(|p| p.into_os_string())
        .collect();

    for extra in extras.into_iter().rev() {
        let extra_os = extra.into_os_string();
        if !parts.iter().any(|p| p == &extra_os) {
            parts.push(extra_os);
        }
    }

    let joined = env::join_paths(parts.into_iter().map(PathBuf::from).collect::<Vec<_>>())
        .unwrap_or(current);
    env::set_var("PATH", joined);
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `group:id:name,group:id:name`
fn parse_destinations(v: Option<String>) -> Result<Vec<(GroupId, Destination)>> {
    let mut out = Vec::new();
    for item in parse_csv(v) {
        let mut parts = item.splitn(3, ':');
        let (Some(group), Some(id), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Config(format!(
                "STDIO_DESTINATIONS entry `{item}` is not group:id:name"
            )));
        };
        let (Ok(group), Ok(id)) = (group.trim().parse::<u64>(), id.trim().parse::<u64>()) else {
            return Err(Error::Config(format!(
                "STDIO_DESTINATIONS entry `{item}` has a non-numeric id"
            )));
        };
        out.push((
            GroupId(group),
            Destination {
                id: DestinationId(id),
                name: name.trim().to_string(),
            },
        ));
    }
    Ok(out)
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}
