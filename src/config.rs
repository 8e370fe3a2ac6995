//! Server configuration.
//!
//! Configuration is read from one or more TOML files (later files
//! override earlier ones), then patched with `--<section>-<key>`
//! command line overrides, and is immutable afterwards. Every option
//! maps to one field below; defaults follow the documentation.

use std::collections::BTreeMap;
use std::path::Path;

use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub encoding: EncodingConfig,
    pub auth: AuthConfig,
    pub rights: RightsConfig,
    pub storage: StorageConfig,
    pub reporting: ReportingConfig,
    pub logging: LoggingConfig,
    /// Extra response headers, sent verbatim with every response.
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen addresses, `host:port`.
    pub hosts: Vec<String>,
    /// Cap on parallel connections.
    pub max_connections: usize,
    /// Reject request bodies larger than this (bytes).
    pub max_content_length: usize,
    /// Socket timeout in seconds. Also bounds TLS handshakes.
    pub timeout: f64,
    pub ssl: bool,
    pub certificate: String,
    pub key: String,
    /// PEM bundle of client CAs; enables client certificate checks.
    pub certificate_authority: String,
    /// Minimum TLS version: "TLSv1.2" (default) or "TLSv1.3".
    pub protocol: String,
    /// Restrict cipher suites by name substring, comma separated.
    pub ciphersuite: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hosts: vec!["127.0.0.1:5232".to_string()],
            max_connections: 8,
            max_content_length: 100_000_000,
            timeout: 30.0,
            ssl: false,
            certificate: "/etc/ssl/carillon.cert.pem".to_string(),
            key: "/etc/ssl/carillon.key.pem".to_string(),
            certificate_authority: String::new(),
            protocol: "TLSv1.2".to_string(),
            ciphersuite: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncodingConfig {
    /// Charset of request bodies and XML responses.
    pub request: String,
    /// Charset of stored files.
    pub stock: String,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        EncodingConfig {
            request: "utf-8".to_string(),
            stock: "utf-8".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub r#type: String,
    pub htpasswd_filename: String,
    /// plain, sha1, ssha, md5, bcrypt or autodetect.
    pub htpasswd_encryption: String,
    /// Base delay in seconds after a failed login from a source.
    pub delay: f64,
    pub realm: String,
    pub lc_username: bool,
    pub uc_username: bool,
    pub strip_domain: bool,
    pub urldecode_username: bool,
    pub cache_logins: bool,
    pub cache_successful_logins_expiry: u64,
    pub cache_failed_logins_expiry: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            r#type: "none".to_string(),
            htpasswd_filename: "/etc/carillon/users".to_string(),
            htpasswd_encryption: "autodetect".to_string(),
            delay: 1.0,
            realm: "carillon - Password Required".to_string(),
            lc_username: false,
            uc_username: false,
            strip_domain: false,
            urldecode_username: false,
            cache_logins: false,
            cache_successful_logins_expiry: 15,
            cache_failed_logins_expiry: 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RightsConfig {
    pub r#type: String,
    pub file: String,
    pub permit_delete_collection: bool,
    pub permit_overwrite_collection: bool,
}

impl Default for RightsConfig {
    fn default() -> Self {
        RightsConfig {
            r#type: "owner_only".to_string(),
            file: "/etc/carillon/rights".to_string(),
            permit_delete_collection: true,
            permit_overwrite_collection: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub r#type: String,
    pub filesystem_folder: String,
    pub filesystem_fsync: bool,
    /// Separate root for cache files; empty keeps them beside the data.
    pub filesystem_cache_folder: String,
    pub use_cache_subfolder_for_item: bool,
    pub use_cache_subfolder_for_history: bool,
    pub use_cache_subfolder_for_synctoken: bool,
    /// Key item caches by `(mtime_ns, size)` instead of SHA-256.
    pub use_mtime_and_size_for_item_cache: bool,
    /// Octal umask applied at startup, e.g. "0077"; empty inherits.
    pub folder_umask: String,
    /// Sync tokens older than this many seconds may be evicted.
    pub max_sync_token_age: u64,
    /// Command run (via the shell) after every successful write.
    pub hook: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            r#type: "multifilesystem".to_string(),
            filesystem_folder: "/var/lib/carillon/collections".to_string(),
            filesystem_fsync: true,
            filesystem_cache_folder: String::new(),
            use_cache_subfolder_for_item: false,
            use_cache_subfolder_for_history: false,
            use_cache_subfolder_for_synctoken: false,
            use_mtime_and_size_for_item_cache: false,
            folder_umask: String::new(),
            max_sync_token_age: 2_592_000,
            hook: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportingConfig {
    /// Cap on recurrence expansion per report.
    pub max_occurrences: usize,
    /// Cap on aggregated free-busy periods.
    pub max_freebusy_occurrences: usize,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        ReportingConfig {
            max_occurrences: 10000,
            max_freebusy_occurrences: 10000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// debug, info, warning, error or critical.
    pub level: String,
    pub mask_passwords: bool,
    pub request_header_on_debug: bool,
    pub request_content_on_debug: bool,
    pub response_content_on_debug: bool,
    pub storage_cache_actions_on_debug: bool,
    pub backtrace_on_debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "warning".to_string(),
            mask_passwords: true,
            request_header_on_debug: false,
            request_content_on_debug: false,
            response_content_on_debug: false,
            storage_cache_actions_on_debug: false,
            backtrace_on_debug: false,
        }
    }
}

impl Config {
    /// Load configuration from `paths` (separated by `:` or `;`; a `?`
    /// prefix marks a file as optional) and apply command line
    /// overrides of the form `(section, key, value)`.
    pub fn load(paths: &str, overrides: &[(String, String, String)]) -> Result<Config, ConfigError> {
        let mut table = toml::Table::new();
        for raw in paths.split([':', ';']).filter(|p| !p.is_empty()) {
            let (optional, path) = match raw.strip_prefix('?') {
                Some(p) => (true, p),
                None => (false, raw),
            };
            if optional && !Path::new(path).exists() {
                continue;
            }
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_string(),
                source,
            })?;
            let overlay: toml::Table =
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_string(),
                    source,
                })?;
            merge_tables(&mut table, overlay);
        }

        for (section, key, value) in overrides {
            let entry = table
                .entry(section.clone())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            let section_table = entry.as_table_mut().ok_or_else(|| {
                ConfigError::Invalid(format!("section {section} is not a table"))
            })?;
            section_table.insert(key.clone(), parse_override(section, key, value));
        }

        let config: Config = Config::deserialize(toml::Value::Table(table)).map_err(|e| {
            ConfigError::Invalid(e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.timeout <= 0.0 {
            return Err(ConfigError::Invalid("server.timeout must be positive".into()));
        }
        if self.server.hosts.is_empty() {
            return Err(ConfigError::Invalid("server.hosts is empty".into()));
        }
        if !self.storage.folder_umask.is_empty()
            && u32::from_str_radix(&self.storage.folder_umask, 8).is_err()
        {
            return Err(ConfigError::Invalid(format!(
                "storage.folder_umask {:?} is not octal",
                self.storage.folder_umask
            )));
        }
        match self.auth.r#type.as_str() {
            "none" | "denyall" | "htpasswd" | "remote_user" | "http_x_remote_user" => {}
            other => {
                return Err(ConfigError::Invalid(format!("unknown auth type {other:?}")));
            }
        }
        Ok(())
    }

    pub fn log_level(&self) -> LevelFilter {
        match self.logging.level.as_str() {
            "debug" => LevelFilter::Debug,
            "info" => LevelFilter::Info,
            "warning" => LevelFilter::Warn,
            "error" | "critical" => LevelFilter::Error,
            _ => LevelFilter::Warn,
        }
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(b)), toml::Value::Table(o)) => merge_tables(b, o),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

// command line values arrive as strings; give them the type the field
// wants.
fn parse_override(section: &str, key: &str, value: &str) -> toml::Value {
    const FLOAT_KEYS: &[(&str, &str)] = &[("server", "timeout"), ("auth", "delay")];
    const STRING_INT_KEYS: &[(&str, &str)] = &[("storage", "folder_umask")];

    if section == "server" && key == "hosts" {
        return toml::Value::Array(
            value
                .split(',')
                .map(|h| toml::Value::String(h.trim().to_string()))
                .collect(),
        );
    }
    if section == "headers" || STRING_INT_KEYS.contains(&(section, key)) {
        return toml::Value::String(value.to_string());
    }
    if FLOAT_KEYS.contains(&(section, key)) {
        if let Ok(f) = value.parse::<f64>() {
            return toml::Value::Float(f);
        }
    }
    match value {
        "true" => return toml::Value::Boolean(true),
        "false" => return toml::Value::Boolean(false),
        _ => {}
    }
    if let Ok(i) = value.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    toml::Value::String(value.to_string())
}
