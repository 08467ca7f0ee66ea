use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Application server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// CouchDB configuration
    #[serde(default)]
    pub couch: CouchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for all servers (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the www server (default: 6001)
    #[serde(default = "default_www_port")]
    pub www_port: u16,

    /// Port for the admin server (default: 6002)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Run the subdomain router in front of the www and admin servers
    #[serde(default)]
    pub run_router: bool,

    /// Port for the subdomain router (default: 8080)
    #[serde(default = "default_router_port")]
    pub router_port: u16,

    /// Static file root for the www server
    #[serde(default = "default_www_root")]
    pub www_root: String,

    /// Static file root for the admin server
    #[serde(default = "default_admin_root")]
    pub admin_root: String,

    /// Installed plugin names, served under /_api/_plugins
    #[serde(default)]
    pub plugins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            www_port: default_www_port(),
            admin_port: default_admin_port(),
            run_router: false,
            router_port: default_router_port(),
            www_root: default_www_root(),
            admin_root: default_admin_root(),
            plugins: Vec::new(),
        }
    }
}

/// CouchDB settings.
///
/// With `run = false` the database is remote: no process is spawned, but it
/// is still polled and version-checked through `base_url`.
#[derive(Debug, Deserialize, Clone)]
pub struct CouchConfig {
    /// Spawn and supervise a local CouchDB process (default: true)
    #[serde(default = "default_true")]
    pub run: bool,

    /// Port CouchDB listens on (default: 6003)
    #[serde(default = "default_couch_port")]
    pub port: u16,

    /// Host CouchDB listens on (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Directory holding the database files, derived ini and logs
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,

    /// Path to the couchdb executable
    pub executable: Option<String>,

    /// Path to CouchDB's default.ini
    pub default_ini: Option<String>,

    /// Readiness probe URL (default: http://{host}:{port}/)
    pub base_url: Option<String>,

    /// Friendly URL reported once CouchDB is up (e.g. http://couch.app.dev)
    pub local_url: Option<String>,

    /// Demote progress logging to debug
    #[serde(default)]
    pub quiet: bool,

    /// Minimum supported CouchDB version (default: 1.2.0)
    #[serde(default = "default_minimum_version")]
    pub minimum_version: String,

    /// Give up waiting for CouchDB after this long (default: 20000ms)
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,

    /// Delay between readiness probes (default: 200ms)
    #[serde(default = "default_ready_interval")]
    pub ready_interval_ms: u64,

    /// Abort proxied requests after this long (default: 60s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum concurrent upstream requests (default: 1024)
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,

    /// Grace period between SIGTERM and SIGKILL (default: 10s)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for CouchConfig {
    fn default() -> Self {
        Self {
            run: true,
            port: default_couch_port(),
            host: default_host(),
            storage_prefix: default_storage_prefix(),
            executable: None,
            default_ini: None,
            base_url: None,
            local_url: None,
            quiet: false,
            minimum_version: default_minimum_version(),
            ready_timeout_ms: default_ready_timeout(),
            ready_interval_ms: default_ready_interval(),
            request_timeout_secs: default_request_timeout(),
            max_sockets: default_max_sockets(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl CouchConfig {
    /// Create a config for a locally supervised CouchDB
    pub fn local(executable: &str, default_ini: &str, storage_prefix: &str, port: u16) -> Self {
        Self {
            executable: Some(executable.to_string()),
            default_ini: Some(default_ini.to_string()),
            storage_prefix: storage_prefix.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Create a config for a remote CouchDB that is not supervised
    pub fn remote(base_url: &str) -> Self {
        Self {
            run: false,
            base_url: Some(base_url.to_string()),
            ..Self::default()
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}/", self.host, self.port))
    }

    /// URL to report once CouchDB has started
    pub fn display_url(&self) -> String {
        self.local_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    pub fn storage_path(&self) -> PathBuf {
        PathBuf::from(&self.storage_prefix)
    }

    /// Candidate log files for diagnosing a CouchDB that never came up
    pub fn log_paths(&self) -> Vec<PathBuf> {
        let prefix = self.storage_path();
        vec![
            prefix.join("couch.stderr"),
            prefix.join("couch.stdout"),
            prefix.join("couch.log"),
        ]
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate the CouchDB configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.run {
            if self.port == 0 {
                errors.push("couch: 'port' must be greater than 0".to_string());
            }
            if self.storage_prefix.is_empty() {
                errors.push("couch: 'storage_prefix' must not be empty".to_string());
            }
        } else if self.base_url.is_none() {
            errors.push("couch: remote CouchDB (run = false) requires 'base_url'".to_string());
        }

        if let Some(url) = &self.base_url {
            match url.parse::<hyper::Uri>() {
                Ok(uri) if uri.scheme_str() != Some("http") => errors.push(format!(
                    "couch: 'base_url' must use http:// (got '{}'); TLS upstreams are not supported",
                    url
                )),
                Ok(uri) if uri.host().is_none() => {
                    errors.push(format!("couch: 'base_url' has no host ('{}')", url))
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("couch: invalid 'base_url' '{}': {}", url, e)),
            }
        }

        if self.ready_interval_ms == 0 {
            errors.push("couch: 'ready_interval_ms' must be greater than 0".to_string());
        }

        if self.max_sockets == 0 {
            errors.push("couch: 'max_sockets' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_www_port() -> u16 {
    6001
}

fn default_admin_port() -> u16 {
    6002
}

fn default_couch_port() -> u16 {
    6003
}

fn default_router_port() -> u16 {
    8080
}

fn default_www_root() -> String {
    "./www".to_string()
}

fn default_admin_root() -> String {
    "./admin".to_string()
}

fn default_storage_prefix() -> String {
    "./data".to_string()
}

fn default_minimum_version() -> String {
    crate::version::MINIMUM_VERSION.to_string()
}

fn default_ready_timeout() -> u64 {
    20_000 // 20 seconds
}

fn default_ready_interval() -> u64 {
    200 // 200ms
}

fn default_request_timeout() -> u64 {
    60 // 60 seconds
}

fn default_max_sockets() -> usize {
    1024
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(couch_errors) = self.couch.validate() {
            errors.extend(couch_errors);
        }

        if self.server.www_port == self.server.admin_port {
            errors.push(format!(
                "server: www_port and admin_port must differ (both {})",
                self.server.www_port
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
host = "0.0.0.0"
www_port = 7001
admin_port = 7002
run_router = true
plugins = ["users", "email"]

[couch]
port = 7003
storage_prefix = "/var/lib/myapp"
executable = "/usr/bin/couchdb"
default_ini = "/etc/couchdb/default.ini"
local_url = "http://couch.myapp.dev"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.www_port, 7001);
        assert!(config.server.run_router);
        assert_eq!(config.server.plugins, vec!["users", "email"]);
        assert!(config.couch.run);
        assert_eq!(config.couch.port, 7003);
        assert_eq!(config.couch.executable.as_deref(), Some("/usr/bin/couchdb"));
        assert_eq!(config.couch.display_url(), "http://couch.myapp.dev");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.www_port, 6001);
        assert_eq!(config.server.admin_port, 6002);
        assert_eq!(config.server.router_port, 8080);
        assert!(!config.server.run_router);
        assert!(config.couch.run);
        assert_eq!(config.couch.port, 6003);
        assert!(config.couch.executable.is_none());
    }

    #[test]
    fn test_default_couch_config() {
        let couch = CouchConfig::default();
        assert_eq!(couch.minimum_version, "1.2.0");
        assert_eq!(couch.ready_timeout(), Duration::from_millis(20_000));
        assert_eq!(couch.ready_interval(), Duration::from_millis(200));
        assert_eq!(couch.request_timeout(), Duration::from_secs(60));
        assert_eq!(couch.max_sockets, 1024);
        assert_eq!(couch.shutdown_grace_period(), Duration::from_secs(10));
        assert_eq!(couch.base_url(), "http://127.0.0.1:6003/");
        assert_eq!(couch.display_url(), "http://127.0.0.1:6003");
    }

    #[test]
    fn test_log_paths_under_storage_prefix() {
        let couch = CouchConfig::local("couchdb", "default.ini", "/srv/app", 5984);
        let paths = couch.log_paths();

        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0], PathBuf::from("/srv/app/couch.stderr"));
        assert_eq!(paths[1], PathBuf::from("/srv/app/couch.stdout"));
        assert_eq!(paths[2], PathBuf::from("/srv/app/couch.log"));
    }

    #[test]
    fn test_remote_requires_base_url() {
        let toml = r#"
[couch]
run = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("requires 'base_url'"));

        let remote = CouchConfig::remote("http://db.example.com:5984/");
        assert!(remote.validate().is_ok());
        assert_eq!(remote.base_url(), "http://db.example.com:5984/");
    }

    #[test]
    fn test_base_url_must_be_plain_http() {
        let errors = CouchConfig::remote("https://db.example.com/")
            .validate()
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("must use http://"));

        let errors = CouchConfig::remote("db.example.com").validate().unwrap_err();
        assert!(errors[0].contains("must use http://"));

        let errors = CouchConfig::remote("http://").validate().unwrap_err();
        assert!(!errors.is_empty());

        let toml = r#"
[couch]
run = false
base_url = "https://db.example.com/"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("TLS upstreams are not supported"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
www_port = 7000
admin_port = 7000

[couch]
port = 0
max_sockets = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'port' must be greater than 0"));
        assert!(err.contains("'max_sockets' must be greater than 0"));
        assert!(err.contains("www_port and admin_port must differ"));
    }
}
