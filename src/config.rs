use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub oauth: OAuthProviderConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
    /// Public base URL of the deployment, used for absolute login URLs and
    /// the CSRF origin check when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Stable identifier for this worker process within the pool.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    /// When set, internal endpoints (`/health`) require this value in the
    /// `x-internal-token` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_api_token: Option<String>,
}

/// Process-wide authentication configuration. Loaded once, immutable for the
/// process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// HMAC key for session and widget tokens.
    #[serde(default)]
    pub token_secret: String,
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    #[serde(default = "default_cookie_name")]
    pub session_cookie_name: String,
    #[serde(default)]
    pub require_auth_for_widgets: bool,
    /// Emails granted the `admin` role at login.
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default = "default_roles")]
    pub default_roles: Vec<String>,
    /// Seconds a native flow waits for the provider callback.
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u64,
    /// Seconds before expiry at which the background refresh fires.
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer: u64,
    #[serde(default = "default_true")]
    pub pkce: bool,
    /// Max age in seconds for pending login state entries.
    #[serde(default = "default_pending_max_age")]
    pub pending_state_max_age: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OAuthProviderConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub authorize_url: String,
    #[serde(default)]
    pub token_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userinfo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_url: Option<String>,
    #[serde(default)]
    pub scopes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Backend selector: `memory` (single worker) or `redis` (shared).
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Namespace prefix so multiple deployments can share one Redis.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_login_attempts")]
    pub login_attempts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

// Defaults
fn default_http_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_worker_id() -> String { format!("worker-{}", std::process::id()) }
fn default_session_ttl() -> u64 { 86_400 }
fn default_cookie_name() -> String { "atrium_session".to_string() }
fn default_roles() -> Vec<String> { vec!["viewer".to_string()] }
fn default_auth_timeout() -> u64 { 300 }
fn default_refresh_buffer() -> u64 { 300 }
fn default_true() -> bool { true }
fn default_pending_max_age() -> u64 { 600 }
fn default_backend() -> String { "memory".to_string() }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_key_prefix() -> String { "atrium".to_string() }
fn default_login_attempts() -> u32 { 10 }
fn default_window_secs() -> u64 { 60 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            base_url: None,
            log_level: default_log_level(),
            worker_id: default_worker_id(),
            internal_api_token: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_secret: String::new(),
            session_ttl: default_session_ttl(),
            session_cookie_name: default_cookie_name(),
            require_auth_for_widgets: false,
            admin_users: vec![],
            default_roles: default_roles(),
            auth_timeout: default_auth_timeout(),
            refresh_buffer: default_refresh_buffer(),
            pkce: true,
            pending_state_max_age: default_pending_max_age(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            login_attempts: default_login_attempts(),
            window_secs: default_window_secs(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config_path = env::var("ATRIUM_CONFIG").unwrap_or_else(|_| {
            let home_config = format!(
                "{}/.config/atrium/config.toml",
                env::var("HOME").unwrap_or_default()
            );
            let locations = vec![
                "./config.toml",
                "./atrium.toml",
                "/etc/atrium/config.toml",
                home_config.as_str(),
            ];

            for path in locations {
                if Path::new(path).exists() {
                    return path.to_string();
                }
            }

            "./config.toml".to_string()
        });

        // Token secrets live in this file; refuse world-writable configs
        #[cfg(unix)]
        Self::validate_file_permissions(&config_path)?;

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;

        let config_content = Self::substitute_env_vars(&config_content);

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;

        config.validate()?;

        Ok(config)
    }

    /// Substitute ${VAR_NAME} with environment variable values
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();

        while let Some(start) = result.find("${") {
            if let Some(end) = result[start..].find('}') {
                let var_name = &result[start + 2..start + end];
                let value = env::var(var_name).unwrap_or_default();
                result.replace_range(start..start + end + 1, &value);
            } else {
                break;
            }
        }

        result
    }

    fn validate(&self) -> Result<()> {
        if self.auth.enabled {
            if self.auth.token_secret.len() < 32 {
                anyhow::bail!(
                    "auth.token_secret must be at least 32 bytes when auth is enabled"
                );
            }
            if self.oauth.client_id.is_empty() {
                anyhow::bail!("oauth.client_id is required when auth is enabled");
            }
            if self.oauth.authorize_url.is_empty() || self.oauth.token_url.is_empty() {
                anyhow::bail!(
                    "oauth.authorize_url and oauth.token_url are required when auth is enabled"
                );
            }
        }

        match self.state.backend.as_str() {
            "memory" | "redis" => {}
            other => anyhow::bail!(
                "state.backend must be 'memory' or 'redis', got '{}'",
                other
            ),
        }

        Ok(())
    }

    /// Validate config file permissions (Unix only)
    #[cfg(unix)]
    fn validate_file_permissions(path: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path_obj = Path::new(path);

        // Skip validation if file doesn't exist yet (first run)
        if !path_obj.exists() {
            tracing::debug!("Config file does not exist yet: {}", path);
            return Ok(());
        }

        let metadata = fs::metadata(path_obj)
            .with_context(|| format!("Failed to read metadata for config file: {}", path))?;

        let mode = metadata.permissions().mode();

        let group_readable = (mode & 0o040) != 0;
        let others_readable = (mode & 0o004) != 0;
        let group_writable = (mode & 0o020) != 0;
        let others_writable = (mode & 0o002) != 0;

        if group_readable || others_readable {
            tracing::warn!(
                "Config file {} has insecure permissions: {:o}",
                path,
                mode & 0o777
            );
            tracing::warn!(
                "   Recommended: chmod 600 {} (it contains the session token secret)",
                path
            );
        }

        if group_writable || others_writable {
            anyhow::bail!(
                "Config file {} is writable by group or others (mode: {:o}). \
                This is a security risk. Run: chmod 600 {}",
                path,
                mode & 0o777,
                path
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("ATRIUM_TEST_VAR", "test_value");

        let input = "token_secret = \"${ATRIUM_TEST_VAR}\"";
        let output = Config::substitute_env_vars(input);

        assert_eq!(output, "token_secret = \"test_value\"");

        env::remove_var("ATRIUM_TEST_VAR");
    }

    #[test]
    fn test_defaults_parse_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.auth.session_cookie_name, "atrium_session");
        assert_eq!(config.auth.session_ttl, 86_400);
        assert_eq!(config.auth.pending_state_max_age, 600);
        assert_eq!(config.state.backend, "memory");
        assert_eq!(config.rate_limiting.login_attempts, 10);
        assert_eq!(config.rate_limiting.window_secs, 60);
        assert!(!config.auth.enabled);
        assert!(config.auth.pkce);
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            enabled = true
            token_secret = "short"

            [oauth]
            client_id = "client"
            authorize_url = "https://idp.example/authorize"
            token_url = "https://idp.example/token"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let config: Config = toml::from_str("[state]\nbackend = \"etcd\"").unwrap();
        assert!(config.validate().is_err());
    }
}
