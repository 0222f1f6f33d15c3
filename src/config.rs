//! Process configuration loaded from environment variables (spec §6).

use crate::backend::BackendKind;

/// Everything the daemon/CLI entrypoint needs to stand up a backend and a
/// chat completion client.
pub struct Config {
    pub openrouter_api_key: String,
    pub backend_type: BackendKind,
    pub root_dir: String,
    pub model: String,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub auth_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),
    #[error("invalid BACKEND_TYPE: {0} (expected local or remote)")]
    InvalidBackendType(String),
    #[error("invalid REMOTE_PORT: {0}")]
    InvalidRemotePort(String),
}

const DEFAULT_ROOT_DIR: &str = ".";
const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_raw_values(
            std::env::var("OPENROUTER_API_KEY").ok().as_deref(),
            std::env::var("BACKEND_TYPE").ok().as_deref(),
            std::env::var("ROOT_DIR").ok().as_deref(),
            std::env::var("MODEL").ok().as_deref(),
            std::env::var("REMOTE_HOST").ok().as_deref(),
            std::env::var("REMOTE_PORT").ok().as_deref(),
            std::env::var("AUTH_TOKEN").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env
    /// vars). Used directly in tests to avoid mutating process-global
    /// environment.
    pub fn from_raw_values(
        openrouter_api_key: Option<&str>,
        backend_type: Option<&str>,
        root_dir: Option<&str>,
        model: Option<&str>,
        remote_host: Option<&str>,
        remote_port: Option<&str>,
        auth_token: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let openrouter_api_key = openrouter_api_key
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or(ConfigError::MissingRequired("OPENROUTER_API_KEY"))?;

        let backend_type = match backend_type.filter(|s| !s.is_empty()) {
            None => BackendKind::LocalFilesystem,
            Some("local") => BackendKind::LocalFilesystem,
            Some("remote") => BackendKind::RemoteFilesystem,
            Some(other) => return Err(ConfigError::InvalidBackendType(other.to_string())),
        };

        let root_dir = root_dir
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| DEFAULT_ROOT_DIR.to_string());

        let model = model
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let remote_host = remote_host.filter(|s| !s.is_empty()).map(String::from);

        let remote_port = remote_port
            .filter(|s| !s.is_empty())
            .map(|v| v.parse::<u16>().map_err(|_| ConfigError::InvalidRemotePort(v.to_string())))
            .transpose()?;

        let auth_token = auth_token.filter(|s| !s.is_empty()).map(String::from);

        Ok(Config {
            openrouter_api_key,
            backend_type,
            root_dir,
            model,
            remote_host,
            remote_port,
            auth_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_an_error() {
        let err = Config::from_raw_values(None, None, None, None, None, None, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired("OPENROUTER_API_KEY")));
    }

    #[test]
    fn defaults_to_local_backend_and_default_root() {
        let config = Config::from_raw_values(Some("key"), None, None, None, None, None, None).unwrap();
        assert_eq!(config.backend_type, BackendKind::LocalFilesystem);
        assert_eq!(config.root_dir, DEFAULT_ROOT_DIR);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn recognises_remote_backend_type() {
        let config =
            Config::from_raw_values(Some("key"), Some("remote"), None, None, None, None, None).unwrap();
        assert_eq!(config.backend_type, BackendKind::RemoteFilesystem);
    }

    #[test]
    fn rejects_unknown_backend_type() {
        let err =
            Config::from_raw_values(Some("key"), Some("bogus"), None, None, None, None, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBackendType(s) if s == "bogus"));
    }

    #[test]
    fn parses_remote_host_and_port() {
        let config = Config::from_raw_values(
            Some("key"),
            Some("remote"),
            Some("/workspace"),
            Some("gpt-4"),
            Some("example.com"),
            Some("2222"),
            Some("tok"),
        )
        .unwrap();
        assert_eq!(config.root_dir, "/workspace");
        assert_eq!(config.model, "gpt-4");
        assert_eq!(config.remote_host.as_deref(), Some("example.com"));
        assert_eq!(config.remote_port, Some(2222));
        assert_eq!(config.auth_token.as_deref(), Some("tok"));
    }

    #[test]
    fn rejects_invalid_remote_port() {
        let err = Config::from_raw_values(
            Some("key"),
            None,
            None,
            None,
            None,
            Some("not-a-port"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRemotePort(_)));
    }
}
