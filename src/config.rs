//! Hangar configuration — YAML deserialization and validation.
//!
//! The top level maps provider ids to launch specs, plus optional sections
//! for concurrency limits, rate limiting, and continuation-cache tuning.

use crate::error::HangarError;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::guard::PROVIDER_ID_PATTERN;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of env values to their spawn-time values.
///
/// `${VAR}` references are looked up in the process environment (unknown
/// variables resolve to the empty string); literal values pass through.
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(),
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Top-level Hangar configuration, parsed from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HangarConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderSpec>,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub continuation: ContinuationConfig,
}

/// Launch mode for a provider process.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Subprocess,
    Docker,
    Container,
    Podman,
    Remote,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Subprocess => "subprocess",
            ProviderMode::Docker => "docker",
            ProviderMode::Container => "container",
            ProviderMode::Podman => "podman",
            ProviderMode::Remote => "remote",
        }
    }
}

impl Default for ProviderMode {
    fn default() -> Self {
        ProviderMode::Subprocess
    }
}

/// Image build instructions for container modes.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildSpec {
    pub dockerfile: String,
    #[serde(default = "default_build_context")]
    pub context: String,
    pub tag: Option<String>,
}

/// Resource limits applied to container modes.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSpec {
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        ResourceSpec {
            memory: default_memory(),
            cpu: default_cpu(),
        }
    }
}

/// Configuration for a single managed provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSpec {
    #[serde(default)]
    pub mode: ProviderMode,
    // Subprocess field
    #[serde(default)]
    pub command: Vec<String>,
    // Container fields
    pub image: Option<String>,
    pub build: Option<BuildSpec>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    /// UID:GID, a username, or the literal "current" (resolved at load time).
    pub user: Option<String>,
    // Remote field (configuration-only; remote providers are never launched)
    pub endpoint: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_idle_ttl_s")]
    pub idle_ttl_s: u64,
    #[serde(default = "default_health_check_interval_s")]
    pub health_check_interval_s: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Free-form description surfaced to callers via list/details.
    pub description: Option<String>,
}

impl Default for ProviderSpec {
    fn default() -> Self {
        ProviderSpec {
            mode: ProviderMode::Subprocess,
            command: Vec::new(),
            image: None,
            build: None,
            volumes: Vec::new(),
            resources: ResourceSpec::default(),
            network: default_network(),
            read_only: default_read_only(),
            user: None,
            endpoint: None,
            env: HashMap::new(),
            idle_ttl_s: default_idle_ttl_s(),
            health_check_interval_s: default_health_check_interval_s(),
            max_consecutive_failures: default_max_consecutive_failures(),
            description: None,
        }
    }
}

/// Two-level concurrency limits (0 = unlimited).
#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_global_limit")]
    pub global_limit: usize,
    #[serde(default = "default_provider_limit")]
    pub default_provider_limit: usize,
    #[serde(default)]
    pub provider_limits: HashMap<String, usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        ConcurrencyConfig {
            global_limit: default_global_limit(),
            default_provider_limit: default_provider_limit(),
            provider_limits: HashMap::new(),
        }
    }
}

/// Token-bucket rate limiting applied at the tool surface.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

/// Continuation cache tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ContinuationConfig {
    #[serde(default = "default_continuation_ttl_s")]
    pub ttl_s: u64,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        ContinuationConfig {
            ttl_s: default_continuation_ttl_s(),
        }
    }
}

fn default_build_context() -> String {
    ".".to_string()
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpu() -> String {
    "1.0".to_string()
}

fn default_network() -> String {
    "none".to_string()
}

fn default_read_only() -> bool {
    true
}

fn default_idle_ttl_s() -> u64 {
    300
}

fn default_health_check_interval_s() -> u64 {
    60
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_global_limit() -> usize {
    50
}

fn default_provider_limit() -> usize {
    10
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst_size() -> u32 {
    20
}

fn default_continuation_ttl_s() -> u64 {
    300
}

impl HangarConfig {
    /// Load configuration from a YAML file and resolve load-time fields.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HangarError::InvalidConfig(
                path.display().to_string(),
                format!("failed to read config file: {e}"),
            )
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string and resolve load-time fields.
    pub fn from_yaml(content: &str) -> crate::Result<Self> {
        let mut config: HangarConfig = serde_yaml::from_str(content).map_err(|e| {
            HangarError::InvalidConfig("config".to_string(), format!("invalid YAML: {e}"))
        })?;
        config.resolve_users();
        config.validate()?;
        Ok(config)
    }

    /// Replace `user: "current"` with the invoker's uid:gid at load time.
    fn resolve_users(&mut self) {
        for spec in self.providers.values_mut() {
            if spec.user.as_deref() == Some("current") {
                spec.user = Some(current_uid_gid());
            }
        }
    }

    /// Validate the config, failing fast on misconfigurations before any
    /// providers are constructed.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for id in self.providers.keys() {
            if !seen.insert(id.as_str()) {
                return Err(HangarError::DuplicateProvider(id.clone()));
            }
        }

        for (id, spec) in &self.providers {
            if !PROVIDER_ID_PATTERN.is_match(id) {
                return Err(HangarError::InvalidConfig(
                    id.clone(),
                    "provider id must match [A-Za-z0-9_.-]{1,64}".to_string(),
                ));
            }

            match spec.mode {
                ProviderMode::Subprocess => {
                    if spec.command.is_empty() {
                        return Err(HangarError::InvalidConfig(
                            id.clone(),
                            "subprocess mode requires 'command' field".to_string(),
                        ));
                    }
                }
                ProviderMode::Docker => {
                    if spec.image.is_none() {
                        return Err(HangarError::InvalidConfig(
                            id.clone(),
                            "docker mode requires 'image' field".to_string(),
                        ));
                    }
                }
                ProviderMode::Container | ProviderMode::Podman => {
                    if spec.image.is_none() && spec.build.is_none() {
                        return Err(HangarError::InvalidConfig(
                            id.clone(),
                            "container mode requires 'image' or 'build.dockerfile'".to_string(),
                        ));
                    }
                }
                ProviderMode::Remote => {
                    if spec.endpoint.is_none() {
                        return Err(HangarError::InvalidConfig(
                            id.clone(),
                            "remote mode requires 'endpoint' field".to_string(),
                        ));
                    }
                }
            }

            for volume in &spec.volumes {
                if !volume.contains(':') {
                    return Err(HangarError::InvalidConfig(
                        id.clone(),
                        format!("volume '{volume}' must be of the form host:container"),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
fn current_uid_gid() -> String {
    unsafe extern "C" {
        fn getuid() -> u32;
        fn getgid() -> u32;
    }
    // SAFETY: getuid/getgid have no failure modes and touch no shared state.
    unsafe { format!("{}:{}", getuid(), getgid()) }
}

#[cfg(not(unix))]
fn current_uid_gid() -> String {
    "0:0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_yaml(yaml: &str) -> HangarConfig {
        HangarConfig::from_yaml(yaml).expect("valid YAML config")
    }

    #[test]
    fn test_parse_env_ref() {
        assert_eq!(parse_env_ref("${FOO}"), Some("FOO"));
        assert_eq!(parse_env_ref("${API_TOKEN}"), Some("API_TOKEN"));
        assert_eq!(parse_env_ref("$FOO"), None);
        assert_eq!(parse_env_ref("literal"), None);
        assert_eq!(parse_env_ref("${"), None);
    }

    #[test]
    fn test_resolve_env_vars_passthrough_and_reference() {
        // SAFETY: test-only, no concurrent threads depend on this env var.
        unsafe { std::env::set_var("HANGAR_TEST_VAR", "resolved_value") };
        let mut env = HashMap::new();
        env.insert("KEY".to_string(), "${HANGAR_TEST_VAR}".to_string());
        env.insert("LIT".to_string(), "plain".to_string());
        let resolved = resolve_env_vars(&env);
        assert_eq!(resolved.get("KEY").unwrap(), "resolved_value");
        assert_eq!(resolved.get("LIT").unwrap(), "plain");
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("HANGAR_TEST_VAR") };
    }

    #[test]
    fn test_valid_subprocess_config() {
        let config = parse_yaml(
            r#"
providers:
  math:
    mode: subprocess
    command: ["python", "-m", "math_server"]
    idle_ttl_s: 180
"#,
        );
        let spec = config.providers.get("math").unwrap();
        assert_eq!(spec.mode, ProviderMode::Subprocess);
        assert_eq!(spec.idle_ttl_s, 180);
        assert_eq!(spec.health_check_interval_s, 60);
        assert_eq!(spec.max_consecutive_failures, 3);
    }

    #[test]
    fn test_subprocess_missing_command() {
        let result = HangarConfig::from_yaml(
            r#"
providers:
  broken:
    mode: subprocess
"#,
        );
        assert!(
            matches!(result, Err(HangarError::InvalidConfig(id, msg)) if id == "broken" && msg.contains("command"))
        );
    }

    #[test]
    fn test_docker_missing_image() {
        let result = HangarConfig::from_yaml(
            r#"
providers:
  d:
    mode: docker
"#,
        );
        assert!(
            matches!(result, Err(HangarError::InvalidConfig(id, msg)) if id == "d" && msg.contains("image"))
        );
    }

    #[test]
    fn test_container_accepts_build_without_image() {
        let config = parse_yaml(
            r#"
providers:
  tooling:
    mode: container
    build:
      dockerfile: Dockerfile
      context: ./tooling
"#,
        );
        let spec = config.providers.get("tooling").unwrap();
        assert!(spec.image.is_none());
        assert_eq!(spec.build.as_ref().unwrap().context, "./tooling");
    }

    #[test]
    fn test_remote_requires_endpoint() {
        let result = HangarConfig::from_yaml(
            r#"
providers:
  api:
    mode: remote
"#,
        );
        assert!(
            matches!(result, Err(HangarError::InvalidConfig(id, msg)) if id == "api" && msg.contains("endpoint"))
        );
    }

    #[test]
    fn test_invalid_provider_id_rejected() {
        let result = HangarConfig::from_yaml(
            r#"
providers:
  "bad id with spaces":
    mode: subprocess
    command: ["echo"]
"#,
        );
        assert!(matches!(result, Err(HangarError::InvalidConfig(_, _))));
    }

    #[test]
    fn test_invalid_volume_rejected() {
        let result = HangarConfig::from_yaml(
            r#"
providers:
  fs:
    mode: container
    image: fs:latest
    volumes: ["no-colon-here"]
"#,
        );
        assert!(
            matches!(result, Err(HangarError::InvalidConfig(id, msg)) if id == "fs" && msg.contains("host:container"))
        );
    }

    #[test]
    fn test_user_current_resolved_at_load() {
        let config = parse_yaml(
            r#"
providers:
  fs:
    mode: container
    image: fs:latest
    user: current
"#,
        );
        let user = config.providers.get("fs").unwrap().user.as_ref().unwrap();
        assert!(
            user.contains(':') && user != "current",
            "expected uid:gid, got {user}"
        );
    }

    #[test]
    fn test_container_defaults() {
        let config = parse_yaml(
            r#"
providers:
  c:
    mode: container
    image: c:latest
"#,
        );
        let spec = config.providers.get("c").unwrap();
        assert_eq!(spec.network, "none");
        assert!(spec.read_only);
        assert_eq!(spec.resources.memory, "512m");
        assert_eq!(spec.resources.cpu, "1.0");
    }

    #[test]
    fn test_concurrency_and_rate_limit_defaults() {
        let config = parse_yaml("providers: {}\n");
        assert_eq!(config.concurrency.global_limit, 50);
        assert_eq!(config.concurrency.default_provider_limit, 10);
        assert!((config.rate_limit.requests_per_second - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.rate_limit.burst_size, 20);
        assert_eq!(config.continuation.ttl_s, 300);
    }

    #[test]
    fn test_from_file_reads_and_validates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hangar.yaml");
        std::fs::write(
            &path,
            "providers:\n  math:\n    mode: subprocess\n    command: [\"echo\"]\n",
        )
        .expect("write config");

        let config = HangarConfig::from_file(&path).expect("loads");
        assert!(config.providers.contains_key("math"));

        let missing = HangarConfig::from_file(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(HangarError::InvalidConfig(_, _))));
    }

    #[test]
    fn test_concurrency_overrides_parsed() {
        let config = parse_yaml(
            r#"
providers: {}
concurrency:
  global_limit: 8
  default_provider_limit: 2
  provider_limits:
    slow-api: 1
"#,
        );
        assert_eq!(config.concurrency.global_limit, 8);
        assert_eq!(config.concurrency.provider_limits.get("slow-api"), Some(&1));
    }
}
