use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub backends: BackendConfig,
    pub routing: RoutingConfig,
    pub consultation: ConsultationConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

/// External collaborators. Absent URLs select the in-process implementations.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub retrieval_url: Option<String>,
    pub issuance_url: Option<String>,
    pub issuance_api_key: Option<SecretString>,
    pub catalog_path: Option<PathBuf>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoutingConfig {
    pub classifier_confidence_threshold: f64,
    pub max_hops_per_turn: u8,
    pub max_detail_rounds: u8,
    pub max_quotation_handoffs: u8,
    pub stagnation_min_messages: usize,
    pub stagnation_window: usize,
    pub stagnation_similarity: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConsultationConfig {
    pub answer_threshold: f64,
    pub answer_floor: f64,
    pub history_limit: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub retrieval_url: Option<String>,
    pub issuance_url: Option<String>,
    pub catalog_path: Option<PathBuf>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://autopoliza.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Disabled,
                api_key: None,
                base_url: None,
                model: "llama3.1".to_string(),
                timeout_secs: 20,
            },
            backends: BackendConfig {
                retrieval_url: None,
                issuance_url: None,
                issuance_api_key: None,
                catalog_path: None,
                timeout_secs: 10,
            },
            routing: RoutingConfig::default(),
            consultation: ConsultationConfig::default(),
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            classifier_confidence_threshold: 0.6,
            max_hops_per_turn: 3,
            max_detail_rounds: 2,
            max_quotation_handoffs: 3,
            stagnation_min_messages: 12,
            stagnation_window: 8,
            stagnation_similarity: 0.6,
        }
    }
}

impl Default for ConsultationConfig {
    fn default() -> Self {
        Self { answer_threshold: 0.7, answer_floor: 0.4, history_limit: 10 }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            "disabled" | "none" => Ok(Self::Disabled),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama|disabled)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("autopoliza.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(backends) = patch.backends {
            if let Some(retrieval_url) = backends.retrieval_url {
                self.backends.retrieval_url = Some(retrieval_url);
            }
            if let Some(issuance_url) = backends.issuance_url {
                self.backends.issuance_url = Some(issuance_url);
            }
            if let Some(issuance_api_key) = backends.issuance_api_key {
                self.backends.issuance_api_key = Some(secret_value(issuance_api_key));
            }
            if let Some(catalog_path) = backends.catalog_path {
                self.backends.catalog_path = Some(catalog_path);
            }
            if let Some(timeout_secs) = backends.timeout_secs {
                self.backends.timeout_secs = timeout_secs;
            }
        }

        if let Some(routing) = patch.routing {
            if let Some(value) = routing.classifier_confidence_threshold {
                self.routing.classifier_confidence_threshold = value;
            }
            if let Some(value) = routing.max_hops_per_turn {
                self.routing.max_hops_per_turn = value;
            }
            if let Some(value) = routing.max_detail_rounds {
                self.routing.max_detail_rounds = value;
            }
            if let Some(value) = routing.max_quotation_handoffs {
                self.routing.max_quotation_handoffs = value;
            }
            if let Some(value) = routing.stagnation_min_messages {
                self.routing.stagnation_min_messages = value;
            }
            if let Some(value) = routing.stagnation_window {
                self.routing.stagnation_window = value;
            }
            if let Some(value) = routing.stagnation_similarity {
                self.routing.stagnation_similarity = value;
            }
        }

        if let Some(consultation) = patch.consultation {
            if let Some(value) = consultation.answer_threshold {
                self.consultation.answer_threshold = value;
            }
            if let Some(value) = consultation.answer_floor {
                self.consultation.answer_floor = value;
            }
            if let Some(value) = consultation.history_limit {
                self.consultation.history_limit = value;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("AUTOPOLIZA_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("AUTOPOLIZA_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_number("AUTOPOLIZA_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("AUTOPOLIZA_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_number("AUTOPOLIZA_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("AUTOPOLIZA_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("AUTOPOLIZA_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("AUTOPOLIZA_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("AUTOPOLIZA_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("AUTOPOLIZA_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_number("AUTOPOLIZA_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("AUTOPOLIZA_RETRIEVAL_URL") {
            self.backends.retrieval_url = Some(value);
        }
        if let Some(value) = read_env("AUTOPOLIZA_ISSUANCE_URL") {
            self.backends.issuance_url = Some(value);
        }
        if let Some(value) = read_env("AUTOPOLIZA_ISSUANCE_API_KEY") {
            self.backends.issuance_api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("AUTOPOLIZA_CATALOG_PATH") {
            self.backends.catalog_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("AUTOPOLIZA_BACKEND_TIMEOUT_SECS") {
            self.backends.timeout_secs = parse_number("AUTOPOLIZA_BACKEND_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("AUTOPOLIZA_CLASSIFIER_CONFIDENCE_THRESHOLD") {
            self.routing.classifier_confidence_threshold =
                parse_number("AUTOPOLIZA_CLASSIFIER_CONFIDENCE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("AUTOPOLIZA_MAX_HOPS_PER_TURN") {
            self.routing.max_hops_per_turn = parse_number("AUTOPOLIZA_MAX_HOPS_PER_TURN", &value)?;
        }

        if let Some(value) = read_env("AUTOPOLIZA_CONSULTATION_ANSWER_THRESHOLD") {
            self.consultation.answer_threshold =
                parse_number("AUTOPOLIZA_CONSULTATION_ANSWER_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("AUTOPOLIZA_CONSULTATION_ANSWER_FLOOR") {
            self.consultation.answer_floor =
                parse_number("AUTOPOLIZA_CONSULTATION_ANSWER_FLOOR", &value)?;
        }

        if let Some(value) = read_env("AUTOPOLIZA_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("AUTOPOLIZA_SERVER_PORT") {
            self.server.port = parse_number("AUTOPOLIZA_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("AUTOPOLIZA_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_number("AUTOPOLIZA_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("AUTOPOLIZA_LOGGING_LEVEL").or_else(|| read_env("AUTOPOLIZA_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("AUTOPOLIZA_LOGGING_FORMAT").or_else(|| read_env("AUTOPOLIZA_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(retrieval_url) = overrides.retrieval_url {
            self.backends.retrieval_url = Some(retrieval_url);
        }
        if let Some(issuance_url) = overrides.issuance_url {
            self.backends.issuance_url = Some(issuance_url);
        }
        if let Some(catalog_path) = overrides.catalog_path {
            self.backends.catalog_path = Some(catalog_path);
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_backends(&self.backends)?;
        validate_routing(&self.routing)?;
        validate_consultation(&self.consultation)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("autopoliza.toml"), PathBuf::from("config/autopoliza.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
        LlmProvider::Disabled => {}
    }

    if let Some(base_url) = &llm.base_url {
        validate_http_url("llm.base_url", base_url)?;
    }

    Ok(())
}

fn validate_backends(backends: &BackendConfig) -> Result<(), ConfigError> {
    if backends.timeout_secs == 0 || backends.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "backends.timeout_secs must be in range 1..=120".to_string(),
        ));
    }
    if let Some(url) = &backends.retrieval_url {
        validate_http_url("backends.retrieval_url", url)?;
    }
    if let Some(url) = &backends.issuance_url {
        validate_http_url("backends.issuance_url", url)?;
    }
    if let Some(path) = &backends.catalog_path {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "backends.catalog_path must not be empty when set".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_routing(routing: &RoutingConfig) -> Result<(), ConfigError> {
    validate_unit_interval(
        "routing.classifier_confidence_threshold",
        routing.classifier_confidence_threshold,
    )?;
    validate_unit_interval("routing.stagnation_similarity", routing.stagnation_similarity)?;

    if routing.max_hops_per_turn == 0 {
        return Err(ConfigError::Validation(
            "routing.max_hops_per_turn must be greater than zero".to_string(),
        ));
    }
    if routing.max_detail_rounds == 0 {
        return Err(ConfigError::Validation(
            "routing.max_detail_rounds must be greater than zero".to_string(),
        ));
    }
    if routing.max_quotation_handoffs == 0 {
        return Err(ConfigError::Validation(
            "routing.max_quotation_handoffs must be greater than zero".to_string(),
        ));
    }
    if routing.stagnation_window < 2 {
        return Err(ConfigError::Validation(
            "routing.stagnation_window must be at least 2".to_string(),
        ));
    }

    Ok(())
}

fn validate_consultation(consultation: &ConsultationConfig) -> Result<(), ConfigError> {
    validate_unit_interval("consultation.answer_threshold", consultation.answer_threshold)?;
    validate_unit_interval("consultation.answer_floor", consultation.answer_floor)?;

    if consultation.answer_floor > consultation.answer_threshold {
        return Err(ConfigError::Validation(
            "consultation.answer_floor must not exceed consultation.answer_threshold".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_unit_interval(key: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{key} must be in range 0.0..=1.0")))
    }
}

fn validate_http_url(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{key} must start with http:// or https://")))
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    backends: Option<BackendPatch>,
    routing: Option<RoutingPatch>,
    consultation: Option<ConsultationPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendPatch {
    retrieval_url: Option<String>,
    issuance_url: Option<String>,
    issuance_api_key: Option<String>,
    catalog_path: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RoutingPatch {
    classifier_confidence_threshold: Option<f64>,
    max_hops_per_turn: Option<u8>,
    max_detail_rounds: Option<u8>,
    max_quotation_handoffs: Option<u8>,
    stagnation_min_messages: Option<usize>,
    stagnation_window: Option<usize>,
    stagnation_similarity: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConsultationPatch {
    answer_threshold: Option<f64>,
    answer_floor: Option<f64>,
    history_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_load_without_file_or_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.llm.provider == LlmProvider::Disabled, "llm should default to disabled")?;
        ensure(config.routing.max_hops_per_turn == 3, "hop cap should default to 3")?;
        ensure(config.routing.max_detail_rounds == 2, "detail rounds should default to 2")?;
        ensure(config.routing.max_quotation_handoffs == 3, "handoff cap should default to 3")?;
        ensure(
            config.consultation.answer_floor < config.consultation.answer_threshold,
            "floor should sit below threshold",
        )?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_ISSUANCE_KEY", "issuance-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("autopoliza.toml");
            fs::write(
                &path,
                r#"
[backends]
issuance_url = "http://localhost:5000"
issuance_api_key = "${TEST_ISSUANCE_KEY}"
timeout_secs = 5

[routing]
max_hops_per_turn = 2
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config
                    .backends
                    .issuance_api_key
                    .as_ref()
                    .map(|key| key.expose_secret() == "issuance-from-env")
                    .unwrap_or(false),
                "issuance key should be interpolated from environment",
            )?;
            ensure(config.backends.timeout_secs == 5, "backend timeout should come from file")?;
            ensure(config.routing.max_hops_per_turn == 2, "hop cap should come from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_ISSUANCE_KEY"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("autopoliza.toml");
        fs::write(&path, "[llm]\napi_key = \"${AUTOPOLIZA_TEST_UNSET_VAR}\"\n")
            .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected interpolation failure".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::MissingEnvInterpolation { ref var } if var == "AUTOPOLIZA_TEST_UNSET_VAR"),
            "missing variable should be named",
        )
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("AUTOPOLIZA_LOG_LEVEL", "warn");
        env::set_var("AUTOPOLIZA_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["AUTOPOLIZA_LOG_LEVEL", "AUTOPOLIZA_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("AUTOPOLIZA_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("AUTOPOLIZA_RETRIEVAL_URL", "http://rag-from-env:8000");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("autopoliza.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[backends]
retrieval_url = "http://rag-from-file:8000"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.backends.retrieval_url.as_deref() == Some("http://rag-from-env:8000"),
                "env retrieval url should win over file and defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["AUTOPOLIZA_DATABASE_URL", "AUTOPOLIZA_RETRIEVAL_URL"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("AUTOPOLIZA_CONSULTATION_ANSWER_FLOOR", "0.9");
        env::set_var("AUTOPOLIZA_CONSULTATION_ANSWER_THRESHOLD", "0.5");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("consultation.answer_floor")
            );
            ensure(has_message, "validation failure should mention consultation.answer_floor")
        })();

        clear_vars(&[
            "AUTOPOLIZA_CONSULTATION_ANSWER_FLOOR",
            "AUTOPOLIZA_CONSULTATION_ANSWER_THRESHOLD",
        ]);
        result
    }

    #[test]
    fn hosted_llm_requires_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                llm_provider: Some(LlmProvider::OpenAi),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected missing api key failure".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::Validation(ref message) if message.contains("llm.api_key")),
            "validation failure should mention llm.api_key",
        )
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("AUTOPOLIZA_ISSUANCE_API_KEY", "issuance-secret-value");
        env::set_var("AUTOPOLIZA_LLM_API_KEY", "llm-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("issuance-secret-value"),
                "debug output should not contain issuance key",
            )?;
            ensure(!debug.contains("llm-secret-value"), "debug output should not contain llm key")?;
            Ok(())
        })();

        clear_vars(&["AUTOPOLIZA_ISSUANCE_API_KEY", "AUTOPOLIZA_LLM_API_KEY"]);
        result
    }
}
