use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use autopoliza_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Entry {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

fn entry(key: &'static str, env_key: &'static str, value: impl Into<String>) -> Entry {
    Entry { key, env_key, value: value.into() }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in entries(&config) {
        let source = field_source(
            entry.key,
            entry.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", entry.key, entry.value));
    }

    lines.join("\n")
}

fn entries(config: &AppConfig) -> Vec<Entry> {
    vec![
        entry("database.url", "AUTOPOLIZA_DATABASE_URL", &config.database.url),
        entry(
            "database.max_connections",
            "AUTOPOLIZA_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        entry(
            "database.timeout_secs",
            "AUTOPOLIZA_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        entry("llm.provider", "AUTOPOLIZA_LLM_PROVIDER", format!("{:?}", config.llm.provider)),
        entry("llm.model", "AUTOPOLIZA_LLM_MODEL", &config.llm.model),
        entry(
            "llm.base_url",
            "AUTOPOLIZA_LLM_BASE_URL",
            config.llm.base_url.as_deref().unwrap_or("<unset>"),
        ),
        entry("llm.api_key", "AUTOPOLIZA_LLM_API_KEY", redacted(config.llm.api_key.is_some())),
        entry(
            "backends.retrieval_url",
            "AUTOPOLIZA_RETRIEVAL_URL",
            config.backends.retrieval_url.as_deref().unwrap_or("<in-process faq>"),
        ),
        entry(
            "backends.issuance_url",
            "AUTOPOLIZA_ISSUANCE_URL",
            config.backends.issuance_url.as_deref().unwrap_or("<local issuance>"),
        ),
        entry(
            "backends.issuance_api_key",
            "AUTOPOLIZA_ISSUANCE_API_KEY",
            redacted(config.backends.issuance_api_key.is_some()),
        ),
        entry(
            "backends.catalog_path",
            "AUTOPOLIZA_CATALOG_PATH",
            config
                .backends
                .catalog_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<bundled>".to_string()),
        ),
        entry(
            "backends.timeout_secs",
            "AUTOPOLIZA_BACKEND_TIMEOUT_SECS",
            config.backends.timeout_secs.to_string(),
        ),
        entry(
            "routing.classifier_confidence_threshold",
            "AUTOPOLIZA_CLASSIFIER_CONFIDENCE_THRESHOLD",
            config.routing.classifier_confidence_threshold.to_string(),
        ),
        entry(
            "routing.max_hops_per_turn",
            "AUTOPOLIZA_MAX_HOPS_PER_TURN",
            config.routing.max_hops_per_turn.to_string(),
        ),
        entry(
            "consultation.answer_threshold",
            "AUTOPOLIZA_CONSULTATION_ANSWER_THRESHOLD",
            config.consultation.answer_threshold.to_string(),
        ),
        entry(
            "consultation.answer_floor",
            "AUTOPOLIZA_CONSULTATION_ANSWER_FLOOR",
            config.consultation.answer_floor.to_string(),
        ),
        entry("server.bind_address", "AUTOPOLIZA_SERVER_BIND_ADDRESS", &config.server.bind_address),
        entry("server.port", "AUTOPOLIZA_SERVER_PORT", config.server.port.to_string()),
        entry("logging.level", "AUTOPOLIZA_LOGGING_LEVEL", &config.logging.level),
        entry("logging.format", "AUTOPOLIZA_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ]
}

fn redacted(present: bool) -> &'static str {
    if present {
        "<redacted>"
    } else {
        "<unset>"
    }
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("autopoliza.toml"), PathBuf::from("config/autopoliza.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::contains_path;

    #[test]
    fn nested_keys_are_found_in_config_documents() {
        let doc: Value = "[backends]\nretrieval_url = \"http://rag:8000\"\n".parse().expect("toml");

        assert!(contains_path(&doc, "backends.retrieval_url"));
        assert!(!contains_path(&doc, "backends.issuance_url"));
        assert!(!contains_path(&doc, "llm.model"));
    }
}
