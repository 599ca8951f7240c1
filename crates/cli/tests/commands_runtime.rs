use std::env;
use std::sync::{Mutex, OnceLock};

use autopoliza_cli::commands::{chat, config, doctor, migrate, session};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("AUTOPOLIZA_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("AUTOPOLIZA_DATABASE_URL", "postgres://localhost/autopoliza")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn config_attributes_sources_and_redacts_secrets() {
    with_env(
        &[
            ("AUTOPOLIZA_DATABASE_URL", "sqlite::memory:"),
            ("AUTOPOLIZA_LLM_API_KEY", "sk-very-secret"),
        ],
        || {
            let output = config::run();

            assert!(output.contains("- database.url = sqlite::memory: (source: env (AUTOPOLIZA_DATABASE_URL))"));
            assert!(output.contains("- llm.api_key = <redacted> (source: env (AUTOPOLIZA_LLM_API_KEY))"));
            assert!(output.contains("- backends.issuance_api_key = <unset> (source: default)"));
            assert!(output.contains("- backends.catalog_path = <bundled> (source: default)"));
            assert!(!output.contains("sk-very-secret"));
        },
    );
}

#[test]
fn doctor_passes_with_in_memory_database() {
    with_env(&[("AUTOPOLIZA_DATABASE_URL", "sqlite::memory:")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "expected passing doctor report: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "pass");
        let names: Vec<&str> = payload["checks"]
            .as_array()
            .expect("checks array")
            .iter()
            .filter_map(|check| check["name"].as_str())
            .collect();
        assert_eq!(names, vec!["config_validation", "collaborators", "database", "handlers"]);
    });
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_env(&[("AUTOPOLIZA_DATABASE_URL", "mysql://localhost/autopoliza")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "fail");
        assert_eq!(payload["checks"][0]["status"], "fail");
        assert_eq!(payload["checks"][1]["status"], "skipped");
    });
}

#[test]
fn chat_runs_client_turns_until_exit_word() {
    with_env(
        &[
            ("AUTOPOLIZA_DATABASE_URL", "sqlite::memory:"),
            ("AUTOPOLIZA_DATABASE_MAX_CONNECTIONS", "1"),
        ],
        || {
            let input = "hola\n\nquiero cotizar\n/salir\nesto no se procesa\n";
            let mut transcript = Vec::new();

            let result = chat::run(Some("S-cli-chat".to_string()), input.as_bytes(), &mut transcript);
            assert_eq!(result.exit_code, 0, "expected chat success: {}", result.output);

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "chat");
            assert_eq!(payload["message"], "session S-cli-chat: 2 turns");

            let transcript = String::from_utf8(transcript).expect("utf8 transcript");
            let lines: Vec<&str> = transcript.lines().collect();
            assert_eq!(lines.len(), 2);
            assert!(lines[0].starts_with("[consultation] "));
            assert!(lines[1].starts_with("[quotation] "));
        },
    );
}

#[test]
fn advisor_session_commands_share_a_database_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("autopoliza.db").display());

    with_env(&[("AUTOPOLIZA_DATABASE_URL", url.as_str())], || {
        let mut transcript = Vec::new();
        let result = chat::run_messages(
            Some("S-cli-adv".to_string()),
            vec!["quiero hablar con un asesor".to_string()],
            &mut transcript,
        );
        assert_eq!(result.exit_code, 0, "expected chat success: {}", result.output);
        assert!(String::from_utf8_lossy(&transcript).starts_with("[escalation] "));

        let listed = session::list(Some("transferred"));
        assert_eq!(listed.exit_code, 0);
        let sessions = parse_payload(&listed.output);
        assert_eq!(sessions.as_array().map(Vec::len), Some(1));
        assert_eq!(sessions[0]["id"], "S-cli-adv");

        let replied = session::reply("S-cli-adv", "Hola, soy Laura, reviso tu caso.");
        assert_eq!(replied.exit_code, 0, "expected reply success: {}", replied.output);
        assert_eq!(parse_payload(&replied.output)["command"], "session.reply");

        let status = parse_payload(&session::status("S-cli-adv").output);
        assert_eq!(status["exists"], true);
        assert_eq!(status["control_mode"], "human_active");
        assert_eq!(status["message_count"], 3);

        let released = session::release("S-cli-adv");
        assert_eq!(released.exit_code, 0);
        let message = parse_payload(&released.output)["message"].as_str().unwrap_or("").to_string();
        assert!(message.contains("automated"));
    });
}

#[test]
fn advisor_reply_to_unknown_session_is_not_found() {
    with_env(
        &[
            ("AUTOPOLIZA_DATABASE_URL", "sqlite::memory:"),
            ("AUTOPOLIZA_DATABASE_MAX_CONNECTIONS", "1"),
        ],
        || {
            let result = session::reply("S-nobody", "hola");
            assert_eq!(result.exit_code, 7);

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "session.reply");
            assert_eq!(payload["error_class"], "not_found");
        },
    );
}

#[test]
fn session_list_rejects_unknown_control_mode() {
    with_env(&[], || {
        let result = session::list(Some("paused"));
        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "bad_request");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "AUTOPOLIZA_DATABASE_URL",
        "AUTOPOLIZA_DATABASE_MAX_CONNECTIONS",
        "AUTOPOLIZA_DATABASE_TIMEOUT_SECS",
        "AUTOPOLIZA_LLM_PROVIDER",
        "AUTOPOLIZA_LLM_API_KEY",
        "AUTOPOLIZA_LLM_BASE_URL",
        "AUTOPOLIZA_LLM_MODEL",
        "AUTOPOLIZA_RETRIEVAL_URL",
        "AUTOPOLIZA_ISSUANCE_URL",
        "AUTOPOLIZA_ISSUANCE_API_KEY",
        "AUTOPOLIZA_CATALOG_PATH",
        "AUTOPOLIZA_SERVER_BIND_ADDRESS",
        "AUTOPOLIZA_SERVER_PORT",
        "AUTOPOLIZA_LOGGING_LEVEL",
        "AUTOPOLIZA_LOGGING_FORMAT",
        "AUTOPOLIZA_LOG_LEVEL",
        "AUTOPOLIZA_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
