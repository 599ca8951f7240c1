use std::future::Future;
use std::str::FromStr;

use autopoliza_agent::{Orchestrator, OrchestratorError};
use autopoliza_core::domain::session::{ControlMode, SessionId};
use serde::Serialize;

use crate::commands::{async_runtime, load_config, open_workspace, CommandResult};

pub fn status(session_id: &str) -> CommandResult {
    let id = SessionId(session_id.to_string());
    with_orchestrator("session.status", |orchestrator| async move {
        orchestrator.get_session_status(&id).await.map(|status| pretty(&status))
    })
}

pub fn list(control_mode: Option<&str>) -> CommandResult {
    let filter = match control_mode.map(ControlMode::from_str).transpose() {
        Ok(filter) => filter,
        Err(error) => return CommandResult::failure("session.list", "bad_request", error.to_string(), 2),
    };
    with_orchestrator("session.list", |orchestrator| async move {
        orchestrator.list_sessions(filter).await.map(|sessions| pretty(&sessions))
    })
}

pub fn reply(session_id: &str, content: &str) -> CommandResult {
    let id = SessionId(session_id.to_string());
    let content = content.to_string();
    with_orchestrator("session.reply", |orchestrator| async move {
        let message = orchestrator.post_advisor_message(&id, &content).await?;
        Ok::<_, OrchestratorError>(outcome(
            "session.reply",
            format!("advisor message {} posted to {}", message.id.0, id.0),
        ))
    })
}

pub fn release(session_id: &str) -> CommandResult {
    let id = SessionId(session_id.to_string());
    with_orchestrator("session.release", |orchestrator| async move {
        let session = orchestrator.release_session(&id).await?;
        Ok::<_, OrchestratorError>(outcome(
            "session.release",
            format!("session {} is back in {} mode", session.id.0, session.control_mode.as_str()),
        ))
    })
}

fn outcome(command: &str, message: String) -> String {
    CommandResult::success(command, message).output
}

fn pretty(value: &impl Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|error| format!("{{\"error\":\"{error}\"}}"))
}

fn with_orchestrator<F, Fut>(command: &str, action: F) -> CommandResult
where
    F: FnOnce(std::sync::Arc<Orchestrator>) -> Fut,
    Fut: Future<Output = Result<String, OrchestratorError>>,
{
    let config = match load_config(command) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match async_runtime(command) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let workspace = match open_workspace(&config).await {
            Ok(workspace) => workspace,
            Err((error_class, message, exit_code)) => {
                return CommandResult::failure(command, error_class, message, exit_code);
            }
        };

        let result = action(workspace.agent.orchestrator()).await;
        workspace.pool.close().await;

        match result {
            Ok(output) => CommandResult { exit_code: 0, output },
            Err(error) => CommandResult::failure(command, error.error_class(), error.to_string(), 7),
        }
    })
}
