use std::io::{self, BufRead, Write};

use autopoliza_agent::TurnRequest;

use crate::commands::{async_runtime, load_config, open_workspace, CommandResult};

const EXIT_WORDS: [&str; 3] = ["/salir", "/exit", "/quit"];

/// Reads one client turn per line from `input` until EOF or an exit word.
pub fn run(session: Option<String>, input: impl BufRead, output: impl Write) -> CommandResult {
    converse(session, input.lines(), output)
}

pub fn run_messages(session: Option<String>, messages: Vec<String>, output: impl Write) -> CommandResult {
    converse(session, messages.into_iter().map(Ok), output)
}

fn converse(
    session: Option<String>,
    lines: impl Iterator<Item = io::Result<String>>,
    mut output: impl Write,
) -> CommandResult {
    let config = match load_config("chat") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match async_runtime("chat") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let workspace = match runtime.block_on(open_workspace(&config)) {
        Ok(workspace) => workspace,
        Err((error_class, message, exit_code)) => {
            return CommandResult::failure("chat", error_class, message, exit_code);
        }
    };

    let session_id = session.unwrap_or_else(|| format!("CLI-{}", uuid::Uuid::new_v4().simple()));
    let mut turns = 0usize;
    let mut failure = None;

    for line in lines {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                failure = Some(CommandResult::failure("chat", "io", error.to_string(), 8));
                break;
            }
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if EXIT_WORDS.contains(&text) {
            break;
        }

        let response =
            runtime.block_on(workspace.agent.handle_turn(TurnRequest::new(session_id.as_str(), text)));
        turns += 1;

        let rendered = if response.content.is_empty() {
            format!("[{}] (un asesor responderá en breve)", response.handler)
        } else {
            format!("[{}] {}", response.handler, response.content)
        };
        if let Err(error) = writeln!(output, "{rendered}") {
            failure = Some(CommandResult::failure("chat", "io", error.to_string(), 8));
            break;
        }
    }

    runtime.block_on(workspace.pool.close());

    failure.unwrap_or_else(|| {
        CommandResult::success("chat", format!("session {session_id}: {turns} turns"))
    })
}
