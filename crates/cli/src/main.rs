use std::process::ExitCode;

fn main() -> ExitCode {
    autopoliza_cli::run()
}
