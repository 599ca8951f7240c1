use autopoliza_agent::runtime::build_collaborators;
use autopoliza_core::config::{AppConfig, LoadOptions};
use serde::Serialize;

use crate::commands::{async_runtime, open_workspace, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_collaborators(&config));
            checks.extend(check_store_and_handlers(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["collaborators", "database", "handlers"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_collaborators(config: &AppConfig) -> DoctorCheck {
    match build_collaborators(&config.backends) {
        Ok(collaborators) => DoctorCheck {
            name: "collaborators",
            status: CheckStatus::Pass,
            details: format!(
                "retrieval `{}`, pricing `{}`, issuance `{}`",
                collaborators.retrieval.name(),
                collaborators.pricing.name(),
                collaborators.issuance.name()
            ),
        },
        Err(error) => DoctorCheck {
            name: "collaborators",
            status: CheckStatus::Fail,
            details: format!("{error:#}"),
        },
    }
}

fn check_store_and_handlers(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match async_runtime("doctor") {
        Ok(runtime) => runtime,
        Err(_) => {
            return vec![DoctorCheck {
                name: "database",
                status: CheckStatus::Fail,
                details: "failed to initialize async runtime".to_string(),
            }];
        }
    };

    runtime.block_on(async {
        let workspace = match open_workspace(config).await {
            Ok(workspace) => workspace,
            Err((error_class, message, _)) => {
                return vec![
                    DoctorCheck {
                        name: "database",
                        status: CheckStatus::Fail,
                        details: format!("{error_class}: {message}"),
                    },
                    DoctorCheck {
                        name: "handlers",
                        status: CheckStatus::Skipped,
                        details: "skipped because the session store is unavailable".to_string(),
                    },
                ];
            }
        };

        let health = workspace.agent.orchestrator().get_system_health().await;
        workspace.pool.close().await;

        let missing: Vec<&str> = health
            .handlers
            .iter()
            .filter(|(_, state)| state.as_str() != "registered")
            .map(|(name, _)| name.as_str())
            .collect();
        let handlers = if missing.is_empty() {
            DoctorCheck {
                name: "handlers",
                status: CheckStatus::Pass,
                details: format!(
                    "{} handlers registered, classifier `{}`",
                    health.handlers.len(),
                    health.dependencies.get("classifier").map(String::as_str).unwrap_or("unknown")
                ),
            }
        } else {
            DoctorCheck {
                name: "handlers",
                status: CheckStatus::Fail,
                details: format!("missing handlers: {}", missing.join(", ")),
            }
        };

        vec![
            DoctorCheck {
                name: "database",
                status: CheckStatus::Pass,
                details: format!("connected and migrated `{}`", config.database.url),
            },
            handlers,
        ]
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
