use serde::Serialize;

use crate::commands::context::open_database;
use crate::commands::{
    execute, CommandFailure, CommandOutput, CommandResult, EXIT_PERSISTENCE, EXIT_VERIFICATION,
};
use fieldpo_db::DemoDataset;

#[derive(Debug, Serialize)]
struct SeedSummary {
    organization_id: &'static str,
    members: usize,
    requests: Vec<&'static str>,
}

pub fn run() -> CommandResult {
    execute("seed", |config| async move {
        let pool = open_database(&config).await?;

        let outcome = async {
            let seed_result = DemoDataset::load(&pool).await.map_err(|error| {
                CommandFailure::new("seed_execution", error.to_string(), EXIT_PERSISTENCE)
            })?;

            let verification = DemoDataset::verify(&pool).await.map_err(|error| {
                CommandFailure::new("seed_verification", error.to_string(), EXIT_VERIFICATION)
            })?;
            if !verification.all_present {
                return Err(CommandFailure::new(
                    "seed_verification",
                    verification_failure_message(&verification.checks),
                    EXIT_VERIFICATION,
                ));
            }

            CommandOutput::with_data(
                format!(
                    "demo dataset loaded for {}: {} members, {} purchase requests",
                    seed_result.organization_id,
                    seed_result.members,
                    seed_result.requests_seeded.len()
                ),
                SeedSummary {
                    organization_id: seed_result.organization_id,
                    members: seed_result.members,
                    requests: seed_result.requests_seeded,
                },
            )
        }
        .await;

        pool.close().await;
        outcome
    })
}

fn verification_failure_message(checks: &[(&'static str, bool)]) -> String {
    let mut failed_checks = checks
        .iter()
        .filter_map(|(check, passed)| (!passed).then_some(*check))
        .collect::<Vec<_>>();
    failed_checks.dedup();

    if failed_checks.is_empty() {
        "some seed data failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_failure_message;

    #[test]
    fn verification_error_message_targets_failed_checks() {
        let checks = [
            ("organization", true),
            ("request-status", false),
            ("request-status", false),
            ("audit-entries", false),
        ];

        assert_eq!(
            verification_failure_message(&checks),
            "seed verification failed for checks: request-status, audit-entries"
        );
    }

    #[test]
    fn verification_error_message_falls_back_to_generic_when_no_labels() {
        let checks = [("organization", true), ("members", true)];

        assert_eq!(verification_failure_message(&checks), "some seed data failed to load");
    }
}
