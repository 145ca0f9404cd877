use std::env;
use std::sync::{Mutex, OnceLock};

use fieldpo_cli::commands::access::{self, CanArgs, ClaimArgs};
use fieldpo_cli::commands::context::ActingAs;
use fieldpo_cli::commands::requests::{
    self, ListArgs, PurchaseArgs, RejectArgs, ShowArgs, SubmitArgs, TransitionArgs,
};
use fieldpo_cli::commands::{config, migrate, seed, CommandResult};
use rust_decimal::Decimal;
use serde_json::Value;
use tempfile::TempDir;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("FIELDPO_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("FIELDPO_DATABASE_URL", "postgres://localhost/fieldpo")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn seed_is_idempotent_across_runs() {
    let database = TempDatabase::new();
    with_env(&database.env(), || {
        let first = expect_ok(seed::run());
        let second = expect_ok(seed::run());

        assert_eq!(first["message"], second["message"]);
        assert_eq!(first["data"]["organization_id"], "org-even");
        assert_eq!(first["data"]["members"], 5);
        assert_eq!(first["data"]["requests"].as_array().map(Vec::len), Some(10));
    });
}

#[test]
fn config_reports_sources_and_redacts_secrets() {
    with_env(
        &[
            ("FIELDPO_DATABASE_URL", "sqlite::memory:"),
            ("FIELDPO_BACKEND_URL", "https://even.example.co"),
            ("FIELDPO_BACKEND_ANON_KEY", "anon-secret-value-1234"),
        ],
        || {
            let payload = expect_ok(config::run());
            let message = payload["message"].as_str().unwrap_or_default();

            assert!(message.contains("- database.url = sqlite::memory: (source: env (FIELDPO_DATABASE_URL))"));
            assert!(message.contains("- organization.po_seed = 1001 (source: default)"));
            assert!(!message.contains("anon-secret-value-1234"));
            assert!(message.contains("backend.access_token = <unset>"));
        },
    );
}

#[test]
fn requests_flow_from_submission_to_purchase() {
    let database = TempDatabase::new();
    with_env(&database.env(), || {
        expect_ok(seed::run());

        let submitted = expect_ok(requests::submit(submit_args("u1", "p1")));
        assert_eq!(submitted["message"], "submitted PO-1051");
        let request_id = submitted["data"]["request"]["header"]["id"]
            .as_str()
            .expect("new request id")
            .to_owned();
        assert_eq!(submitted["data"]["status"], "pending");
        assert_eq!(
            submitted["data"]["line_item_total"].as_str().and_then(|total| total.parse().ok()),
            Some(Decimal::from(356))
        );

        let denied = requests::approve(transition("u1", &request_id));
        assert_eq!(denied.exit_code, 7);
        assert_eq!(parse_payload(&denied.output)["error_class"], "unauthorized");

        let approved = expect_ok(requests::approve(transition("u3", &request_id)));
        assert_eq!(approved["data"]["status"], "approved");
        assert_eq!(approved["data"]["allowed_actions"], serde_json::json!(["mark_purchased"]));

        let purchased = expect_ok(requests::purchase(PurchaseArgs {
            acting_as: acting_as("u3"),
            request_id: request_id.clone(),
            final_total: Some(Decimal::new(39_200, 2)),
            receipt: Some("/mock/receipt-ferguson.jpg".to_owned()),
            notes: None,
        }));
        assert_eq!(purchased["message"], "purchased PO-1051 (+$36.00)");
        assert_eq!(purchased["data"]["variance"]["percent"], "10.1");

        let shown = expect_ok(requests::show(ShowArgs {
            acting_as: acting_as("u1"),
            request_id: request_id.clone(),
        }));
        assert_eq!(shown["data"]["status"], "purchased");
        assert_eq!(shown["data"]["audit_trail"].as_array().map(Vec::len), Some(3));

        let mine = expect_ok(requests::list(ListArgs {
            acting_as: acting_as("u1"),
            status: Some("purchased".parse().expect("status")),
            mine: true,
            awaiting: false,
        }));
        assert_eq!(mine["data"].as_array().map(Vec::len), Some(2));
        assert_eq!(mine["data"][0]["po_number"], "PO-1051");
    });
}

#[test]
fn submissions_outside_bound_projects_are_denied() {
    let database = TempDatabase::new();
    with_env(&database.env(), || {
        expect_ok(seed::run());

        let result = requests::submit(submit_args("u1", "p2"));
        assert_eq!(result.exit_code, 7);
        assert_eq!(parse_payload(&result.output)["error_class"], "project_access_denied");
    });
}

#[test]
fn rejections_need_a_reason_and_a_pending_request() {
    let database = TempDatabase::new();
    with_env(&database.env(), || {
        expect_ok(seed::run());

        let blank = requests::reject(RejectArgs {
            acting_as: acting_as("u3"),
            request_id: "r2".to_owned(),
            reason: "  ".to_owned(),
        });
        assert_eq!(blank.exit_code, 8);
        assert_eq!(parse_payload(&blank.output)["error_class"], "validation");

        let rejected = expect_ok(requests::reject(RejectArgs {
            acting_as: acting_as("u3"),
            request_id: "r2".to_owned(),
            reason: "Use the lift already on site".to_owned(),
        }));
        assert_eq!(rejected["data"]["status"], "rejected");

        let again = requests::approve(transition("u3", "r2"));
        assert_eq!(again.exit_code, 8);
        assert_eq!(parse_payload(&again.output)["error_class"], "invalid_transition");
    });
}

#[test]
fn awaiting_lists_only_approvable_requests() {
    let database = TempDatabase::new();
    with_env(&database.env(), || {
        expect_ok(seed::run());

        let foreman = expect_ok(requests::list(ListArgs {
            acting_as: acting_as("u2"),
            status: None,
            mine: false,
            awaiting: true,
        }));
        let ids: Vec<&str> = foreman["data"]
            .as_array()
            .map(|rows| rows.iter().filter_map(|row| row["id"].as_str()).collect())
            .unwrap_or_default();
        assert_eq!(ids, vec!["r5", "r3"]);

        let worker = expect_ok(access::can(CanArgs {
            acting_as: acting_as("u1"),
            permission: "po.approve".to_owned(),
            project: Some("p1".to_owned()),
        }));
        assert_eq!(worker["data"]["allowed"], false);
    });
}

#[test]
fn access_codes_join_and_leave_organizations() {
    let database = TempDatabase::new();
    with_env(&database.env(), || {
        expect_ok(seed::run());

        let before = expect_ok(access::whoami(acting_as("u6")));
        assert!(before["data"]["organization"].is_null());

        let expired = access::claim_code(ClaimArgs {
            acting_as: acting_as("u6"),
            code: "EVEN-EXPIRED".to_owned(),
        });
        assert_eq!(expired.exit_code, 8);
        assert_eq!(parse_payload(&expired.output)["error_class"], "conflict");

        let joined = expect_ok(access::claim_code(ClaimArgs {
            acting_as: acting_as("u6"),
            code: " even-crew-2026 ".to_owned(),
        }));
        assert_eq!(joined["message"], "joined Even Construction");

        let can_create = expect_ok(access::can(CanArgs {
            acting_as: acting_as("u6"),
            permission: "po.create".to_owned(),
            project: None,
        }));
        assert_eq!(can_create["data"]["allowed"], true);

        expect_ok(access::leave_org(acting_as("u6")));
        let after = expect_ok(access::whoami(acting_as("u6")));
        assert!(after["data"]["organization"].is_null());
        assert_eq!(after["data"]["onboarded"], false);
    });
}

#[test]
fn unknown_users_are_not_authenticated() {
    let database = TempDatabase::new();
    with_env(&database.env(), || {
        expect_ok(seed::run());

        let result = requests::list(ListArgs {
            acting_as: acting_as("u404"),
            status: None,
            mine: false,
            awaiting: false,
        });
        assert_eq!(result.exit_code, 7);
        assert_eq!(parse_payload(&result.output)["error_class"], "not_authenticated");
    });
}

#[test]
fn remote_mode_requires_an_access_token() {
    with_env(
        &[
            ("FIELDPO_DATABASE_URL", "sqlite::memory:"),
            ("FIELDPO_BACKEND_URL", "http://127.0.0.1:9"),
            ("FIELDPO_BACKEND_ANON_KEY", "anon-key"),
        ],
        || {
            let result = requests::list(ListArgs {
                acting_as: acting_as("u1"),
                status: None,
                mine: false,
                awaiting: false,
            });
            assert_eq!(result.exit_code, 2);
            assert_eq!(parse_payload(&result.output)["error_class"], "config_validation");
        },
    );
}

struct TempDatabase {
    _dir: TempDir,
    url: String,
}

impl TempDatabase {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!("sqlite://{}", dir.path().join("fieldpo.db").display());
        Self { _dir: dir, url }
    }

    fn env(&self) -> [(&str, &str); 1] {
        [("FIELDPO_DATABASE_URL", self.url.as_str())]
    }
}

fn acting_as(user_id: &str) -> ActingAs {
    ActingAs { user_id: user_id.to_owned() }
}

fn transition(user_id: &str, request_id: &str) -> TransitionArgs {
    TransitionArgs { acting_as: acting_as(user_id), request_id: request_id.to_owned() }
}

fn submit_args(user_id: &str, project: &str) -> SubmitArgs {
    SubmitArgs {
        acting_as: acting_as(user_id),
        project: project.to_owned(),
        cost_code: "cc8".to_owned(),
        vendor: "Ferguson Enterprises".to_owned(),
        category: "materials".parse().expect("category"),
        items: vec!["3/4\" PEX-A Pipe 100ft:4:rolls:89.00".to_owned()],
        need_by: "tomorrow".parse().expect("need by"),
        urgency: "normal".parse().expect("urgency"),
        notes: "Rough-in for the second floor restrooms.".to_owned(),
        deliver_to: None,
        attachments: Vec::new(),
    }
}

fn expect_ok(result: CommandResult) -> Value {
    let payload = parse_payload(&result.output);
    assert_eq!(result.exit_code, 0, "command failed: {}", result.output);
    assert_eq!(payload["status"], "ok");
    payload
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let keys = [
        "FIELDPO_DATABASE_URL",
        "FIELDPO_DATABASE_MAX_CONNECTIONS",
        "FIELDPO_DATABASE_TIMEOUT_SECS",
        "FIELDPO_BACKEND_URL",
        "FIELDPO_BACKEND_ANON_KEY",
        "FIELDPO_ACCESS_TOKEN",
        "FIELDPO_BACKEND_TIMEOUT_SECS",
        "FIELDPO_ORGANIZATION_PO_SEED",
        "FIELDPO_LOGGING_LEVEL",
        "FIELDPO_LOGGING_FORMAT",
        "FIELDPO_LOG_LEVEL",
        "FIELDPO_LOG_FORMAT",
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
