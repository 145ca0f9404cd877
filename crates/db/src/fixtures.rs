use sqlx::SqliteConnection;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

/// Requests the demo dataset seeds, with the state each one is expected to be in.
const SEED_REQUESTS: &[SeedRequestContract] = &[
    SeedRequestContract::new("r1", 1041, "pending", "p1", 2, 1),
    SeedRequestContract::new("r2", 1042, "pending", "p1", 1, 1),
    SeedRequestContract::new("r3", 1043, "pending", "p2", 3, 1),
    SeedRequestContract::new("r4", 1044, "pending", "p3", 3, 1),
    SeedRequestContract::new("r5", 1045, "pending", "p2", 3, 1),
    SeedRequestContract::new("r6", 1046, "approved", "p1", 1, 2),
    SeedRequestContract::new("r7", 1047, "approved", "p3", 3, 2),
    SeedRequestContract::new("r8", 1048, "rejected", "p2", 1, 2),
    SeedRequestContract::new("r9", 1049, "purchased", "p1", 3, 3),
    SeedRequestContract::new("r10", 1050, "purchased", "p3", 3, 3),
];

const SEED_ORGANIZATION_ID: &str = "org-even";
const SEED_NEXT_PO_NUMBER: i64 = 1051;
const SEED_PROFILE_IDS: &[&str] = &["u1", "u2", "u3", "u4", "u5", "u6"];
const SEED_MEMBER_COUNT: i64 = 5;
const SEED_ROLES: &[&str] = &["org_admin", "manager", "foreman", "field_worker"];

/// Deterministic demo organization: five members across three projects and ten purchase
/// requests covering every lifecycle status.
pub struct DemoDataset;

impl DemoDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed.sql");

    /// Replaces any previously seeded demo rows with a fresh copy.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;

        delete_seeded_rows(&mut tx).await?;
        sqlx::raw_sql(Self::SQL).execute(&mut *tx).await?;
        tx.commit().await?;

        tracing::info!(
            event_name = "fixtures.demo.loaded",
            organization_id = SEED_ORGANIZATION_ID,
            requests = SEED_REQUESTS.len(),
            "demo dataset loaded"
        );

        Ok(SeedResult {
            organization_id: SEED_ORGANIZATION_ID,
            members: SEED_MEMBER_COUNT as usize,
            requests_seeded: SEED_REQUESTS.iter().map(|request| request.request_id).collect(),
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let organization: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM organizations WHERE id = ?1)")
                .bind(SEED_ORGANIZATION_ID)
                .fetch_one(pool)
                .await?;
        checks.push(("organization", organization == 1));

        let members: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM profiles WHERE organization_id = ?1")
                .bind(SEED_ORGANIZATION_ID)
                .fetch_one(pool)
                .await?;
        checks.push(("members", members == SEED_MEMBER_COUNT));

        let next_po: Option<i64> =
            sqlx::query_scalar("SELECT next_value FROM po_sequences WHERE organization_id = ?1")
                .bind(SEED_ORGANIZATION_ID)
                .fetch_optional(pool)
                .await?;
        checks.push(("po-sequence", next_po.is_some_and(|next| next >= SEED_NEXT_PO_NUMBER)));

        for request in SEED_REQUESTS {
            let present: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM purchase_requests
                 WHERE id = ?1 AND po_number = ?2 AND status = ?3 AND project_id = ?4)",
            )
            .bind(request.request_id)
            .bind(request.po_number)
            .bind(request.status)
            .bind(request.project_id)
            .fetch_one(pool)
            .await?;
            checks.push((request.request_id, present == 1));

            let line_count: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM line_items WHERE purchase_request_id = ?1")
                    .bind(request.request_id)
                    .fetch_one(pool)
                    .await?;
            checks.push(("line-items", line_count == request.line_count));

            let audit_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(1) FROM audit_entries WHERE purchase_request_id = ?1",
            )
            .bind(request.request_id)
            .fetch_one(pool)
            .await?;
            checks.push(("audit-entries", audit_count == request.audit_count));
        }

        let all_present = checks.iter().all(|(_, passed)| *passed);
        Ok(VerificationResult { all_present, checks })
    }

    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;
        delete_seeded_rows(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Children first, so foreign keys hold after every statement.
async fn delete_seeded_rows(conn: &mut SqliteConnection) -> Result<(), RepositoryError> {
    let organization_scoped = [
        "DELETE FROM audit_entries WHERE purchase_request_id IN
            (SELECT id FROM purchase_requests WHERE organization_id = ?1)",
        "DELETE FROM line_items WHERE purchase_request_id IN
            (SELECT id FROM purchase_requests WHERE organization_id = ?1)",
        "DELETE FROM purchase_requests WHERE organization_id = ?1",
        "DELETE FROM po_sequences WHERE organization_id = ?1",
        "DELETE FROM access_codes WHERE organization_id = ?1",
        "DELETE FROM project_role_bindings WHERE project_id IN
            (SELECT id FROM projects WHERE organization_id = ?1)",
        "DELETE FROM organization_roles WHERE organization_id = ?1",
        "DELETE FROM cost_codes WHERE organization_id = ?1",
        "DELETE FROM projects WHERE organization_id = ?1",
    ];
    for statement in organization_scoped {
        sqlx::query(statement).bind(SEED_ORGANIZATION_ID).execute(&mut *conn).await?;
    }

    let profiles = sql_array_from_ids(SEED_PROFILE_IDS);
    sqlx::query(&format!("DELETE FROM organization_roles WHERE user_id IN {profiles}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!("DELETE FROM project_role_bindings WHERE user_id IN {profiles}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!("DELETE FROM profiles WHERE id IN {profiles}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM organizations WHERE id = ?1")
        .bind(SEED_ORGANIZATION_ID)
        .execute(&mut *conn)
        .await?;

    let roles = sql_array_from_ids(SEED_ROLES);
    sqlx::query(&format!("DELETE FROM role_permissions WHERE role_name IN {roles}"))
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug, Clone, Copy)]
struct SeedRequestContract {
    request_id: &'static str,
    po_number: i64,
    status: &'static str,
    project_id: &'static str,
    line_count: i64,
    audit_count: i64,
}

impl SeedRequestContract {
    const fn new(
        request_id: &'static str,
        po_number: i64,
        status: &'static str,
        project_id: &'static str,
        line_count: i64,
        audit_count: i64,
    ) -> Self {
        Self { request_id, po_number, status, project_id, line_count, audit_count }
    }
}

#[derive(Debug)]
pub struct SeedResult {
    pub organization_id: &'static str,
    pub members: usize,
    pub requests_seeded: Vec<&'static str>,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
