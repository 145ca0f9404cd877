use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use fieldpo_core::audit::{AuditAction, AuditEntry};
use fieldpo_core::backend::{BackendError, Identity, RequestAction, RequestRepository};
use fieldpo_core::config::DEFAULT_PO_SEED;
use fieldpo_core::domain::profile::{OrganizationId, UserId, UserProfile};
use fieldpo_core::domain::project::{CostCode, Project};
use fieldpo_core::domain::request::{
    assemble_requests, LineItemRecord, PoNumber, PurchaseRequest, RequestHeader, RequestId,
    RequestStatus,
};
use fieldpo_core::errors::DomainError;
use fieldpo_core::lifecycle::{LifecycleEngine, NewRequest, Submission};
use fieldpo_core::schema::{
    format_timestamp, parse_timestamp, CostCodeRow, LineItemRow, ProjectRow, RequestRow,
};

use super::access::{load_member, row_to_profile, MemberAccess};
use super::{parse_decimal, parse_optional_decimal, parse_string_list, RepositoryError};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, organization_id, po_number, project_id, requester_id, vendor, \
    category, cost_code_id, estimated_total, final_total, need_by, urgency, notes, attachments, \
    receipt_attachments, delivery_method, delivery_address, status, created_at, updated_at, \
    approved_at, approved_by, rejected_at, rejected_by, rejection_reason, purchased_at";

/// Organization-scoped reads and lifecycle writes over the local SQLite store. Every write runs
/// in one transaction together with its audit entry.
pub struct SqlRequestRepository {
    pool: DbPool,
    engine: LifecycleEngine,
    po_seed: u64,
}

impl SqlRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, engine: LifecycleEngine::new(), po_seed: DEFAULT_PO_SEED }
    }

    /// First PO number for organizations that have no sequence row yet.
    pub fn with_po_seed(mut self, po_seed: u64) -> Self {
        self.po_seed = po_seed.max(1);
        self
    }

    pub async fn projects(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<Project>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, job_number, address, monthly_budget, status
             FROM projects WHERE organization_id = ? ORDER BY name",
        )
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_project).collect()
    }

    pub async fn cost_codes(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<CostCode>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, code, label, category
             FROM cost_codes WHERE organization_id = ? ORDER BY code",
        )
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_cost_code).collect()
    }

    pub async fn request_headers(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<RequestHeader>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM purchase_requests
             WHERE organization_id = ?
             ORDER BY created_at DESC, po_number DESC"
        ))
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_request_header).collect()
    }

    pub async fn line_items(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<LineItemRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT li.id, li.purchase_request_id, li.name, li.quantity, li.unit,
                    li.estimated_unit_cost, li.sort_order
             FROM line_items li
             INNER JOIN purchase_requests pr ON pr.id = li.purchase_request_id
             WHERE pr.organization_id = ?
             ORDER BY li.purchase_request_id, li.sort_order",
        )
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_line_item).collect()
    }

    pub async fn profiles(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<UserProfile>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, organization_id, email, full_name, avatar_url, onboarded, disabled
             FROM profiles WHERE organization_id = ? ORDER BY full_name",
        )
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_profile).collect()
    }

    /// Every request in the organization with its line items, newest first.
    pub async fn requests(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<PurchaseRequest>, RepositoryError> {
        let headers = self.request_headers(organization_id).await?;
        let items = self.line_items(organization_id).await?;
        Ok(assemble_requests(headers, items))
    }

    pub async fn find_request(
        &self,
        organization_id: &OrganizationId,
        request_id: &RequestId,
    ) -> Result<Option<PurchaseRequest>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        fetch_request(&mut conn, organization_id, request_id).await
    }

    /// Stored audit entries for one request, newest first.
    pub async fn audit_trail(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, purchase_request_id, action, user_id, timestamp, details
             FROM audit_entries WHERE purchase_request_id = ?
             ORDER BY timestamp DESC, rowid DESC",
        )
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_audit_entry).collect()
    }

    /// Stored audit entries across the organization, newest first.
    pub async fn audit_log(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT a.id, a.purchase_request_id, a.action, a.user_id, a.timestamp, a.details
             FROM audit_entries a
             INNER JOIN purchase_requests pr ON pr.id = a.purchase_request_id
             WHERE pr.organization_id = ?
             ORDER BY a.timestamp DESC, a.rowid DESC",
        )
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_audit_entry).collect()
    }

    /// Allocates the next PO number and inserts the request, its line items and the
    /// submission audit entry in one transaction.
    pub async fn create(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
        request: NewRequest,
    ) -> Result<PurchaseRequest, RepositoryError> {
        let access = self.require_member(identity, organization_id).await?;
        request.verify().map_err(DomainError::from)?;
        access.grant.require_project_access(&request.project_id)?;

        let mut tx = self.pool.begin().await?;

        ensure_owned(&mut tx, "projects", "project", &request.project_id.0, organization_id).await?;
        ensure_owned(&mut tx, "cost_codes", "cost_code", &request.cost_code_id.0, organization_id)
            .await?;

        let po_number = allocate_po_number(&mut tx, organization_id, self.po_seed).await?;
        let submission = Submission {
            id: RequestId(Uuid::new_v4().to_string()),
            po_number,
            organization_id: organization_id.clone(),
            requester_id: identity.user_id.clone(),
            submitted_at: Utc::now(),
        };
        let (created, outcome) = self.engine.submit(request, submission, &access.grant)?;

        insert_request(&mut tx, &created).await?;
        insert_audit_entry(&mut tx, &outcome.audit_entry).await?;
        tx.commit().await?;

        tracing::info!(
            event_name = "request.lifecycle.submitted",
            request_id = %created.id(),
            po_number = %created.header.po_number,
            organization_id = %organization_id,
            "purchase request submitted"
        );
        Ok(created)
    }

    /// Applies an approve, reject or mark-purchased action. The update is guarded by the
    /// status the request was loaded in, so a concurrent transition surfaces as a conflict.
    pub async fn apply(
        &self,
        identity: &Identity,
        action: RequestAction,
    ) -> Result<PurchaseRequest, RepositoryError> {
        let access = load_member(&self.pool, &identity.user_id).await?;
        let organization_id =
            access.organization_id().cloned().ok_or_else(RepositoryError::not_member)?;

        let mut tx = self.pool.begin().await?;

        let mut request = fetch_request(&mut tx, &organization_id, action.request_id())
            .await?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "purchase_request",
                id: action.request_id().0.clone(),
            })?;
        let loaded_status = request.status();

        let outcome =
            self.engine.apply(&mut request, &identity.user_id, &access.grant, &action, Utc::now())?;

        let updated = update_request_state(&mut tx, &request, loaded_status).await?;
        if updated == 0 {
            return Err(RepositoryError::Conflict(format!(
                "request `{}` is no longer {loaded_status}",
                request.id()
            )));
        }
        insert_audit_entry(&mut tx, &outcome.audit_entry).await?;
        tx.commit().await?;

        tracing::info!(
            event_name = "request.lifecycle.transitioned",
            request_id = %request.id(),
            action = %outcome.action,
            from = %loaded_status,
            to = %outcome.to,
            actor = %identity.user_id,
            "purchase request transitioned"
        );
        Ok(request)
    }

    async fn require_member(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<MemberAccess, RepositoryError> {
        let access = load_member(&self.pool, &identity.user_id).await?;
        access.require_member_of(organization_id)?;
        Ok(access)
    }
}

#[async_trait::async_trait]
impl RequestRepository for SqlRequestRepository {
    async fn list_projects(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<Project>, BackendError> {
        self.require_member(identity, organization_id).await?;
        Ok(self.projects(organization_id).await?)
    }

    async fn list_cost_codes(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<CostCode>, BackendError> {
        self.require_member(identity, organization_id).await?;
        Ok(self.cost_codes(organization_id).await?)
    }

    async fn list_requests(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<RequestHeader>, BackendError> {
        self.require_member(identity, organization_id).await?;
        Ok(self.request_headers(organization_id).await?)
    }

    async fn list_line_items(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<LineItemRecord>, BackendError> {
        self.require_member(identity, organization_id).await?;
        Ok(self.line_items(organization_id).await?)
    }

    async fn list_profiles(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<UserProfile>, BackendError> {
        self.require_member(identity, organization_id).await?;
        Ok(self.profiles(organization_id).await?)
    }

    async fn list_audit_entries(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<AuditEntry>, BackendError> {
        self.require_member(identity, organization_id).await?;
        Ok(self.audit_log(organization_id).await?)
    }

    async fn create_request(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
        request: NewRequest,
    ) -> Result<PurchaseRequest, BackendError> {
        Ok(self.create(identity, organization_id, request).await?)
    }

    async fn apply_action(
        &self,
        identity: &Identity,
        action: RequestAction,
    ) -> Result<PurchaseRequest, BackendError> {
        Ok(self.apply(identity, action).await?)
    }
}

async fn ensure_owned(
    conn: &mut SqliteConnection,
    table: &str,
    entity: &'static str,
    id: &str,
    organization_id: &OrganizationId,
) -> Result<(), RepositoryError> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(1) FROM {table} WHERE id = ? AND organization_id = ?"
    ))
    .bind(id)
    .bind(&organization_id.0)
    .fetch_one(&mut *conn)
    .await?;

    if count == 0 {
        return Err(RepositoryError::NotFound { entity, id: id.to_owned() });
    }
    Ok(())
}

/// Hands out the next number of the organization's sequence, seeding the sequence on first use.
async fn allocate_po_number(
    conn: &mut SqliteConnection,
    organization_id: &OrganizationId,
    po_seed: u64,
) -> Result<PoNumber, RepositoryError> {
    let seed = i64::try_from(po_seed)
        .map_err(|_| RepositoryError::Conflict(format!("PO seed {po_seed} is out of range")))?;

    sqlx::query(
        "INSERT INTO po_sequences (organization_id, next_value) VALUES (?, ?)
         ON CONFLICT (organization_id) DO NOTHING",
    )
    .bind(&organization_id.0)
    .bind(seed)
    .execute(&mut *conn)
    .await?;

    let allocated: i64 = sqlx::query_scalar(
        "UPDATE po_sequences SET next_value = next_value + 1
         WHERE organization_id = ?
         RETURNING next_value - 1",
    )
    .bind(&organization_id.0)
    .fetch_one(&mut *conn)
    .await?;

    u64::try_from(allocated)
        .map(PoNumber)
        .map_err(|_| RepositoryError::Decode(format!("po sequence yielded {allocated}")))
}

async fn fetch_request(
    conn: &mut SqliteConnection,
    organization_id: &OrganizationId,
    request_id: &RequestId,
) -> Result<Option<PurchaseRequest>, RepositoryError> {
    let Some(row) = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM purchase_requests WHERE id = ? AND organization_id = ?"
    ))
    .bind(&request_id.0)
    .bind(&organization_id.0)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };
    let header = row_to_request_header(&row)?;

    let items = sqlx::query(
        "SELECT id, purchase_request_id, name, quantity, unit, estimated_unit_cost, sort_order
         FROM line_items WHERE purchase_request_id = ? ORDER BY sort_order",
    )
    .bind(&request_id.0)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(row_to_line_item)
    .collect::<Result<Vec<_>, _>>()?;

    Ok(assemble_requests(vec![header], items).pop())
}

async fn insert_request(
    conn: &mut SqliteConnection,
    request: &PurchaseRequest,
) -> Result<(), RepositoryError> {
    let row = RequestRow::from(&request.header);
    let po_number = i64::try_from(request.header.po_number.0).map_err(|_| {
        RepositoryError::Conflict(format!("{} is out of range", request.header.po_number))
    })?;

    sqlx::query(&format!(
        "INSERT INTO purchase_requests ({REQUEST_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&row.id)
    .bind(&row.organization_id)
    .bind(po_number)
    .bind(&row.project_id)
    .bind(&row.requester_id)
    .bind(&row.vendor)
    .bind(&row.category)
    .bind(&row.cost_code_id)
    .bind(row.estimated_total.to_string())
    .bind(row.final_total.map(|total| total.to_string()))
    .bind(&row.need_by)
    .bind(&row.urgency)
    .bind(row.notes.clone().unwrap_or_default())
    .bind(serde_json::to_string(&request.header.attachments)?)
    .bind(serde_json::to_string(&request.header.receipt_attachments)?)
    .bind(&row.delivery_method)
    .bind(&row.delivery_address)
    .bind(&row.status)
    .bind(&row.created_at)
    .bind(&row.updated_at)
    .bind(&row.approved_at)
    .bind(&row.approved_by)
    .bind(&row.rejected_at)
    .bind(&row.rejected_by)
    .bind(&row.rejection_reason)
    .bind(&row.purchased_at)
    .execute(&mut *conn)
    .await?;

    for (sort_order, item) in request.line_items.iter().enumerate() {
        sqlx::query(
            "INSERT INTO line_items
                (id, purchase_request_id, name, quantity, unit, estimated_unit_cost, sort_order)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id.0)
        .bind(&request.header.id.0)
        .bind(&item.name)
        .bind(item.quantity.to_string())
        .bind(&item.unit)
        .bind(item.estimated_unit_cost.to_string())
        .bind(sort_order as i64)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn update_request_state(
    conn: &mut SqliteConnection,
    request: &PurchaseRequest,
    expected_status: RequestStatus,
) -> Result<u64, RepositoryError> {
    let row = RequestRow::from(&request.header);

    let result = sqlx::query(
        "UPDATE purchase_requests
         SET status = ?, final_total = ?, notes = ?, receipt_attachments = ?, updated_at = ?,
             approved_at = ?, approved_by = ?, rejected_at = ?, rejected_by = ?,
             rejection_reason = ?, purchased_at = ?
         WHERE id = ? AND status = ?",
    )
    .bind(&row.status)
    .bind(row.final_total.map(|total| total.to_string()))
    .bind(row.notes.clone().unwrap_or_default())
    .bind(serde_json::to_string(&request.header.receipt_attachments)?)
    .bind(&row.updated_at)
    .bind(&row.approved_at)
    .bind(&row.approved_by)
    .bind(&row.rejected_at)
    .bind(&row.rejected_by)
    .bind(&row.rejection_reason)
    .bind(&row.purchased_at)
    .bind(&row.id)
    .bind(expected_status.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

async fn insert_audit_entry(
    conn: &mut SqliteConnection,
    entry: &AuditEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO audit_entries (id, purchase_request_id, action, user_id, timestamp, details)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.request_id.0)
    .bind(entry.action.as_str())
    .bind(&entry.user_id.0)
    .bind(format_timestamp(&entry.timestamp))
    .bind(&entry.details)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn row_to_request_header(row: &SqliteRow) -> Result<RequestHeader, RepositoryError> {
    let po_number: i64 = row.try_get("po_number")?;
    let po_number = u64::try_from(po_number)
        .map(PoNumber)
        .map_err(|_| RepositoryError::Decode(format!("po_number {po_number} is negative")))?;

    let request = RequestRow {
        id: row.try_get("id")?,
        po_number: po_number.to_string(),
        organization_id: row.try_get("organization_id")?,
        project_id: row.try_get("project_id")?,
        requester_id: row.try_get("requester_id")?,
        vendor: row.try_get("vendor")?,
        category: row.try_get("category")?,
        cost_code_id: row.try_get("cost_code_id")?,
        estimated_total: parse_decimal("estimated_total", row.try_get("estimated_total")?)?,
        final_total: parse_optional_decimal("final_total", row.try_get("final_total")?)?,
        need_by: row.try_get("need_by")?,
        urgency: row.try_get("urgency")?,
        notes: row.try_get("notes")?,
        attachments: Some(parse_string_list("attachments", row.try_get("attachments")?)?),
        receipt_attachments: Some(parse_string_list(
            "receipt_attachments",
            row.try_get("receipt_attachments")?,
        )?),
        delivery_method: row.try_get("delivery_method")?,
        delivery_address: row.try_get("delivery_address")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        approved_at: row.try_get("approved_at")?,
        approved_by: row.try_get("approved_by")?,
        rejected_at: row.try_get("rejected_at")?,
        rejected_by: row.try_get("rejected_by")?,
        rejection_reason: row.try_get("rejection_reason")?,
        purchased_at: row.try_get("purchased_at")?,
    };

    Ok(RequestHeader::try_from(request)?)
}

fn row_to_line_item(row: &SqliteRow) -> Result<LineItemRecord, RepositoryError> {
    let item = LineItemRow {
        id: row.try_get("id")?,
        purchase_request_id: row.try_get("purchase_request_id")?,
        name: row.try_get("name")?,
        quantity: parse_decimal("quantity", row.try_get("quantity")?)?,
        unit: row.try_get("unit")?,
        estimated_unit_cost: parse_decimal("estimated_unit_cost", row.try_get("estimated_unit_cost")?)?,
        sort_order: row.try_get("sort_order")?,
    };
    Ok(LineItemRecord::try_from(item)?)
}

fn row_to_project(row: &SqliteRow) -> Result<Project, RepositoryError> {
    let project = ProjectRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        job_number: row.try_get("job_number")?,
        address: row.try_get("address")?,
        monthly_budget: parse_decimal("monthly_budget", row.try_get("monthly_budget")?)?,
        status: row.try_get("status")?,
    };
    Ok(Project::try_from(project)?)
}

fn row_to_cost_code(row: &SqliteRow) -> Result<CostCode, RepositoryError> {
    let cost_code = CostCodeRow {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        label: row.try_get("label")?,
        category: row.try_get("category")?,
    };
    Ok(CostCode::try_from(cost_code)?)
}

fn row_to_audit_entry(row: &SqliteRow) -> Result<AuditEntry, RepositoryError> {
    let action: String = row.try_get("action")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(AuditEntry {
        id: row.try_get("id")?,
        request_id: RequestId(row.try_get("purchase_request_id")?),
        action: action.parse::<AuditAction>()?,
        user_id: UserId(row.try_get("user_id")?),
        timestamp: parse_timestamp("audit_entry", "timestamp", &timestamp)?,
        details: row.try_get("details")?,
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use fieldpo_core::audit::AuditAction;
    use fieldpo_core::backend::{BackendError, Identity, RequestAction, RequestRepository};
    use fieldpo_core::domain::profile::{OrganizationId, UserId};
    use fieldpo_core::domain::project::{CostCodeId, ProjectId};
    use fieldpo_core::domain::request::{
        DeliveryMethod, NeedBy, PoNumber, RequestCategory, RequestId, RequestStatus, Urgency,
    };
    use fieldpo_core::errors::DomainError;
    use fieldpo_core::lifecycle::{NewLineItem, NewRequest};

    use super::SqlRequestRepository;
    use crate::{connect_with_settings, migrations, DbPool, DemoDataset};

    async fn seeded_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        DemoDataset::load(&pool).await.expect("load demo dataset");
        pool
    }

    async fn empty_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn identity(user_id: &str) -> Identity {
        Identity::new(UserId(user_id.to_owned()), "local")
    }

    fn org() -> OrganizationId {
        OrganizationId("org-even".to_owned())
    }

    fn pipe_request(project: &str) -> NewRequest {
        NewRequest {
            project_id: ProjectId(project.to_owned()),
            vendor: "Ferguson Plumbing".to_owned(),
            category: RequestCategory::Materials,
            cost_code_id: CostCodeId("cc8".to_owned()),
            line_items: vec![NewLineItem {
                name: "Pipe".to_owned(),
                quantity: Decimal::from(2),
                unit: "pcs".to_owned(),
                estimated_unit_cost: Decimal::from(20),
            }],
            estimated_total: Decimal::new(4000, 2),
            need_by: NeedBy::Tomorrow,
            urgency: Urgency::Normal,
            notes: String::new(),
            delivery_method: DeliveryMethod::Delivery,
            delivery_address: Some("1200 River Rd, Austin TX 78701".to_owned()),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn org_scoped_reads_return_seeded_rows_in_order() {
        let repo = SqlRequestRepository::new(seeded_pool().await);
        let caller = identity("u1");

        let projects = repo.list_projects(&caller, &org()).await.expect("projects");
        let names: Vec<_> = projects.iter().map(|project| project.name.as_str()).collect();
        assert_eq!(names, vec!["Cedar Park Municipal", "Oakmont Retail TI", "Riverside Office Build"]);

        let codes = repo.list_cost_codes(&caller, &org()).await.expect("cost codes");
        assert_eq!(codes.len(), 12);
        assert_eq!(codes[0].code, "01-500");

        let headers = repo.list_requests(&caller, &org()).await.expect("requests");
        assert_eq!(headers.len(), 10);
        assert!(headers.windows(2).all(|pair| pair[0].created_at >= pair[1].created_at));

        let profiles = repo.list_profiles(&caller, &org()).await.expect("profiles");
        assert_eq!(profiles.len(), 5);
    }

    #[tokio::test]
    async fn audit_log_is_served_from_the_stored_entries() {
        let repo = SqlRequestRepository::new(seeded_pool().await);

        let entries = repo.list_audit_entries(&identity("u1"), &org()).await.expect("audit log");
        assert_eq!(entries.len(), 17);
        assert_eq!(entries[0].id, "r4:submitted");
        assert!(entries.windows(2).all(|pair| pair[0].timestamp >= pair[1].timestamp));

        let purchase = entries.iter().find(|entry| entry.id == "r9:purchased").expect("r9");
        assert_eq!(purchase.user_id, UserId("u3".to_owned()));
        assert_eq!(
            purchase.details.as_deref(),
            Some("Marked purchased – $1,012.47 (receipt attached)")
        );

        let refused = repo.list_audit_entries(&identity("u6"), &org()).await;
        assert!(refused.is_err());
    }

    #[tokio::test]
    async fn reads_outside_the_callers_organization_are_refused() {
        let repo = SqlRequestRepository::new(seeded_pool().await);

        let error = repo
            .list_requests(&identity("u6"), &org())
            .await
            .expect_err("u6 has no organization");
        assert!(matches!(error, BackendError::Domain(ref domain) if domain.is_authorization()));
    }

    #[tokio::test]
    async fn create_allocates_the_next_po_number_with_items_and_audit() {
        let repo = SqlRequestRepository::new(seeded_pool().await);

        let created =
            repo.create_request(&identity("u1"), &org(), pipe_request("p1")).await.expect("create");

        assert_eq!(created.header.po_number, PoNumber(1051));
        assert_eq!(created.status(), RequestStatus::Pending);
        assert_eq!(created.line_items.len(), 1);

        let stored = repo
            .find_request(&org(), created.id())
            .await
            .expect("find")
            .expect("request persisted");
        assert_eq!(stored, created_with_millis(&created));

        let trail = repo.audit_trail(created.id()).await.expect("trail");
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::Submitted);
        assert_eq!(
            trail[0].details.as_deref(),
            Some("Purchase request PO-1051 submitted for Ferguson Plumbing")
        );

        let second =
            repo.create_request(&identity("u1"), &org(), pipe_request("p3")).await.expect("create");
        assert_eq!(second.header.po_number, PoNumber(1052));
    }

    // Stored timestamps keep millisecond precision.
    fn created_with_millis(
        request: &fieldpo_core::domain::request::PurchaseRequest,
    ) -> fieldpo_core::domain::request::PurchaseRequest {
        use fieldpo_core::schema::{format_timestamp, parse_timestamp};

        let mut expected = request.clone();
        let truncate = |value: &chrono::DateTime<chrono::Utc>| {
            parse_timestamp("test", "ts", &format_timestamp(value)).expect("timestamp")
        };
        expected.header.created_at = truncate(&request.header.created_at);
        expected.header.updated_at = truncate(&request.header.updated_at);
        expected
    }

    #[tokio::test]
    async fn first_request_in_a_new_organization_starts_at_the_seed() {
        let pool = empty_pool().await;
        sqlx::raw_sql(
            "INSERT INTO organizations (id, name, slug, created_at)
             VALUES ('org-new', 'New Co', 'new-co', '2026-03-01T00:00:00.000Z');
             INSERT INTO profiles (id, organization_id, email, full_name, onboarded, disabled, created_at)
             VALUES ('n1', 'org-new', 'n1@new.co', 'Nia', 1, 0, '2026-03-01T00:00:00.000Z');
             INSERT INTO organization_roles (organization_id, user_id, role_name)
             VALUES ('org-new', 'n1', 'member');
             INSERT INTO projects (id, organization_id, name, job_number, monthly_budget, status)
             VALUES ('np1', 'org-new', 'Shop', 'JOB-1', '1000.00', 'active');
             INSERT INTO cost_codes (id, organization_id, code, label, category)
             VALUES ('cc8', 'org-new', '15-100', 'Plumbing', 'Mechanical');",
        )
        .execute(&pool)
        .await
        .expect("insert organization");

        let repo = SqlRequestRepository::new(pool).with_po_seed(1001);
        let created = repo
            .create_request(
                &identity("n1"),
                &OrganizationId("org-new".to_owned()),
                pipe_request("np1"),
            )
            .await
            .expect("create");

        assert_eq!(created.header.po_number.to_string(), "PO-1001");
    }

    #[tokio::test]
    async fn create_without_project_access_writes_nothing() {
        let pool = seeded_pool().await;
        let repo = SqlRequestRepository::new(pool.clone());

        let error = repo
            .create_request(&identity("u1"), &org(), pipe_request("p2"))
            .await
            .expect_err("u1 has no binding on p2");
        assert!(matches!(error, BackendError::Domain(DomainError::ProjectAccessDenied(_))));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM purchase_requests")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, 10);
        let next: i64 = sqlx::query_scalar("SELECT next_value FROM po_sequences")
            .fetch_one(&pool)
            .await
            .expect("sequence");
        assert_eq!(next, 1051);
    }

    #[tokio::test]
    async fn approve_then_purchase_persists_stamps_and_audit() {
        let repo = SqlRequestRepository::new(seeded_pool().await);
        let request_id = RequestId("r1".to_owned());

        let approved = repo
            .apply_action(&identity("u3"), RequestAction::Approve { request_id: request_id.clone() })
            .await
            .expect("approve");
        assert_eq!(approved.status(), RequestStatus::Approved);

        let purchased = repo
            .apply_action(
                &identity("u4"),
                RequestAction::MarkPurchased {
                    request_id: request_id.clone(),
                    final_total: Some(Decimal::new(65_000, 2)),
                    receipt_uri: Some("file:///receipts/r1.jpg".to_owned()),
                    notes: Some("Picked up at will-call".to_owned()),
                },
            )
            .await
            .expect("purchase");
        assert_eq!(purchased.final_total(), Some(Decimal::new(65_000, 2)));

        let stored = repo.find_request(&org(), &request_id).await.expect("find").expect("present");
        assert_eq!(stored.status(), RequestStatus::Purchased);
        assert_eq!(stored.header.state.approval().map(|a| a.approved_by.0.as_str()), Some("u3"));
        assert_eq!(stored.header.receipt_attachments, vec!["file:///receipts/r1.jpg".to_owned()]);
        assert!(stored.header.notes.ends_with("Purchase notes: Picked up at will-call"));

        let actions: Vec<_> = repo
            .audit_trail(&request_id)
            .await
            .expect("trail")
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        assert_eq!(actions[0], AuditAction::Purchased);
        assert!(actions.contains(&AuditAction::Approved));
    }

    #[tokio::test]
    async fn invalid_transitions_and_missing_capabilities_change_nothing() {
        let repo = SqlRequestRepository::new(seeded_pool().await);

        let error = repo
            .apply_action(
                &identity("u3"),
                RequestAction::Approve { request_id: RequestId("r8".to_owned()) },
            )
            .await
            .expect_err("rejected requests are terminal");
        assert!(matches!(error, BackendError::Domain(DomainError::InvalidTransition { .. })));

        let error = repo
            .apply_action(
                &identity("u1"),
                RequestAction::Approve { request_id: RequestId("r1".to_owned()) },
            )
            .await
            .expect_err("field worker cannot approve");
        assert!(matches!(error, BackendError::Domain(ref domain) if domain.is_authorization()));

        let error = repo
            .apply_action(
                &identity("u3"),
                RequestAction::Reject { request_id: RequestId("r1".to_owned()), reason: "  ".to_owned() },
            )
            .await
            .expect_err("reason required");
        assert!(matches!(error, BackendError::Domain(DomainError::Validation(_))));

        let untouched = repo
            .find_request(&org(), &RequestId("r1".to_owned()))
            .await
            .expect("find")
            .expect("present");
        assert_eq!(untouched.status(), RequestStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let repo = SqlRequestRepository::new(seeded_pool().await);

        let error = repo
            .apply_action(
                &identity("u3"),
                RequestAction::Approve { request_id: RequestId("missing".to_owned()) },
            )
            .await
            .expect_err("missing");
        assert!(matches!(error, BackendError::NotFound { entity: "purchase_request", .. }));
    }

    #[tokio::test]
    async fn malformed_rows_are_rejected_at_read_time() {
        let pool = seeded_pool().await;
        sqlx::query("UPDATE purchase_requests SET approved_at = NULL WHERE id = 'r6'")
            .execute(&pool)
            .await
            .expect("corrupt row");

        let repo = SqlRequestRepository::new(pool);
        let error = repo.list_requests(&identity("u1"), &org()).await.expect_err("malformed");
        assert!(matches!(error, BackendError::Decode(_)));
    }
}
