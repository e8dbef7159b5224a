//! Shared repository utilities.

use sqlx::{Postgres, QueryBuilder};

use crate::{models::tenant::TenantScope, models::Page};

pub const AUDIT_EVENT_COLUMNS: &str = "id, tenant_id, event_timestamp, actor_type, actor_id, \
     actor_email_enc, action, resource_type, resource_id, before_value_enc, after_value_enc, \
     metadata, source_event_id, inserted_at";

pub const CONSENT_RECORD_COLUMNS: &str = "id, tenant_id, subject_type, subject_id, purpose_code, \
     granted, policy_version, consent_method, revoked_at, last_event_id, last_event_at, \
     created_at, updated_at";

/// Appends WHERE or AND to the query builder depending on whether a clause has already been added.
pub fn push_clause(builder: &mut QueryBuilder<'_, Postgres>, has_clause: &mut bool) {
    if *has_clause {
        builder.push(" AND ");
    } else {
        builder.push(" WHERE ");
        *has_clause = true;
    }
}

/// Every ledger query starts with the tenant predicate.
pub fn push_tenant_scope(
    builder: &mut QueryBuilder<'_, Postgres>,
    has_clause: &mut bool,
    tenant: &TenantScope,
) {
    push_clause(builder, has_clause);
    builder
        .push("tenant_id = ")
        .push_bind(tenant.as_str().to_string());
}

pub fn push_page(builder: &mut QueryBuilder<'_, Postgres>, page: Page) {
    builder
        .push(" LIMIT ")
        .push_bind(page.per_page)
        .push(" OFFSET ")
        .push_bind(page.offset());
}

/// SQLSTATEs a concurrent CREATE ... IF NOT EXISTS can still raise.
pub fn is_duplicate_object(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("42P07") | Some("23505")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_scope_comes_first() {
        let tenant = TenantScope::new("acme").expect("tenant");
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT 1 FROM audit_events");
        let mut has_clause = false;
        push_tenant_scope(&mut builder, &mut has_clause, &tenant);
        push_clause(&mut builder, &mut has_clause);
        builder.push("actor_id = ").push_bind("u-1");
        push_page(&mut builder, Page::new(Some(2), Some(10)));
        assert_eq!(
            builder.sql(),
            "SELECT 1 FROM audit_events WHERE tenant_id = $1 AND actor_id = $2 LIMIT $3 OFFSET $4"
        );
    }
}
