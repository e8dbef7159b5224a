//! Trusted caller context forwarded by the upstream gateway.
//!
//! The gateway authenticates the caller; this service only reads the
//! headers it sets.

use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};

use crate::{error::AppError, models::tenant::TenantScope, utils::pii::PiiPolicy};

pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone)]
pub struct GatewayContext {
    pub tenant: TenantScope,
    pub user_id: Option<String>,
    pub role: Option<String>,
}

impl GatewayContext {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AppError> {
        let tenant = header_value(headers, TENANT_ID_HEADER)
            .ok_or(AppError::TenantScopeRequired)
            .and_then(|raw| TenantScope::new(&raw).map_err(|_| AppError::TenantScopeRequired))?;
        Ok(Self {
            tenant,
            user_id: header_value(headers, USER_ID_HEADER),
            role: header_value(headers, USER_ROLE_HEADER),
        })
    }

    pub fn pii_policy(&self) -> PiiPolicy {
        PiiPolicy::for_role(self.role.as_deref())
    }
}

/// Rejects requests without a tenant scope and stores the context as a
/// request extension.
pub async fn gateway_context(mut req: Request, next: Next) -> Result<Response, AppError> {
    let context = GatewayContext::from_headers(req.headers())?;
    tracing::debug!(
        tenant_id = %context.tenant,
        user_id = context.user_id.as_deref(),
        role = context.role.as_deref(),
        "Gateway context attached"
    );
    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
