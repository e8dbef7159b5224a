//! Data models shared across database access and API handlers.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod audit_event;
pub mod consent;
pub mod partition;
pub mod tenant;

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PER_PAGE: i64 = 25;
pub const MAX_PER_PAGE: i64 = 100;
pub const MAX_PAGE: i64 = 1_000;

/// A validated page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub per_page: i64,
}

impl Page {
    pub fn new(page: Option<i64>, per_page: Option<i64>) -> Self {
        Self {
            page: page.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE),
            per_page: per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Wrapper for paginated API responses.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PageResponse<T> {
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub items: Vec<T>,
}

impl<T> PageResponse<T> {
    pub fn new(page: Page, total: i64, items: Vec<T>) -> Self {
        Self {
            page: page.page,
            per_page: page.per_page,
            total,
            items,
        }
    }
}
