use std::sync::Arc;

use crate::{
    config::Config,
    repositories::ConsentRepositoryTrait,
    services::{AuditQueryService, ConsentLedger},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub query: AuditQueryService,
    pub consent: Arc<ConsentLedger>,
}

impl AppState {
    pub fn new(config: Arc<Config>, query: AuditQueryService, consent: Arc<ConsentLedger>) -> Self {
        Self {
            config,
            query,
            consent,
        }
    }

    /// Reference data (purposes, policies) lives behind the consent ledger.
    pub fn consent_repository(&self) -> &Arc<dyn ConsentRepositoryTrait> {
        self.consent.repository()
    }
}
