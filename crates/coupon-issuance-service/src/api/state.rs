//! 应用状态

use std::sync::Arc;

use super::auth::JwtVerifier;
use crate::repository::IssuanceStore;
use crate::service::{AdmissionGate, CancellationService};

/// Axum 共享状态
pub struct AppState<S>
where
    S: IssuanceStore,
{
    pub gate: Arc<AdmissionGate>,
    pub cancellation: Arc<CancellationService<S>>,
    pub verifier: Arc<JwtVerifier>,
}

impl<S> AppState<S>
where
    S: IssuanceStore,
{
    pub fn new(
        gate: Arc<AdmissionGate>,
        cancellation: Arc<CancellationService<S>>,
        verifier: Arc<JwtVerifier>,
    ) -> Self {
        Self {
            gate,
            cancellation,
            verifier,
        }
    }
}

// derive(Clone) 会给 S 加上 Clone 约束
impl<S> Clone for AppState<S>
where
    S: IssuanceStore,
{
    fn clone(&self) -> Self {
        Self {
            gate: Arc::clone(&self.gate),
            cancellation: Arc::clone(&self.cancellation),
            verifier: Arc::clone(&self.verifier),
        }
    }
}
