//! In-flight reconciliation guard.
//!
//! Acquired with the object as read at cycle start and released by [`InFlight::finish`],
//! which decides the final status write for every way a cycle can end.

use chrono::Utc;
use tracing::{debug, warn};
use trellis_api::ObjectAccessor;
use trellis_core::{
    Action, ConditionStatus, ConditionType, EngineError, EngineResult, Object, ObjectKey, Reason, Status,
};

pub struct InFlight {
    object: Object,
    original: Status,
    detached: bool,
    finished: bool,
}

impl InFlight {
    pub fn begin(object: Object) -> Self {
        let original = object.status.clone();
        Self { object, original, detached: false, finished: false }
    }

    pub fn object(&self) -> &Object { &self.object }
    pub fn object_mut(&mut self) -> &mut Object { &mut self.object }
    pub fn key(&self) -> ObjectKey { self.object.key() }

    /// Take metadata from a successful `update` so the status write carries the new version.
    pub fn adopt(&mut self, updated: &Object) {
        self.object.resource_version = updated.resource_version.clone();
        self.object.generation = updated.generation;
        self.object.finalizers = updated.finalizers.clone();
        self.object.labels = updated.labels.clone();
    }

    /// The object is gone (finalized); there is no status left to write.
    pub fn detach(&mut self) { self.detached = true; }

    pub fn status_changed(&self) -> bool { self.object.status != self.original }

    /// Release the guard. Surfaced outcomes are written to status when they changed it;
    /// conflicts, transient errors and cancellation discard in-cycle status changes.
    pub async fn finish(mut self, accessor: &dyn ObjectAccessor, result: EngineResult<Action>) -> EngineResult<Action> {
        self.finished = true;
        let now = Utc::now();
        let generation = self.object.generation;
        let outcome = match result {
            Ok(action) => Ok(action),
            Err(EngineError::Validation(msg)) => {
                self.object.status.conditions.set_conditions(
                    &[
                        (ConditionType::Ready, ConditionStatus::False),
                        (ConditionType::Progressing, ConditionStatus::False),
                        (ConditionType::Degraded, ConditionStatus::True),
                    ],
                    Reason::ValidationFailed,
                    &msg,
                    now,
                );
                self.object.status.observed_generation = Some(generation);
                Err(EngineError::Validation(msg))
            }
            Err(EngineError::Panicked(msg)) => {
                self.object.status.conditions.set(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    Reason::ReconcileError,
                    "internal error during reconciliation",
                    now,
                );
                Err(EngineError::Panicked(msg))
            }
            Err(e) => {
                debug!(key = %self.object.key(), error = %e, "cycle aborted; status left untouched");
                return Err(e);
            }
        };
        if self.detached || !self.status_changed() {
            return outcome;
        }
        accessor.update_status(&self.object).await.map_err(EngineError::from)?;
        outcome
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished {
            warn!(key = %self.object.key(), "in-flight reconciliation dropped before its status was settled");
        }
    }
}
