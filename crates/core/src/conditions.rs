//! Condition tracker: at most one condition per type, last writer wins, and
//! `last_transition_time` only moves when `status` changes.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionType {
    Ready,
    Progressing,
    Degraded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(b: bool) -> Self { if b { ConditionStatus::True } else { ConditionStatus::False } }
}

/// Fixed set of reasons written by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Reconciling,
    Reconciled,
    ReconcileError,
    ValidationFailed,
    Finalizing,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Reconciling => "Reconciling",
            Reason::Reconciled => "Reconciled",
            Reason::ReconcileError => "ReconcileError",
            Reason::ValidationFailed => "ValidationFailed",
            Reason::Finalizing => "Finalizing",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Ordered condition set, kept sorted by type.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(transparent)]
pub struct ConditionSet(SmallVec<[Condition; 3]>);

/// Statuses written by other clients may repeat a type or come unsorted; read them back
/// into the one-per-type shape.
impl<'de> Deserialize<'de> for ConditionSet {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(Vec::<Condition>::deserialize(d)?.into_iter().collect())
    }
}

/// Later entries of a type replace earlier ones.
impl FromIterator<Condition> for ConditionSet {
    fn from_iter<I: IntoIterator<Item = Condition>>(iter: I) -> Self {
        let mut set = ConditionSet::default();
        for c in iter {
            set.insert(c);
        }
        set
    }
}

impl ConditionSet {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn iter(&self) -> impl Iterator<Item = &Condition> { self.0.iter() }

    pub fn get(&self, ty: ConditionType) -> Option<&Condition> { self.0.iter().find(|c| c.type_ == ty) }

    pub fn status(&self, ty: ConditionType) -> Option<ConditionStatus> { self.get(ty).map(|c| c.status) }

    pub fn is_true(&self, ty: ConditionType) -> bool { self.status(ty) == Some(ConditionStatus::True) }

    /// Absence of a `Ready` condition means not ready.
    pub fn is_ready(&self) -> bool { self.is_true(ConditionType::Ready) }

    /// Write one condition. Returns true when anything observable changed.
    pub fn set(
        &mut self,
        ty: ConditionType,
        status: ConditionStatus,
        reason: Reason,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(existing) = self.0.iter_mut().find(|c| c.type_ == ty) {
            let mut changed = false;
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = now;
                changed = true;
            }
            if existing.reason != reason.as_str() {
                existing.reason = reason.as_str().to_string();
                changed = true;
            }
            if existing.message != message {
                existing.message = message.to_string();
                changed = true;
            }
            return changed;
        }
        let pos = self.0.iter().position(|c| c.type_ > ty).unwrap_or(self.0.len());
        self.0.insert(
            pos,
            Condition {
                type_: ty,
                status,
                reason: reason.as_str().to_string(),
                message: message.to_string(),
                last_transition_time: now,
            },
        );
        true
    }

    /// Write several conditions sharing one reason and message.
    pub fn set_conditions(
        &mut self,
        desired: &[(ConditionType, ConditionStatus)],
        reason: Reason,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let mut changed = false;
        for (ty, status) in desired {
            changed |= self.set(*ty, *status, reason, message, now);
        }
        changed
    }

    fn insert(&mut self, c: Condition) {
        match self.0.iter_mut().find(|e| e.type_ == c.type_) {
            Some(existing) => *existing = c,
            None => {
                let pos = self.0.iter().position(|e| e.type_ > c.type_).unwrap_or(self.0.len());
                self.0.insert(pos, c);
            }
        }
    }

    pub fn remove(&mut self, ty: ConditionType) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.type_ != ty);
        before != self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> { Utc.timestamp_opt(secs, 0).unwrap() }

    #[test]
    fn absent_ready_is_not_ready() {
        let mut cs = ConditionSet::new();
        assert!(!cs.is_ready());
        cs.set(ConditionType::Progressing, ConditionStatus::True, Reason::Reconciling, "", t(1));
        assert!(!cs.is_ready());
        cs.set(ConditionType::Ready, ConditionStatus::Unknown, Reason::Reconciling, "", t(1));
        assert!(!cs.is_ready());
        cs.set(ConditionType::Ready, ConditionStatus::True, Reason::Reconciled, "", t(2));
        assert!(cs.is_ready());
    }

    #[test]
    fn same_status_keeps_transition_time() {
        let mut cs = ConditionSet::new();
        let desired = [(ConditionType::Ready, ConditionStatus::False)];
        assert!(cs.set_conditions(&desired, Reason::ReconcileError, "Header \"a\" not found", t(10)));
        assert!(!cs.set_conditions(&desired, Reason::ReconcileError, "Header \"a\" not found", t(20)));
        assert_eq!(cs.get(ConditionType::Ready).unwrap().last_transition_time, t(10));

        // message-only change is recorded but is not a transition
        assert!(cs.set_conditions(&desired, Reason::ReconcileError, "Header \"b\" not found", t(30)));
        let c = cs.get(ConditionType::Ready).unwrap();
        assert_eq!(c.last_transition_time, t(10));
        assert_eq!(c.message, "Header \"b\" not found");

        assert!(cs.set(ConditionType::Ready, ConditionStatus::True, Reason::Reconciled, "", t(40)));
        assert_eq!(cs.get(ConditionType::Ready).unwrap().last_transition_time, t(40));
    }

    #[test]
    fn one_condition_per_type_in_stable_order() {
        let mut cs = ConditionSet::new();
        cs.set(ConditionType::Degraded, ConditionStatus::False, Reason::Reconciling, "", t(1));
        cs.set(ConditionType::Ready, ConditionStatus::False, Reason::Reconciling, "", t(1));
        cs.set(ConditionType::Ready, ConditionStatus::True, Reason::Reconciled, "", t(2));
        cs.set(ConditionType::Progressing, ConditionStatus::False, Reason::Reconciled, "", t(2));
        let types: Vec<_> = cs.iter().map(|c| c.type_).collect();
        assert_eq!(types, vec![ConditionType::Ready, ConditionType::Progressing, ConditionType::Degraded]);
    }

    #[test]
    fn serializes_like_kubernetes_conditions() {
        let mut cs = ConditionSet::new();
        cs.set(ConditionType::Ready, ConditionStatus::True, Reason::Reconciled, "ok", t(0));
        let v = serde_json::to_value(&cs).unwrap();
        assert_eq!(v[0]["type"], "Ready");
        assert_eq!(v[0]["status"], "True");
        assert_eq!(v[0]["reason"], "Reconciled");
        assert_eq!(v[0]["lastTransitionTime"], "1970-01-01T00:00:00Z");
        let back: ConditionSet = serde_json::from_value(v).unwrap();
        assert_eq!(back, cs);
    }

    #[test]
    fn reading_a_status_keeps_one_condition_per_type() {
        let cs: ConditionSet = serde_json::from_value(serde_json::json!([
            {"type": "Degraded", "status": "False", "lastTransitionTime": "2024-05-01T10:00:00Z"},
            {"type": "Ready", "status": "False", "reason": "ReconcileError", "lastTransitionTime": "2024-05-01T10:00:00Z"},
            {"type": "Ready", "status": "True", "reason": "Reconciled", "lastTransitionTime": "2024-05-01T11:00:00Z"}
        ]))
        .unwrap();
        assert_eq!(cs.len(), 2);
        let types: Vec<ConditionType> = cs.iter().map(|c| c.type_).collect();
        assert_eq!(types, vec![ConditionType::Ready, ConditionType::Degraded]);
        assert!(cs.is_ready());
        assert_eq!(cs.get(ConditionType::Ready).unwrap().reason, "Reconciled");
    }
}
