use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutineStatus {
    Running,
    HasErrors,
    Stopped,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoutineState {
    pub routine: String,
    pub status: RoutineStatus,
    pub last_execution: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// key: telemetry-routines -> health of background billing routines
#[derive(Clone, Default)]
pub struct RoutineRegistry {
    entries: Arc<DashMap<String, RoutineState>>,
}

impl RoutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self, routine: &str) {
        self.entries.insert(
            routine.to_string(),
            RoutineState {
                routine: routine.to_string(),
                status: RoutineStatus::Running,
                last_execution: None,
                error: None,
            },
        );
    }

    pub fn succeeded(&self, routine: &str, at: DateTime<Utc>) {
        self.update(routine, |state| {
            state.status = RoutineStatus::Running;
            state.last_execution = Some(at);
            state.error = None;
        });
    }

    pub fn failed(&self, routine: &str, at: DateTime<Utc>, error: impl Into<String>) {
        let error = error.into();
        self.update(routine, |state| {
            state.status = RoutineStatus::HasErrors;
            state.last_execution = Some(at);
            state.error = Some(error);
        });
    }

    pub fn stopped(&self, routine: &str) {
        self.update(routine, |state| state.status = RoutineStatus::Stopped);
    }

    pub fn get(&self, routine: &str) -> Option<RoutineState> {
        self.entries.get(routine).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<RoutineState> {
        let mut states: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        states.sort_by(|a, b| a.routine.cmp(&b.routine));
        states
    }

    fn update(&self, routine: &str, apply: impl FnOnce(&mut RoutineState)) {
        let mut entry = self
            .entries
            .entry(routine.to_string())
            .or_insert_with(|| RoutineState {
                routine: routine.to_string(),
                status: RoutineStatus::Running,
                last_execution: None,
                error: None,
            });
        apply(entry.value_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_is_cleared_by_next_success() {
        let registry = RoutineRegistry::new();
        let now = Utc::now();
        registry.started("ledger");
        registry.failed("ledger", now, "store unavailable");
        assert_eq!(
            registry.get("ledger").map(|state| state.status),
            Some(RoutineStatus::HasErrors)
        );

        registry.succeeded("ledger", now);
        let state = registry.get("ledger").unwrap();
        assert_eq!(state.status, RoutineStatus::Running);
        assert!(state.error.is_none());

        registry.stopped("ledger");
        assert_eq!(registry.snapshot()[0].status, RoutineStatus::Stopped);
    }
}
