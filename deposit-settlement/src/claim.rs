// Copyright (c) 2024 Botho Foundation

//! Per-attempt in-progress registry.

use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard},
};

use crate::model::AttemptId;

/// Set of attempt ids with an operation in flight.
#[derive(Debug, Default)]
pub struct ClaimSet {
    ids: Mutex<HashSet<AttemptId>>,
}

/// Releases its id when dropped, whatever the operation's outcome.
#[derive(Debug)]
pub struct Claim<'a> {
    set: &'a ClaimSet,
    id: AttemptId,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`, or `None` if someone else holds it.
    pub fn claim(&self, id: &AttemptId) -> Option<Claim<'_>> {
        if !self.lock().insert(id.clone()) {
            return None;
        }
        Some(Claim {
            set: self,
            id: id.clone(),
        })
    }

    pub fn contains(&self, id: &AttemptId) -> bool {
        self.lock().contains(id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<AttemptId>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}
