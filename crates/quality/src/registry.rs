//! Validation criteria registry.

use conductor_core::{CriteriaId, TaskCategory};
use std::collections::{BTreeMap, HashMap};

use crate::criteria::{CriteriaCategory, ValidationCriteria};

/// Criteria keyed by id, indexed by category.
#[derive(Debug, Default)]
pub struct CriteriaRegistry {
    criteria: BTreeMap<CriteriaId, ValidationCriteria>,
    by_category: HashMap<CriteriaCategory, Vec<CriteriaId>>,
}

impl CriteriaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a criterion. Returns the one it replaced.
    pub fn register(&mut self, criteria: ValidationCriteria) -> Option<ValidationCriteria> {
        let id = criteria.id.clone();
        let previous = self.unregister(&id);
        self.by_category
            .entry(criteria.category)
            .or_default()
            .push(id.clone());
        self.criteria.insert(id, criteria);
        previous
    }

    /// Remove a criterion.
    pub fn unregister(&mut self, id: &CriteriaId) -> Option<ValidationCriteria> {
        let criteria = self.criteria.remove(id)?;
        if let Some(ids) = self.by_category.get_mut(&criteria.category) {
            ids.retain(|x| x != id);
        }
        Some(criteria)
    }

    /// Get a criterion by id.
    pub fn get(&self, id: &CriteriaId) -> Option<&ValidationCriteria> {
        self.criteria.get(id)
    }

    /// All criteria, ordered by id.
    pub fn list(&self) -> Vec<&ValidationCriteria> {
        self.criteria.values().collect()
    }

    /// Number of registered criteria.
    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Criteria in one category, in registration order.
    pub fn find_by_category(&self, category: CriteriaCategory) -> Vec<&ValidationCriteria> {
        self.by_category
            .get(&category)
            .into_iter()
            .flat_map(|ids| ids.iter().filter_map(|id| self.criteria.get(id)))
            .collect()
    }

    /// Criteria that apply to a task category, ordered by id.
    pub fn applicable(&self, category: TaskCategory) -> Vec<ValidationCriteria> {
        let mut found: Vec<ValidationCriteria> = CriteriaCategory::for_task(category)
            .iter()
            .flat_map(|c| self.find_by_category(*c))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }
}
