use std::collections::BTreeMap;

use crate::model::{clamp_problem_index, AppStateRecord, ItemId, SolutionSet, UploadedItem};

/// The in-memory truth for the running session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub items: Vec<UploadedItem>,
    /// Keyed by item id. May hold sets whose item is gone.
    pub solutions: BTreeMap<ItemId, SolutionSet>,
    pub selected_item: Option<ItemId>,
    pub selected_problem_index: usize,
}

impl Snapshot {
    pub fn item(&self, id: &ItemId) -> Option<&UploadedItem> {
        self.items.iter().find(|i| &i.id == id)
    }

    pub(crate) fn position(&self, id: &ItemId) -> Option<usize> {
        self.items.iter().position(|i| &i.id == id)
    }

    /// The solution set for an item, hidden when the item no longer exists.
    pub fn visible_solution(&self, id: &ItemId) -> Option<&SolutionSet> {
        self.item(id)?;
        self.solutions.get(id)
    }

    pub fn selected_solution(&self) -> Option<&SolutionSet> {
        self.visible_solution(self.selected_item.as_ref()?)
    }

    /// The stored index clamped against the problems currently shown.
    pub fn effective_problem_index(&self) -> usize {
        let len = self.selected_solution().map_or(0, |s| s.problems.len());
        clamp_problem_index(
            i64::try_from(self.selected_problem_index).unwrap_or(i64::MAX),
            len,
        )
    }

    pub fn app_state(&self) -> AppStateRecord {
        AppStateRecord {
            selected_item: self.selected_item.clone(),
            selected_problem_index: self.selected_problem_index,
        }
    }
}
