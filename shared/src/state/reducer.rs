use std::collections::HashSet;

use super::Snapshot;
use crate::error::ValidationError;
use crate::event::Event;
use crate::model::{
    clamp_problem_index, DisplayHandle, ItemId, ProcessingStatus, SolutionSet, UploadedItem,
};
use crate::store::Collection;

/// A durable write owed to the store after a snapshot commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Mirror {
    PutItem(UploadedItem),
    DeleteItem(ItemId),
    PutSolution(SolutionSet),
    DeleteSolution(ItemId),
    PutAppState(crate::model::AppStateRecord),
}

impl Mirror {
    pub fn collection(&self) -> Collection {
        match self {
            Mirror::PutItem(_) | Mirror::DeleteItem(_) => Collection::Files,
            Mirror::PutSolution(_) | Mirror::DeleteSolution(_) => Collection::Solutions,
            Mirror::PutAppState(_) => Collection::AppState,
        }
    }

    pub fn key(&self) -> String {
        use crate::store::Record;
        match self {
            Mirror::PutItem(item) => item.key(),
            Mirror::DeleteItem(id) | Mirror::DeleteSolution(id) => id.to_string(),
            Mirror::PutSolution(set) => set.key(),
            Mirror::PutAppState(state) => state.key(),
        }
    }
}

/// Result of applying one event: the next snapshot, the writes to mirror and
/// the display handles that left memory.
#[derive(Debug, Default)]
pub struct Transition {
    pub snapshot: Snapshot,
    pub mirror: Vec<Mirror>,
    pub released: Vec<DisplayHandle>,
}

impl Transition {
    fn unchanged(prior: &Snapshot) -> Self {
        Self {
            snapshot: prior.clone(),
            ..Self::default()
        }
    }

    pub fn is_noop(&self, prior: &Snapshot) -> bool {
        self.mirror.is_empty() && self.released.is_empty() && &self.snapshot == prior
    }
}

/// Pulls the selected problem index back into range after the selected
/// solution set was swapped, persisting the corrected selection.
fn reclamp_selection(next: &mut Snapshot, mirror: &mut Vec<Mirror>) {
    let clamped = next.effective_problem_index();
    if clamped != next.selected_problem_index {
        next.selected_problem_index = clamped;
        mirror.push(Mirror::PutAppState(next.app_state()));
    }
}

fn take_handles(items: &mut [UploadedItem]) -> Vec<DisplayHandle> {
    items
        .iter_mut()
        .filter_map(|i| i.display_handle.take())
        .collect()
}

/// Computes the next state from `prior`. Never touches the host.
pub fn update(prior: &Snapshot, event: Event) -> Result<Transition, ValidationError> {
    let mut next = prior.clone();
    let mut mirror = Vec::new();
    let mut released = Vec::new();

    match event {
        Event::ItemsIngested { items } => {
            let mut seen: HashSet<ItemId> = next.items.iter().map(|i| i.id.clone()).collect();
            for mut item in items {
                if !seen.insert(item.id.clone()) {
                    // Duplicate id: keep the resident item, drop the newcomer's handle.
                    released.extend(item.display_handle.take());
                    continue;
                }
                mirror.push(Mirror::PutItem(item.clone()));
                next.items.push(item);
            }
        }

        Event::StatusChanged { id, status } => {
            let Some(pos) = next.position(&id) else {
                return Ok(Transition::unchanged(prior));
            };
            let item = &mut next.items[pos];
            item.status = status;
            if status != ProcessingStatus::Pending {
                item.streaming_text = None;
            }
            item.last_modified = crate::model::UnixTimeMs::now();
            mirror.push(Mirror::PutItem(next.items[pos].clone()));
        }

        Event::StreamingTextChanged { id, text } => {
            let Some(pos) = next.position(&id) else {
                return Ok(Transition::unchanged(prior));
            };
            next.items[pos].streaming_text = text;
            mirror.push(Mirror::PutItem(next.items[pos].clone()));
        }

        Event::ItemRemoved { id } => {
            let Some(pos) = next.position(&id) else {
                return Ok(Transition::unchanged(prior));
            };
            let mut removed = next.items.remove(pos);
            released.extend(removed.display_handle.take());
            next.solutions.remove(&id);
            mirror.push(Mirror::DeleteItem(id.clone()));
            mirror.push(Mirror::DeleteSolution(id.clone()));

            if next.selected_item.as_ref() == Some(&id) {
                next.selected_item = None;
                next.selected_problem_index = 0;
                mirror.push(Mirror::PutAppState(next.app_state()));
            }
        }

        Event::SolutionStored { solution } => {
            mirror.push(Mirror::PutSolution(solution.clone()));
            let id = solution.file_item_id.clone();
            next.solutions.insert(id.clone(), solution);
            if next.selected_item.as_ref() == Some(&id) {
                reclamp_selection(&mut next, &mut mirror);
            }
        }

        Event::ProblemAppended { item_id, problem } => {
            let set = next
                .solutions
                .entry(item_id.clone())
                .or_insert_with(|| SolutionSet::new(item_id, true, Vec::new()));
            set.problems.push(problem);
            mirror.push(Mirror::PutSolution(set.clone()));
        }

        Event::ProblemReplaced {
            item_id,
            index,
            problem,
        } => {
            let set = next
                .solutions
                .get_mut(&item_id)
                .ok_or_else(|| ValidationError::NoSolution(item_id.clone()))?;
            let len = set.problems.len();
            let slot = set
                .problems
                .get_mut(index)
                .ok_or(ValidationError::ProblemIndexOutOfRange { index, len })?;
            *slot = problem;
            mirror.push(Mirror::PutSolution(set.clone()));
        }

        Event::ItemSelected { id } => {
            if let Some(id) = &id {
                if next.item(id).is_none() {
                    return Err(ValidationError::UnknownItem(id.clone()));
                }
            }
            next.selected_item = id;
            next.selected_problem_index = 0;
            mirror.push(Mirror::PutAppState(next.app_state()));
        }

        Event::ProblemSelected { index } => {
            let len = next.selected_solution().map_or(0, |s| s.problems.len());
            next.selected_problem_index = clamp_problem_index(index, len);
            mirror.push(Mirror::PutAppState(next.app_state()));
        }

        Event::HandlesReleased => {
            released = take_handles(&mut next.items);
        }

        Event::Reset => {
            released = take_handles(&mut next.items);
            next = Snapshot::default();
        }

        Event::Loaded {
            items,
            solutions,
            app_state,
        } => {
            released = take_handles(&mut next.items);
            next = Snapshot::default();
            let mut seen = HashSet::new();
            for mut item in items {
                if seen.insert(item.id.clone()) {
                    next.items.push(item);
                } else {
                    released.extend(item.display_handle.take());
                }
            }
            for set in solutions {
                next.solutions.insert(set.file_item_id.clone(), set);
            }
            if let Some(state) = app_state {
                // A selection pointing at a missing item is dropped.
                next.selected_item = state.selected_item.filter(|id| next.item(id).is_some());
                next.selected_problem_index = if next.selected_item.is_some() {
                    state.selected_problem_index
                } else {
                    0
                };
            }
            reclamp_selection(&mut next, &mut mirror);
        }
    }

    Ok(Transition {
        snapshot: next,
        mirror,
        released,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppStateRecord, ItemOrigin, ProblemSolution};

    fn item(id: &str, handle: Option<&str>) -> UploadedItem {
        let mut item = UploadedItem::new(vec![7], "image/png", ItemOrigin::Upload, id);
        item.id = ItemId::new(id);
        item.display_handle = handle.map(DisplayHandle::new);
        item
    }

    fn problem(n: usize) -> ProblemSolution {
        ProblemSolution::new(format!("p{n}"), format!("a{n}"), "e")
    }

    fn with_items(ids: &[&str]) -> Snapshot {
        update(
            &Snapshot::default(),
            Event::ItemsIngested {
                items: ids.iter().map(|id| item(id, Some(&format!("h-{id}")))).collect(),
            },
        )
        .unwrap()
        .snapshot
    }

    #[test]
    fn ingest_emits_one_put_per_item() {
        let t = update(
            &Snapshot::default(),
            Event::ItemsIngested {
                items: vec![item("a", Some("ha")), item("b", Some("hb"))],
            },
        )
        .unwrap();
        assert_eq!(t.snapshot.items.len(), 2);
        assert_eq!(t.mirror.len(), 2);
        assert!(t.released.is_empty());
    }

    #[test]
    fn duplicate_ingest_releases_newcomer_handle() {
        let prior = with_items(&["a"]);
        let t = update(
            &prior,
            Event::ItemsIngested {
                items: vec![item("a", Some("dup"))],
            },
        )
        .unwrap();
        assert_eq!(t.snapshot.items.len(), 1);
        assert_eq!(t.released, vec![DisplayHandle::new("dup")]);
        assert!(t.mirror.is_empty());
    }

    #[test]
    fn settled_status_clears_streaming_text() {
        let prior = with_items(&["a"]);
        let prior = update(
            &prior,
            Event::StreamingTextChanged {
                id: ItemId::new("a"),
                text: Some("thinking".into()),
            },
        )
        .unwrap()
        .snapshot;
        let t = update(
            &prior,
            Event::StatusChanged {
                id: ItemId::new("a"),
                status: ProcessingStatus::Success,
            },
        )
        .unwrap();
        let stored = match &t.mirror[..] {
            [Mirror::PutItem(item)] => item,
            other => panic!("unexpected mirror {other:?}"),
        };
        assert_eq!(stored.status, ProcessingStatus::Success);
        assert!(stored.streaming_text.is_none());
        assert_eq!(Some(stored), t.snapshot.item(&ItemId::new("a")));
    }

    #[test]
    fn remove_cascades_and_clears_selection() {
        let mut prior = with_items(&["a", "b"]);
        prior
            .solutions
            .insert(ItemId::new("a"), SolutionSet::new(ItemId::new("a"), true, vec![problem(0)]));
        prior.selected_item = Some(ItemId::new("a"));

        let t = update(&prior, Event::ItemRemoved { id: ItemId::new("a") }).unwrap();
        assert_eq!(t.released, vec![DisplayHandle::new("h-a")]);
        assert!(t.snapshot.solutions.is_empty());
        assert!(t.snapshot.selected_item.is_none());
        assert_eq!(
            t.mirror,
            vec![
                Mirror::DeleteItem(ItemId::new("a")),
                Mirror::DeleteSolution(ItemId::new("a")),
                Mirror::PutAppState(AppStateRecord::default()),
            ]
        );

        let again = update(&t.snapshot, Event::ItemRemoved { id: ItemId::new("a") }).unwrap();
        assert!(again.is_noop(&t.snapshot));
    }

    #[test]
    fn replace_checks_range() {
        let mut prior = with_items(&["a"]);
        prior
            .solutions
            .insert(ItemId::new("a"), SolutionSet::new(ItemId::new("a"), true, vec![problem(0)]));

        let err = update(
            &prior,
            Event::ProblemReplaced {
                item_id: ItemId::new("a"),
                index: 1,
                problem: problem(9),
            },
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::ProblemIndexOutOfRange { index: 1, len: 1 });

        let err = update(
            &prior,
            Event::ProblemReplaced {
                item_id: ItemId::new("zzz"),
                index: 0,
                problem: problem(9),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::NoSolution(_)));

        let t = update(
            &prior,
            Event::ProblemReplaced {
                item_id: ItemId::new("a"),
                index: 0,
                problem: problem(9),
            },
        )
        .unwrap();
        assert_eq!(t.snapshot.solutions[&ItemId::new("a")].problems[0], problem(9));
    }

    #[test]
    fn selection_resets_and_clamps_problem_index() {
        let mut prior = with_items(&["a"]);
        prior.solutions.insert(
            ItemId::new("a"),
            SolutionSet::new(ItemId::new("a"), true, (0..3).map(problem).collect()),
        );
        prior.selected_problem_index = 2;

        let t = update(&prior, Event::ItemSelected { id: Some(ItemId::new("a")) }).unwrap();
        assert_eq!(t.snapshot.selected_problem_index, 0);

        let t = update(&t.snapshot, Event::ProblemSelected { index: 10 }).unwrap();
        assert_eq!(t.snapshot.selected_problem_index, 2);
        let t = update(&t.snapshot, Event::ProblemSelected { index: -4 }).unwrap();
        assert_eq!(t.snapshot.selected_problem_index, 0);

        let err = update(&prior, Event::ItemSelected { id: Some(ItemId::new("nope")) }).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownItem(_)));
    }

    #[test]
    fn shrinking_selected_solution_reclamps_index() {
        let mut prior = with_items(&["a"]);
        prior.solutions.insert(
            ItemId::new("a"),
            SolutionSet::new(ItemId::new("a"), true, (0..3).map(problem).collect()),
        );
        prior.selected_item = Some(ItemId::new("a"));
        prior.selected_problem_index = 2;

        let t = update(
            &prior,
            Event::SolutionStored {
                solution: SolutionSet::new(ItemId::new("a"), true, vec![problem(0)]),
            },
        )
        .unwrap();
        assert_eq!(t.snapshot.selected_problem_index, 0);
        assert_eq!(
            t.mirror.last(),
            Some(&Mirror::PutAppState(AppStateRecord {
                selected_item: Some(ItemId::new("a")),
                selected_problem_index: 0,
            }))
        );

        // Growing the set leaves the selection alone.
        let t = update(
            &prior,
            Event::SolutionStored {
                solution: SolutionSet::new(ItemId::new("a"), true, (0..5).map(problem).collect()),
            },
        )
        .unwrap();
        assert_eq!(t.snapshot.selected_problem_index, 2);
        assert_eq!(t.mirror.len(), 1);
    }

    #[test]
    fn load_clamps_restored_problem_index() {
        let t = update(
            &Snapshot::default(),
            Event::Loaded {
                items: vec![item("a", Some("h"))],
                solutions: vec![SolutionSet::new(ItemId::new("a"), true, vec![problem(0), problem(1)])],
                app_state: Some(AppStateRecord {
                    selected_item: Some(ItemId::new("a")),
                    selected_problem_index: 7,
                }),
            },
        )
        .unwrap();
        assert_eq!(t.snapshot.selected_problem_index, 1);
        assert_eq!(
            t.mirror,
            vec![Mirror::PutAppState(AppStateRecord {
                selected_item: Some(ItemId::new("a")),
                selected_problem_index: 1,
            })]
        );
    }

    #[test]
    fn reset_releases_every_handle_once() {
        let prior = with_items(&["a", "b", "c"]);
        let stripped = update(&prior, Event::HandlesReleased).unwrap();
        assert_eq!(stripped.released.len(), 3);
        assert_eq!(stripped.snapshot.items.len(), 3);

        let reset = update(&stripped.snapshot, Event::Reset).unwrap();
        assert!(reset.released.is_empty());
        assert_eq!(reset.snapshot, Snapshot::default());
    }

    #[test]
    fn load_drops_dangling_selection() {
        let t = update(
            &Snapshot::default(),
            Event::Loaded {
                items: vec![item("a", Some("h"))],
                solutions: vec![SolutionSet::failed(ItemId::new("orphan"))],
                app_state: Some(AppStateRecord {
                    selected_item: Some(ItemId::new("missing")),
                    selected_problem_index: 3,
                }),
            },
        )
        .unwrap();
        assert_eq!(t.snapshot.items.len(), 1);
        assert!(t.snapshot.selected_item.is_none());
        assert_eq!(t.snapshot.selected_problem_index, 0);
        assert!(t.snapshot.visible_solution(&ItemId::new("orphan")).is_none());
        assert!(t.mirror.is_empty());
    }
}
