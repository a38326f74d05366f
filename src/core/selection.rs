use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::core::cleanup::CleanupObserver;

/// Anything the user can mark for deletion: media assets, contacts.
pub trait Selectable {
    type Id: Clone + Ord + Hash + Display;

    fn id(&self) -> Self::Id;

    fn is_protected(&self) -> bool;

    fn byte_size(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("{id} is protected and cannot be selected")]
    ProtectedAsset { id: String },

    #[error("{id} is not a known item")]
    UnknownItem { id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectionSummary {
    pub total_selected: usize,
    pub total_bytes_reclaimable: u64,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    protected: bool,
    byte_size: u64,
}

struct SelectionState<Id> {
    items: HashMap<Id, Tracked>,
    selected: BTreeSet<Id>,
}

/// Tracks which items are marked for deletion.
///
/// All state sits behind one mutex: a toggle followed by a read always sees
/// its own write, and `forget` removes the item from the known set so a
/// racing toggle can never bring a deleted id back.
pub struct SelectionManager<Id> {
    state: Mutex<SelectionState<Id>>,
}

impl<Id> SelectionManager<Id>
where
    Id: Clone + Ord + Hash + Display,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SelectionState {
                items: HashMap::new(),
                selected: BTreeSet::new(),
            }),
        }
    }

    /// Registers or refreshes an item. An item that became protected is
    /// dropped from the selection.
    pub fn track<I: Selectable<Id = Id>>(&self, item: &I) {
        let id = item.id();
        let tracked = Tracked {
            protected: item.is_protected(),
            byte_size: item.byte_size(),
        };

        let mut state = self.lock();
        if tracked.protected {
            state.selected.remove(&id);
        }
        state.items.insert(id, tracked);
    }

    /// Drops items that no longer exist. Returns how many were selected.
    pub fn forget<'a, It>(&self, ids: It) -> usize
    where
        It: IntoIterator<Item = &'a Id>,
        Id: 'a,
    {
        let mut state = self.lock();
        let mut deselected = 0;
        for id in ids {
            state.items.remove(id);
            if state.selected.remove(id) {
                deselected += 1;
            }
        }
        deselected
    }

    /// Flips the mark on `id` and returns the new state. Protected items are
    /// reported as an error and left untouched.
    pub fn toggle(&self, id: &Id) -> Result<bool, SelectionError> {
        let mut state = self.lock();
        let tracked = Self::selectable(&state, id)?;
        if tracked.protected {
            return Err(SelectionError::ProtectedAsset { id: id.to_string() });
        }

        if state.selected.remove(id) {
            Ok(false)
        } else {
            state.selected.insert(id.clone());
            Ok(true)
        }
    }

    pub fn select(&self, id: &Id) -> Result<(), SelectionError> {
        let mut state = self.lock();
        let tracked = Self::selectable(&state, id)?;
        if tracked.protected {
            return Err(SelectionError::ProtectedAsset { id: id.to_string() });
        }
        state.selected.insert(id.clone());
        Ok(())
    }

    pub fn deselect(&self, id: &Id) -> bool {
        self.lock().selected.remove(id)
    }

    /// Marks every known, non-protected id in `ids`. Returns how many were
    /// newly selected.
    pub fn select_all_in<'a, It>(&self, ids: It) -> usize
    where
        It: IntoIterator<Item = &'a Id>,
        Id: 'a,
    {
        let mut state = self.lock();
        let mut added = 0;
        for id in ids {
            let eligible = state.items.get(id).is_some_and(|t| !t.protected);
            if eligible && state.selected.insert(id.clone()) {
                added += 1;
            }
        }
        added
    }

    pub fn deselect_all_in<'a, It>(&self, ids: It) -> usize
    where
        It: IntoIterator<Item = &'a Id>,
        Id: 'a,
    {
        let mut state = self.lock();
        ids.into_iter()
            .filter(|id| state.selected.remove(*id))
            .count()
    }

    pub fn is_selected(&self, id: &Id) -> bool {
        self.lock().selected.contains(id)
    }

    pub fn selected_ids(&self) -> BTreeSet<Id> {
        self.lock().selected.clone()
    }

    pub fn summary(&self) -> SelectionSummary {
        let state = self.lock();
        SelectionSummary {
            total_selected: state.selected.len(),
            total_bytes_reclaimable: state
                .selected
                .iter()
                .filter_map(|id| state.items.get(id))
                .map(|t| t.byte_size)
                .sum(),
        }
    }

    pub fn clear(&self) {
        self.lock().selected.clear();
    }

    fn selectable(state: &SelectionState<Id>, id: &Id) -> Result<Tracked, SelectionError> {
        state
            .items
            .get(id)
            .copied()
            .ok_or_else(|| SelectionError::UnknownItem { id: id.to_string() })
    }

    fn lock(&self) -> MutexGuard<'_, SelectionState<Id>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<Id> Default for SelectionManager<Id>
where
    Id: Clone + Ord + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> CleanupObserver<Id> for SelectionManager<Id>
where
    Id: Clone + Ord + Hash + Display + Send,
{
    fn items_deleted(&self, ids: &[Id]) {
        self.forget(ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    struct Item {
        id: u32,
        protected: bool,
        size: u64,
    }

    impl Selectable for Item {
        type Id = u32;

        fn id(&self) -> u32 {
            self.id
        }

        fn is_protected(&self) -> bool {
            self.protected
        }

        fn byte_size(&self) -> u64 {
            self.size
        }
    }

    fn item(id: u32, protected: bool) -> Item {
        Item {
            id,
            protected,
            size: 100,
        }
    }

    #[test]
    fn test_toggle_observes_own_write() {
        let manager = SelectionManager::new();
        manager.track(&item(1, false));

        assert_eq!(manager.toggle(&1), Ok(true));
        assert!(manager.is_selected(&1));
        assert_eq!(manager.toggle(&1), Ok(false));
        assert!(!manager.is_selected(&1));
    }

    #[test]
    fn test_protected_toggle_is_an_error_without_state_change() {
        let manager = SelectionManager::new();
        manager.track(&item(1, true));

        assert_eq!(
            manager.toggle(&1),
            Err(SelectionError::ProtectedAsset { id: "1".to_string() })
        );
        assert!(manager.selected_ids().is_empty());
        assert!(manager.select(&1).is_err());
    }

    #[test]
    fn test_select_all_skips_protected_member() {
        let manager = SelectionManager::new();
        for id in 1..=5 {
            manager.track(&item(id, id == 3));
        }

        let members: Vec<u32> = (1..=5).collect();
        assert_eq!(manager.select_all_in(&members), 4);
        let summary = manager.summary();
        assert_eq!(summary.total_selected, 4);
        assert_eq!(summary.total_bytes_reclaimable, 400);

        assert_eq!(manager.deselect_all_in(&members), 4);
        assert_eq!(manager.summary(), SelectionSummary::default());
    }

    #[test]
    fn test_becoming_protected_drops_selection() {
        let manager = SelectionManager::new();
        manager.track(&item(7, false));
        manager.toggle(&7).unwrap();

        manager.track(&item(7, true));
        assert!(!manager.is_selected(&7));
    }

    #[test]
    fn test_forgotten_id_cannot_be_resurrected() {
        let manager = SelectionManager::new();
        manager.track(&item(1, false));
        manager.toggle(&1).unwrap();

        assert_eq!(manager.forget(&[1]), 1);
        assert_eq!(
            manager.toggle(&1),
            Err(SelectionError::UnknownItem { id: "1".to_string() })
        );
        assert_eq!(manager.select_all_in(&[1]), 0);
        assert!(manager.selected_ids().is_empty());
    }

    #[test]
    fn test_concurrent_toggles_never_outlive_forget() {
        let manager = Arc::new(SelectionManager::new());
        for id in 0..64 {
            manager.track(&item(id, false));
        }

        thread::scope(|scope| {
            for _ in 0..4 {
                let manager = manager.clone();
                scope.spawn(move || {
                    for round in 0..200 {
                        let _ = manager.toggle(&(round % 64));
                    }
                });
            }
            let manager = manager.clone();
            scope.spawn(move || {
                let even: Vec<u32> = (0..64).filter(|id| id % 2 == 0).collect();
                manager.forget(&even);
            });
        });

        // whatever interleaving happened, forgotten ids stay gone
        let selected = manager.selected_ids();
        assert!(selected.iter().all(|id| id % 2 == 1));
        assert!(manager.toggle(&0).is_err());
    }
}
