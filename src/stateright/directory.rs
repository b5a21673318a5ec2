//! Stateright Model for Directory Get-or-Create
//!
//! Exhaustively interleaves several threads requesting the same, never-seen
//! partition:
//! - SINGLE_CREATION: the factory's create runs at most once
//! - SAME_HANDLE: every finished caller holds the registered handle
//!
//! The model can also run without the directory lock (lookup and insert as
//! separate steps), in which case the checker finds a double creation.

use stateright::{Model, Property};

/// Per-thread progress through get-or-create
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CreatorPhase {
    Idle,
    /// Holds the lock (or, unlocked, is about to look up)
    Looking,
    /// Looked up and found nothing
    Missing,
    /// Holds a handle, lock not yet released
    Found,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DirectoryState {
    /// Handle id registered for the key, if any
    pub registry: Option<u8>,
    pub lock_holder: Option<usize>,
    pub phases: Vec<CreatorPhase>,
    pub handles: Vec<Option<u8>>,
    /// Times the factory constructed a partition
    pub creations: u8,
}

impl DirectoryState {
    pub fn new(threads: usize) -> Self {
        DirectoryState {
            registry: None,
            lock_holder: None,
            phases: vec![CreatorPhase::Idle; threads],
            handles: vec![None; threads],
            creations: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CreatorAction {
    Acquire(usize),
    Lookup(usize),
    Create(usize),
    Release(usize),
}

/// Threads racing on one key
pub struct GetOrCreateModel {
    pub threads: usize,
    /// Whether lookup, create and insert happen under the directory lock
    pub locked: bool,
}

impl GetOrCreateModel {
    pub fn new(threads: usize) -> Self {
        GetOrCreateModel {
            threads,
            locked: true,
        }
    }

    /// Lookup and insert without holding the lock across them
    pub fn unlocked(threads: usize) -> Self {
        GetOrCreateModel {
            threads,
            locked: false,
        }
    }
}

impl Model for GetOrCreateModel {
    type State = DirectoryState;
    type Action = CreatorAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![DirectoryState::new(self.threads)]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        for (i, phase) in state.phases.iter().enumerate() {
            match phase {
                CreatorPhase::Idle => {
                    if !self.locked || state.lock_holder.is_none() {
                        actions.push(CreatorAction::Acquire(i));
                    }
                }
                CreatorPhase::Looking => actions.push(CreatorAction::Lookup(i)),
                CreatorPhase::Missing => actions.push(CreatorAction::Create(i)),
                CreatorPhase::Found => actions.push(CreatorAction::Release(i)),
                CreatorPhase::Done => {}
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();

        match action {
            CreatorAction::Acquire(i) => {
                if self.locked {
                    if next.lock_holder.is_some() {
                        return None;
                    }
                    next.lock_holder = Some(i);
                }
                next.phases[i] = CreatorPhase::Looking;
            }
            CreatorAction::Lookup(i) => match next.registry {
                Some(handle) => {
                    next.handles[i] = Some(handle);
                    next.phases[i] = CreatorPhase::Found;
                }
                None => next.phases[i] = CreatorPhase::Missing,
            },
            CreatorAction::Create(i) => {
                next.creations += 1;
                let handle = next.creations;
                next.registry = Some(handle);
                next.handles[i] = Some(handle);
                next.phases[i] = CreatorPhase::Found;
            }
            CreatorAction::Release(i) => {
                if self.locked {
                    debug_assert_eq!(next.lock_holder, Some(i));
                    next.lock_holder = None;
                }
                next.phases[i] = CreatorPhase::Done;
            }
        }

        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("single_creation", |_: &GetOrCreateModel, state: &DirectoryState| {
                state.creations <= 1
            }),
            Property::always("same_handle", |_: &GetOrCreateModel, state: &DirectoryState| {
                state
                    .phases
                    .iter()
                    .zip(&state.handles)
                    .filter(|(phase, _)| **phase == CreatorPhase::Done)
                    .all(|(_, handle)| *handle == state.registry)
            }),
            Property::sometimes("all_done", |_: &GetOrCreateModel, state: &DirectoryState| {
                state.phases.iter().all(|p| *p == CreatorPhase::Done)
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateright::Checker;

    #[test]
    fn test_lookup_after_create_finds_handle() {
        let model = GetOrCreateModel::new(2);
        let mut state = DirectoryState::new(2);
        for action in [
            CreatorAction::Acquire(0),
            CreatorAction::Lookup(0),
            CreatorAction::Create(0),
            CreatorAction::Release(0),
            CreatorAction::Acquire(1),
            CreatorAction::Lookup(1),
        ] {
            state = model.next_state(&state, action).unwrap();
        }
        assert_eq!(state.handles[1], Some(1));
        assert_eq!(state.creations, 1);
    }

    #[test]
    fn test_lock_excludes_second_thread() {
        let model = GetOrCreateModel::new(2);
        let state = model
            .next_state(&DirectoryState::new(2), CreatorAction::Acquire(0))
            .unwrap();

        let mut actions = Vec::new();
        model.actions(&state, &mut actions);
        assert_eq!(actions, vec![CreatorAction::Lookup(0)]);
    }

    #[test]
    fn stateright_get_or_create_model_check() {
        let checker = GetOrCreateModel::new(3).checker().spawn_bfs().join();
        checker.assert_properties();
    }

    #[test]
    fn stateright_unlocked_get_or_create_double_creates() {
        let checker = GetOrCreateModel::unlocked(2).checker().spawn_bfs().join();
        assert!(checker.discovery("single_creation").is_some());
    }
}
