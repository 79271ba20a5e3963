//! Stateful property testing for the entity cache.
//!
//! Uses proptest-state-machine to drive an `EntityCache` through local
//! writes, remote change events and initial-load handshakes, checking it
//! against a simple map model:
//!
//! - Contents match the model (no duplicate ids, merges applied)
//! - Sync state transitions (Disconnected -> Syncing -> Live)
//! - Events received while syncing are queued, then replayed
//! - Updates for absent entities are inserted only when live

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::json;

use rally_supabase::{ChangeEvent, Row};
use rally_sync::cache::{EntityCache, MAX_PENDING_EVENTS, SyncState};
use rally_sync::{Entity, row};

const TABLE: &str = "events";

/// Operations that can be performed on the cache.
#[derive(Debug, Clone)]
pub enum CacheOperation {
    /// Local insert (merges when the id exists).
    Insert { id: u8, v: i64 },
    /// Local patch.
    Update { id: u8, v: i64 },
    /// Local removal.
    Remove { id: u8 },
    RemoteInsert { id: u8, v: i64 },
    RemoteUpdate { id: u8, v: i64 },
    RemoteDelete { id: u8 },
    /// Start an initial fetch.
    BeginSync,
    /// Complete the fetch with these rows.
    FinishSync { rows: Vec<(u8, i64)> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Remote {
    Insert(u8, i64),
    Update(u8, i64),
    Delete(u8),
}

/// Model of SyncState for the reference state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncStateModel {
    #[default]
    Disconnected,
    Syncing,
    Live,
}

impl From<SyncState> for SyncStateModel {
    fn from(state: SyncState) -> Self {
        match state {
            SyncState::Disconnected => SyncStateModel::Disconnected,
            SyncState::Syncing => SyncStateModel::Syncing,
            SyncState::Live => SyncStateModel::Live,
        }
    }
}

/// Reference model for the cache.
#[derive(Clone, Debug, Default)]
pub struct CacheModel {
    entities: BTreeMap<u8, i64>,
    sync_state: SyncStateModel,
    pending: Vec<Remote>,
}

impl CacheModel {
    fn apply_remote(&mut self, event: Remote, live: bool) {
        match event {
            Remote::Insert(id, v) => {
                self.entities.insert(id, v);
            }
            Remote::Update(id, v) => {
                if let Some(current) = self.entities.get_mut(&id) {
                    *current = v;
                } else if live {
                    self.entities.insert(id, v);
                }
            }
            Remote::Delete(id) => {
                self.entities.remove(&id);
            }
        }
    }

    fn receive(&mut self, event: Remote) {
        match self.sync_state {
            SyncStateModel::Syncing => self.pending.push(event),
            SyncStateModel::Live => self.apply_remote(event, true),
            SyncStateModel::Disconnected => self.apply_remote(event, false),
        }
    }
}

fn id_strategy() -> impl Strategy<Value = u8> {
    0u8..6
}

impl ReferenceStateMachine for CacheModel {
    type State = Self;
    type Transition = CacheOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let sync = match state.sync_state {
            SyncStateModel::Syncing => prop::collection::vec((id_strategy(), 0i64..100), 0..6)
                .prop_map(|rows| CacheOperation::FinishSync { rows })
                .boxed(),
            _ => Just(CacheOperation::BeginSync).boxed(),
        };

        prop_oneof![
            2 => (id_strategy(), 0i64..100).prop_map(|(id, v)| CacheOperation::Insert { id, v }),
            2 => (id_strategy(), 0i64..100).prop_map(|(id, v)| CacheOperation::Update { id, v }),
            1 => id_strategy().prop_map(|id| CacheOperation::Remove { id }),
            3 => (id_strategy(), 0i64..100).prop_map(|(id, v)| CacheOperation::RemoteInsert { id, v }),
            3 => (id_strategy(), 0i64..100).prop_map(|(id, v)| CacheOperation::RemoteUpdate { id, v }),
            2 => id_strategy().prop_map(|id| CacheOperation::RemoteDelete { id }),
            1 => sync,
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            CacheOperation::Insert { id, v } => {
                state.entities.insert(*id, *v);
            }
            CacheOperation::Update { id, v } => {
                if let Some(current) = state.entities.get_mut(id) {
                    *current = *v;
                }
            }
            CacheOperation::Remove { id } => {
                state.entities.remove(id);
            }
            CacheOperation::RemoteInsert { id, v } => state.receive(Remote::Insert(*id, *v)),
            CacheOperation::RemoteUpdate { id, v } => state.receive(Remote::Update(*id, *v)),
            CacheOperation::RemoteDelete { id } => state.receive(Remote::Delete(*id)),
            CacheOperation::BeginSync => {
                state.pending.clear();
                state.sync_state = SyncStateModel::Syncing;
            }
            CacheOperation::FinishSync { rows } => {
                // Later duplicates in a fetch win, like repeated inserts.
                state.entities = rows.iter().copied().collect();
                for event in std::mem::take(&mut state.pending) {
                    state.apply_remote(event, false);
                }
                state.sync_state = SyncStateModel::Live;
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            CacheOperation::BeginSync => state.sync_state != SyncStateModel::Syncing,
            CacheOperation::FinishSync { .. } => state.sync_state == SyncStateModel::Syncing,
            _ => true,
        }
    }
}

fn entity(id: u8, v: i64) -> Entity {
    Entity::from_row(row(json!({"id": id.to_string(), "v": v}))).unwrap()
}

fn record(id: u8, v: i64) -> Row {
    row(json!({"id": id.to_string(), "v": v}))
}

/// Test harness that wraps the real EntityCache.
pub struct CacheHarness {
    cache: Arc<EntityCache>,
}

impl CacheHarness {
    fn apply_operation(&self, op: &CacheOperation) {
        match op {
            CacheOperation::Insert { id, v } => {
                self.cache.insert(entity(*id, *v));
            }
            CacheOperation::Update { id, v } => {
                self.cache.update(&id.to_string(), &row(json!({"v": v})));
            }
            CacheOperation::Remove { id } => {
                self.cache.remove(&id.to_string());
            }
            CacheOperation::RemoteInsert { id, v } => {
                self.cache
                    .apply_change(&ChangeEvent::insert(TABLE, record(*id, *v)))
                    .unwrap();
            }
            CacheOperation::RemoteUpdate { id, v } => {
                let old = row(json!({"id": id.to_string()}));
                self.cache
                    .apply_change(&ChangeEvent::update(TABLE, record(*id, *v), Some(old)))
                    .unwrap();
            }
            CacheOperation::RemoteDelete { id } => {
                self.cache
                    .apply_change(&ChangeEvent::delete(TABLE, row(json!({"id": id.to_string()}))))
                    .unwrap();
            }
            CacheOperation::BeginSync => self.cache.begin_sync(),
            CacheOperation::FinishSync { rows } => {
                self.cache
                    .finish_sync(rows.iter().map(|(id, v)| record(*id, *v)).collect());
            }
        }
    }

    fn verify_invariants(&self, model: &CacheModel) {
        // Invariant 1: State matches model
        let actual_state: SyncStateModel = self.cache.state().into();
        assert_eq!(actual_state, model.sync_state);

        // Invariant 2: Contents match model, no duplicate ids
        let listed = self.cache.list();
        let ids: HashSet<_> = listed.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids.len(), listed.len(), "duplicate ids in list");
        assert_eq!(listed.len(), model.entities.len());
        for (id, v) in &model.entities {
            let cached = self.cache.get(&id.to_string());
            assert_eq!(cached.and_then(|e| e.i64_field("v")), Some(*v), "value of {}", id);
        }

        // Invariant 3: Queue length matches and is bounded
        assert_eq!(self.cache.pending_len(), model.pending.len());
        assert!(self.cache.pending_len() <= MAX_PENDING_EVENTS);
    }
}

impl StateMachineTest for CacheHarness {
    type SystemUnderTest = Self;
    type Reference = CacheModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self {
            cache: EntityCache::new(TABLE),
        }
    }

    fn apply(
        state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn cache_state_machine_test(sequential 1..60 => CacheHarness);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Applying the same remote event twice leaves the cache as applying it once.
    #[test]
    fn remote_events_are_idempotent(
        events in prop::collection::vec((0u8..3, id_strategy(), 0i64..100), 1..40)
    ) {
        let once = EntityCache::new(TABLE);
        let twice = EntityCache::new(TABLE);
        once.set_state(SyncState::Live);
        twice.set_state(SyncState::Live);

        for (kind, id, v) in events {
            let event = match kind {
                0 => ChangeEvent::insert(TABLE, record(id, v)),
                1 => ChangeEvent::update(TABLE, record(id, v), None),
                _ => ChangeEvent::delete(TABLE, row(json!({"id": id.to_string()}))),
            };
            once.apply_change(&event).unwrap();
            twice.apply_change(&event).unwrap();
            twice.apply_change(&event).unwrap();
        }

        prop_assert_eq!(once.list(), twice.list());
    }
}
