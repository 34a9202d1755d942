use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::time::Instant;

use contacts_core::{Contact, ContactId, Entity, State, StateId};
use contacts_events::ContactCommand;

use super::{ApplyOutcome, ContactStore, StoreError};

/// Most recent apply attempts kept for `apply_attempts`.
const APPLY_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Tables {
    contacts: BTreeMap<ContactId, Contact>,
    states: BTreeMap<StateId, State>,
}

/// In-memory contact store for tests/dev.
///
/// Besides the store contract it can simulate an outage: `fail_next_applies(n)`
/// makes the next `n` applies fail with `StoreError::Unavailable`, and the most
/// recent apply attempts (failed or not) are timestamped for inspection.
#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    tables: RwLock<Tables>,
    failures_pending: AtomicU32,
    attempts: RwLock<VecDeque<(ContactId, Instant)>>,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with the given states.
    pub fn with_states(states: impl IntoIterator<Item = State>) -> Self {
        let store = Self::new();
        if let Ok(mut tables) = store.tables.write() {
            for s in states {
                tables.states.insert(*s.id(), s);
            }
        }
        store
    }

    /// Make the next `n` applies fail as if the store were unreachable.
    pub fn fail_next_applies(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Times at which `apply` was called for `id`, oldest first. Only the
    /// last `APPLY_LOG_CAPACITY` attempts across all ids are remembered.
    pub fn apply_attempts(&self, id: &ContactId) -> Vec<Instant> {
        self.attempts
            .read()
            .map(|a| a.iter().filter(|(c, _)| c == id).map(|(_, t)| *t).collect())
            .unwrap_or_default()
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("in-memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn apply(&self, command: &ContactCommand) -> Result<ApplyOutcome, StoreError> {
        if let Ok(mut attempts) = self.attempts.write() {
            if attempts.len() == APPLY_LOG_CAPACITY {
                attempts.pop_front();
            }
            attempts.push_back((command.contact_id().clone(), Instant::now()));
        }
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }

        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        match command {
            ContactCommand::Add(contact) => {
                if !tables.states.contains_key(&contact.state_id) {
                    return Err(StoreError::UnknownState(contact.state_id));
                }
                if tables.contacts.contains_key(&contact.id) {
                    return Ok(ApplyOutcome::Unchanged);
                }
                tables.contacts.insert(contact.id().clone(), contact.clone());
                Ok(ApplyOutcome::Inserted)
            }
            ContactCommand::Edit(contact) => {
                if !tables.states.contains_key(&contact.state_id) {
                    return Err(StoreError::UnknownState(contact.state_id));
                }
                match tables.contacts.get_mut(&contact.id) {
                    Some(existing) => {
                        *existing = contact.clone();
                        Ok(ApplyOutcome::Updated)
                    }
                    None => Err(StoreError::NotFound(contact.id.clone())),
                }
            }
            ContactCommand::Delete(delete) => match tables.contacts.remove(&delete.id) {
                Some(_) => Ok(ApplyOutcome::Deleted),
                None => Ok(ApplyOutcome::Unchanged),
            },
        }
    }

    async fn get_contact(&self, id: &ContactId) -> Result<Option<Contact>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.contacts.get(id).cloned())
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.contacts.values().cloned().collect())
    }

    async fn get_state(&self, id: StateId) -> Result<Option<State>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.states.get(&id).cloned())
    }

    async fn list_states(&self) -> Result<Vec<State>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.states.values().cloned().collect())
    }

    async fn upsert_state(&self, state: &State) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        tables.states.insert(*state.id(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contacts_core::ContactDetails;
    use proptest::prelude::*;

    fn sp() -> State {
        State::new(StateId::new(1), "SP", "São Paulo")
    }

    fn contact(id: &str, name: &str) -> Contact {
        Contact::new(ContactId::new(id).unwrap(), name, StateId::new(1))
    }

    #[tokio::test]
    async fn add_edit_delete_lifecycle() {
        let store = InMemoryContactStore::with_states([sp()]);
        let id = ContactId::new("c1").unwrap();

        assert_eq!(
            store.apply(&ContactCommand::add(contact("c1", "A"))).await,
            Ok(ApplyOutcome::Inserted)
        );
        assert_eq!(
            store.apply(&ContactCommand::edit(contact("c1", "B"))).await,
            Ok(ApplyOutcome::Updated)
        );
        assert_eq!(store.get_contact(&id).await.unwrap().unwrap().name, "B");

        assert_eq!(
            store.apply(&ContactCommand::delete(id.clone())).await,
            Ok(ApplyOutcome::Deleted)
        );
        assert_eq!(
            store.apply(&ContactCommand::delete(id.clone())).await,
            Ok(ApplyOutcome::Unchanged)
        );
        assert!(store.get_contact(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_add_keeps_first_write() {
        let store = InMemoryContactStore::with_states([sp()]);
        store.apply(&ContactCommand::add(contact("c1", "A"))).await.unwrap();

        let again = store.apply(&ContactCommand::add(contact("c1", "Other"))).await;
        assert_eq!(again, Ok(ApplyOutcome::Unchanged));
        assert_eq!(store.list_contacts().await.unwrap()[0].name, "A");
    }

    #[tokio::test]
    async fn edit_of_missing_contact_is_not_found() {
        let store = InMemoryContactStore::with_states([sp()]);
        let err = store
            .apply(&ContactCommand::edit(contact("unknown", "X")))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(ContactId::new("unknown").unwrap()));
        assert!(!err.is_transient());
        assert!(store.list_contacts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_state_is_rejected() {
        let store = InMemoryContactStore::new();
        let err = store
            .apply(&ContactCommand::add(contact("c1", "A")))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::UnknownState(StateId::new(1)));

        store.upsert_state(&sp()).await.unwrap();
        assert!(store.apply(&ContactCommand::add(contact("c1", "A"))).await.is_ok());
        assert_eq!(store.list_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_counted() {
        let store = InMemoryContactStore::with_states([sp()]);
        store.fail_next_applies(2);
        let cmd = ContactCommand::add(contact("c1", "A"));

        assert!(store.apply(&cmd).await.unwrap_err().is_transient());
        assert!(store.apply(&cmd).await.unwrap_err().is_transient());
        assert_eq!(store.apply(&cmd).await, Ok(ApplyOutcome::Inserted));
        assert_eq!(store.apply_attempts(&ContactId::new("c1").unwrap()).len(), 3);
    }

    #[tokio::test]
    async fn apply_log_keeps_only_recent_attempts() {
        let store = InMemoryContactStore::with_states([sp()]);
        let old = ContactId::new("old").unwrap();
        store.apply(&ContactCommand::delete(old.clone())).await.unwrap();

        let busy = ContactCommand::delete(ContactId::new("busy").unwrap());
        for _ in 0..APPLY_LOG_CAPACITY {
            store.apply(&busy).await.unwrap();
        }

        assert!(store.apply_attempts(&old).is_empty());
        assert_eq!(
            store.apply_attempts(&ContactId::new("busy").unwrap()).len(),
            APPLY_LOG_CAPACITY
        );
    }

    fn arb_command() -> impl Strategy<Value = ContactCommand> {
        let id = prop_oneof![Just("c1"), Just("c2"), Just("c3")];
        let name = "[A-Z][a-z]{0,6}";
        let email = proptest::option::of("[a-z]{1,5}@example\\.com");
        (0u8..3, id, name, email).prop_map(|(kind, id, name, email)| {
            let c = Contact::new(ContactId::new(id).unwrap(), name, StateId::new(1)).with_details(
                ContactDetails {
                    email,
                    ..Default::default()
                },
            );
            match kind {
                0 => ContactCommand::add(c),
                1 => ContactCommand::edit(c),
                _ => ContactCommand::delete(c.id),
            }
        })
    }

    proptest! {
        // Applying every command twice in a row ends in the same state as applying once.
        #[test]
        fn duplicate_delivery_converges(commands in proptest::collection::vec(arb_command(), 0..24)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let once = InMemoryContactStore::with_states([sp()]);
                let twice = InMemoryContactStore::with_states([sp()]);

                for cmd in &commands {
                    let first = once.apply(cmd).await;
                    let a = twice.apply(cmd).await;
                    let b = twice.apply(cmd).await;
                    prop_assert_eq!(first.is_ok(), a.is_ok());
                    prop_assert_eq!(a.is_ok(), b.is_ok());
                }

                prop_assert_eq!(once.list_contacts().await.unwrap(), twice.list_contacts().await.unwrap());
                Ok(())
            })?;
        }
    }
}
