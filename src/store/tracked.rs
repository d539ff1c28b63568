use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::KEY_TRACKED_EMAILS;
use crate::domain::email::{EmailId, EpochMs, TrackedMessage};
use crate::store::repo::{KvStore, get_as, set_as};

pub type TrackedEmails = BTreeMap<EmailId, TrackedMessage>;

/// Tracked messages, persisted as one keyed collection under
/// `trackedEmails`. Every write is a whole-collection read-modify-write.
#[derive(Clone)]
pub struct TrackedStore {
    kv: Arc<dyn KvStore>,
}

impl TrackedStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn get_all(&self) -> Result<TrackedEmails> {
        Ok(get_as(self.kv.as_ref(), KEY_TRACKED_EMAILS)?.unwrap_or_default())
    }

    pub fn get(&self, id: &str) -> Result<Option<TrackedMessage>> {
        Ok(self.get_all()?.remove(id))
    }

    /// Insert or replace the record keyed by `msg.id`.
    pub fn insert(&self, msg: TrackedMessage) -> Result<()> {
        let mut all = self.get_all()?;
        all.insert(msg.id.clone(), msg);
        set_as(self.kv.as_ref(), KEY_TRACKED_EMAILS, &all)
    }

    /// Insert `msg` unless its id is already stored. An existing record,
    /// opened or not, is kept as is. Returns whether `msg` was written.
    pub fn insert_new(&self, msg: TrackedMessage) -> Result<bool> {
        let mut all = self.get_all()?;
        if all.contains_key(&msg.id) {
            return Ok(false);
        }
        all.insert(msg.id.clone(), msg);
        set_as(self.kv.as_ref(), KEY_TRACKED_EMAILS, &all)?;
        Ok(true)
    }

    /// Returns `true` only for the call that flipped the record to opened.
    /// Unknown ids and already-opened records are left untouched.
    pub fn mark_opened(&self, id: &str, at: EpochMs) -> Result<bool> {
        let mut all = self.get_all()?;
        let changed = match all.get_mut(id) {
            Some(msg) => msg.mark_opened(at),
            None => false,
        };
        if changed {
            set_as(self.kv.as_ref(), KEY_TRACKED_EMAILS, &all)?;
        }
        Ok(changed)
    }

    /// Records in registration order, oldest first.
    pub fn by_creation(all: &TrackedEmails) -> Vec<&TrackedMessage> {
        let mut v: Vec<&TrackedMessage> = all.values().collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::email::RegistrationRequest;
    use crate::store::repo::MemoryKv;

    fn store_with(id: &str, created_at: EpochMs) -> TrackedStore {
        let store = TrackedStore::new(Arc::new(MemoryKv::new()));
        store
            .insert(TrackedMessage::registered(
                &RegistrationRequest {
                    id: id.into(),
                    recipient: "bob@x.com".into(),
                    subject: "Hello".into(),
                    body: "hi".into(),
                },
                created_at,
            ))
            .unwrap();
        store
    }

    #[test]
    fn mark_opened_twice_equals_once() {
        let store = store_with("a1", 0);
        assert!(store.mark_opened("a1", 100).unwrap());
        let once = store.get_all().unwrap();
        assert!(!store.mark_opened("a1", 200).unwrap());
        assert_eq!(store.get_all().unwrap(), once);
        let a1 = store.get("a1").unwrap().unwrap();
        assert!(a1.opened);
        assert_eq!(a1.opened_at, Some(100));
    }

    #[test]
    fn mark_opened_ignores_unknown_ids() {
        let store = store_with("a1", 0);
        assert!(!store.mark_opened("zz", 1).unwrap());
        assert!(!store.get("a1").unwrap().unwrap().opened);
    }

    #[test]
    fn insert_new_keeps_an_opened_record() {
        let store = store_with("a1", 0);
        store.mark_opened("a1", 100).unwrap();
        let again = TrackedMessage::registered(
            &RegistrationRequest {
                id: "a1".into(),
                recipient: "carol@x.com".into(),
                subject: "Other".into(),
                body: String::new(),
            },
            500,
        );
        assert!(!store.insert_new(again).unwrap());
        let a1 = store.get("a1").unwrap().unwrap();
        assert!(a1.opened);
        assert_eq!(a1.opened_at, Some(100));
        assert_eq!(a1.recipient, "bob@x.com");
        assert_eq!(a1.created_at, 0);
    }

    #[test]
    fn empty_store_reads_as_empty_map() {
        let store = TrackedStore::new(Arc::new(MemoryKv::new()));
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn creation_order_breaks_ties_by_id() {
        let store = store_with("b", 5);
        let mut m = store.get("b").unwrap().unwrap();
        m.id = "a".into();
        store.insert(m).unwrap();
        let mut old = store.get("a").unwrap().unwrap();
        old.id = "z".into();
        old.created_at = 1;
        store.insert(old).unwrap();
        let all = store.get_all().unwrap();
        let ids: Vec<&str> = TrackedStore::by_creation(&all).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }
}
