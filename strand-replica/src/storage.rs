//! Persistent per-slot action store using fjall.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};

use strand_core::Action;

const STORAGE_MAGIC: [u8; 2] = [0xF5, 0x1D];
const STORAGE_VERSION: u8 = 1;

const META_PROMISED: &[u8] = b"promised";
const META_BEGIN: &[u8] = b"begin";

fn versioned_encode(version: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.extend_from_slice(&STORAGE_MAGIC);
    out.push(version);
    out.extend_from_slice(payload);
    out
}

fn versioned_decode(bytes: &[u8]) -> (u8, &[u8]) {
    if bytes.len() >= 3 && bytes[..2] == STORAGE_MAGIC {
        (bytes[2], &bytes[3..])
    } else {
        (1, bytes)
    }
}

/// Synchronous store of [`Action`] slots plus the two acceptor
/// watermarks (highest promised ballot, first retained position).
///
/// Callers on the async side must go through `spawn_blocking`; every
/// mutation is persisted with `SyncAll` before it returns.
pub(crate) struct ActionStorage {
    db: Database,
    actions: Keyspace,
    meta: Keyspace,
}

impl ActionStorage {
    pub(crate) fn open_sync(path: &Path) -> Result<Self, fjall::Error> {
        let db = Database::builder(path).open()?;
        let actions = db.keyspace("actions", KeyspaceCreateOptions::default)?;
        let meta = db.keyspace("meta", KeyspaceCreateOptions::default)?;
        Ok(Self { db, actions, meta })
    }

    fn position_key(position: u64) -> [u8; 8] {
        position.to_be_bytes()
    }

    fn position_from_key(key: &[u8]) -> Option<u64> {
        let bytes: [u8; 8] = key.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    fn serialize_action(action: &Action) -> Vec<u8> {
        let data = postcard::to_allocvec(action).expect("serialization should not fail");
        versioned_encode(STORAGE_VERSION, &data)
    }

    fn deserialize_action(bytes: &[u8]) -> Option<Action> {
        let (_, payload) = versioned_decode(bytes);
        postcard::from_bytes(payload).ok()
    }

    pub(crate) fn get(&self, position: u64) -> Result<Option<Action>, fjall::Error> {
        let value = self.actions.get(Self::position_key(position))?;
        Ok(value.and_then(|bytes| Self::deserialize_action(&bytes)))
    }

    pub(crate) fn put(&self, action: &Action) -> Result<(), fjall::Error> {
        let key = Self::position_key(action.position);
        let value = Self::serialize_action(action);
        self.actions.insert(key, &value)?;
        self.db.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Highest ballot this replica has promised across all slots.
    pub(crate) fn promised(&self) -> Result<u64, fjall::Error> {
        let value = self.meta.get(META_PROMISED)?;
        Ok(value
            .and_then(|bytes| bytes.as_ref().try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0))
    }

    pub(crate) fn set_promised(&self, proposal: u64) -> Result<(), fjall::Error> {
        self.meta.insert(META_PROMISED, &proposal.to_be_bytes())?;
        self.db.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// First position this replica still retains; 0 until the log
    /// has been truncated.
    pub(crate) fn begin(&self) -> Result<u64, fjall::Error> {
        let value = self.meta.get(META_BEGIN)?;
        Ok(value
            .and_then(|bytes| bytes.as_ref().try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0))
    }

    fn set_begin(&self, begin: u64) -> Result<(), fjall::Error> {
        self.meta.insert(META_BEGIN, &begin.to_be_bytes())?;
        Ok(())
    }

    /// Raise the retention watermark to `begin` and discard every
    /// slot below it. The watermark never moves backwards.
    pub(crate) fn raise_begin(&self, begin: u64) -> Result<usize, fjall::Error> {
        if begin <= self.begin()? {
            return Ok(0);
        }
        self.set_begin(begin)?;

        let mut removed = 0;
        let mut to_delete = Vec::new();
        for guard in self.actions.range(..Self::position_key(begin).as_slice()) {
            let Ok((key, _)) = guard.into_inner() else {
                continue;
            };
            to_delete.push(key.to_vec());
        }
        for key in to_delete {
            self.actions.remove(&key)?;
            removed += 1;
        }

        self.db.persist(PersistMode::SyncAll)?;
        Ok(removed)
    }

    /// Stored actions in the inclusive range, in position order.
    /// Missing slots are simply absent.
    pub(crate) fn range(&self, from: u64, to: u64) -> Result<Vec<Action>, fjall::Error> {
        if from > to {
            return Ok(Vec::new());
        }
        let start = Self::position_key(from);
        let end = Self::position_key(to);
        let mut actions = Vec::new();
        for guard in self.actions.range(start.as_slice()..=end.as_slice()) {
            let Ok((_, value)) = guard.into_inner() else {
                continue;
            };
            if let Some(action) = Self::deserialize_action(&value) {
                actions.push(action);
            }
        }
        Ok(actions)
    }

    pub(crate) fn first_learned(&self) -> Result<Option<u64>, fjall::Error> {
        for guard in self.actions.iter() {
            if let Ok((_, value)) = guard.into_inner()
                && let Some(action) = Self::deserialize_action(&value)
                && action.learned
            {
                return Ok(Some(action.position));
            }
        }
        Ok(None)
    }

    pub(crate) fn last_learned(&self) -> Result<Option<u64>, fjall::Error> {
        for guard in self.actions.iter().rev() {
            if let Ok((_, value)) = guard.into_inner()
                && let Some(action) = Self::deserialize_action(&value)
                && action.learned
            {
                return Ok(Some(action.position));
            }
        }
        Ok(None)
    }

    /// Highest slot with any stored state, learned or not.
    pub(crate) fn highest_slot(&self) -> Result<Option<u64>, fjall::Error> {
        for guard in self.actions.iter().rev() {
            if let Ok((key, _)) = guard.into_inner() {
                return Ok(Self::position_from_key(&key));
            }
        }
        Ok(None)
    }

    /// First reader-visible position: the retention watermark or the
    /// first learned slot, whichever is higher. 0 when nothing is
    /// learned and nothing was truncated.
    pub(crate) fn beginning(&self) -> Result<u64, fjall::Error> {
        let begin = self.begin()?;
        let first = self.first_learned()?.unwrap_or(0);
        Ok(begin.max(first))
    }

    /// Last reader-visible position; 0 when nothing is learned.
    pub(crate) fn ending(&self) -> Result<u64, fjall::Error> {
        Ok(self.last_learned()?.unwrap_or(0))
    }

    /// Install a quorum-confirmed action: positions below the
    /// retention watermark are ignored, learned truncations advance
    /// it and garbage-collect the prefix they cover.
    pub(crate) fn apply_learned(&self, action: Action) -> Result<(), fjall::Error> {
        let begin = self.begin()?;
        if action.position < begin {
            return Ok(());
        }

        let truncate_to = action.truncate_to();
        self.put(&action)?;
        if let Some(to) = truncate_to {
            self.raise_begin(to + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use strand_core::ActionKind;

    use super::*;

    fn open_test_store(path: &Path) -> ActionStorage {
        ActionStorage::open_sync(path).unwrap()
    }

    fn append_action(position: u64, ballot: u64, learned: bool) -> Action {
        let action = Action::performed(
            position,
            ballot,
            ActionKind::Append {
                bytes: Bytes::from(format!("entry-{position}")),
            },
        );
        if learned { action.into_learned() } else { action }
    }

    #[test]
    fn action_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(dir.path());

        let action = append_action(3, 1, true);
        store.put(&action).unwrap();

        assert_eq!(store.get(3).unwrap().unwrap(), action);
        assert!(store.get(4).unwrap().is_none());
    }

    #[test]
    fn versioned_encode_decode_roundtrip() {
        let payload = b"slot data";
        let encoded = versioned_encode(STORAGE_VERSION, payload);
        let (version, decoded) = versioned_decode(&encoded);
        assert_eq!(version, STORAGE_VERSION);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn deserialize_invalid_bytes() {
        assert!(ActionStorage::deserialize_action(&[]).is_none());
        assert!(ActionStorage::deserialize_action(b"garbage").is_none());
        let versioned_garbage = versioned_encode(STORAGE_VERSION, b"not postcard");
        assert!(ActionStorage::deserialize_action(&versioned_garbage).is_none());
    }

    #[test]
    fn promised_watermark_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(dir.path());
        assert_eq!(store.promised().unwrap(), 0);

        store.set_promised(4).unwrap();
        assert_eq!(store.promised().unwrap(), 4);
        drop(store);

        let reopened = open_test_store(dir.path());
        assert_eq!(reopened.promised().unwrap(), 4);
    }

    #[test]
    fn range_skips_holes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(dir.path());

        store.put(&append_action(1, 1, true)).unwrap();
        store.put(&append_action(3, 1, true)).unwrap();

        let actions = store.range(1, 3).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].position, 1);
        assert_eq!(actions[1].position, 3);
    }

    #[test]
    fn boundaries_track_learned_slots_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(dir.path());
        assert_eq!(store.beginning().unwrap(), 0);
        assert_eq!(store.ending().unwrap(), 0);

        store.put(&append_action(1, 1, true)).unwrap();
        store.put(&append_action(2, 1, true)).unwrap();
        store.put(&append_action(3, 1, false)).unwrap();

        assert_eq!(store.beginning().unwrap(), 1);
        assert_eq!(store.ending().unwrap(), 2);
        assert_eq!(store.highest_slot().unwrap(), Some(3));
    }

    #[test]
    fn raise_begin_discards_prefix_and_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(dir.path());
        for position in 1..=4 {
            store.put(&append_action(position, 1, true)).unwrap();
        }

        let removed = store.raise_begin(3).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.begin().unwrap(), 3);
        assert!(store.get(1).unwrap().is_none());
        assert!(store.get(2).unwrap().is_none());
        assert!(store.get(3).unwrap().is_some());

        // Never moves backwards.
        assert_eq!(store.raise_begin(2).unwrap(), 0);
        assert_eq!(store.begin().unwrap(), 3);
    }

    #[test]
    fn apply_learned_truncation_garbage_collects() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(dir.path());
        for position in 1..=3 {
            store.put(&append_action(position, 1, true)).unwrap();
        }

        let truncate =
            Action::performed(4, 1, ActionKind::Truncate { to: 2 }).into_learned();
        store.apply_learned(truncate).unwrap();

        assert_eq!(store.begin().unwrap(), 3);
        assert_eq!(store.beginning().unwrap(), 3);
        assert!(store.get(1).unwrap().is_none());
        assert!(store.get(2).unwrap().is_none());
        assert!(store.get(3).unwrap().is_some());
        assert_eq!(store.get(4).unwrap().unwrap().truncate_to(), Some(2));
    }

    #[test]
    fn apply_learned_ignores_truncated_slots() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_test_store(dir.path());
        store.raise_begin(3).unwrap();

        store.apply_learned(append_action(1, 1, true)).unwrap();
        assert!(store.get(1).unwrap().is_none());

        store.apply_learned(append_action(3, 1, true)).unwrap();
        assert!(store.get(3).unwrap().is_some());
    }
}
