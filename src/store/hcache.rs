//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Mailfold.
//
// Mailfold is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailfold is distributed  in the hope that it  will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty  of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailfold. If not, see <http://www.gnu.org/licenses/>.

//! The header-cache seam.
//!
//! The storage backing the cache is the host's business; the engine sees a
//! key/value store holding opaque blobs. Each blob is a versioned CBOR
//! record of the parsed `Email` plus the wall-clock second it was stored,
//! which the delayed parsing pass compares against the file's mtime to
//! decide staleness.
//!
//! A cache handle is opened once per open/check/sync and dropped at the end
//! of that operation; handles must not be shared across operations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::store::model::{Email, MailboxKind};
use crate::support::error::Error;

/// An open per-mailbox header cache.
pub trait HeaderCache {
    fn fetch(&mut self, key: &str) -> Option<Vec<u8>>;
    fn store(&mut self, key: &str, blob: &[u8]);
    fn delete(&mut self, key: &str);
}

/// Factory for per-mailbox caches. Returning `None` disables caching for
/// that mailbox.
pub trait HeaderCacheStore: Sync {
    fn open(&self, mailbox: &Path) -> Option<Box<dyn HeaderCache>>;
}

/// Bumped whenever the serialised layout of `Email` changes; stale blobs
/// are treated as cache misses.
const BLOB_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
pub(crate) struct CachedEmail {
    version: u32,
    /// `tv_sec` at the time of the store, for staleness checks.
    pub(crate) timestamp: i64,
    pub(crate) email: Email,
}

pub(crate) fn encode(email: &Email, timestamp: i64) -> Result<Vec<u8>, Error> {
    Ok(serde_cbor::to_vec(&CachedEmail {
        version: BLOB_VERSION,
        timestamp,
        email: email.clone(),
    })?)
}

pub(crate) fn decode(blob: &[u8]) -> Option<CachedEmail> {
    serde_cbor::from_slice::<CachedEmail>(blob)
        .ok()
        .filter(|cached| BLOB_VERSION == cached.version)
}

/// The cache key for a message at `rel_path`.
///
/// For MH the key is the numeric filename itself. For maildir the `new`/
/// `cur` prefix is stripped (so the key survives subdirectory moves) along
/// with the flag suffix (so it survives flag renames).
pub(crate) fn cache_key(kind: MailboxKind, rel_path: &str) -> String {
    match kind {
        MailboxKind::Mh => rel_path.to_owned(),
        _ => {
            let key = rel_path
                .rsplit_once('/')
                .map(|(_, base)| base)
                .unwrap_or(rel_path);
            key.rfind(':').map(|ix| &key[..ix]).unwrap_or(key).to_owned()
        },
    }
}

/// A process-local [`HeaderCacheStore`] backed by a hash map.
///
/// Mostly useful for tests and single-process hosts; anything durable
/// should implement the traits over its own storage engine.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    folders: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<HashMap<String, Vec<u8>>>>>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries cached for `mailbox`.
    pub fn len(&self, mailbox: &Path) -> usize {
        self.folders
            .lock()
            .unwrap()
            .get(mailbox)
            .map(|m| m.lock().unwrap().len())
            .unwrap_or(0)
    }

    /// Whether an entry exists for `key` under `mailbox`.
    pub fn contains(&self, mailbox: &Path, key: &str) -> bool {
        self.folders
            .lock()
            .unwrap()
            .get(mailbox)
            .map(|m| m.lock().unwrap().contains_key(key))
            .unwrap_or(false)
    }
}

struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl HeaderCacheStore for MemoryCacheStore {
    fn open(&self, mailbox: &Path) -> Option<Box<dyn HeaderCache>> {
        let entries = self
            .folders
            .lock()
            .unwrap()
            .entry(mailbox.to_owned())
            .or_default()
            .clone();
        Some(Box::new(MemoryCache { entries }))
    }
}

impl HeaderCache for MemoryCache {
    fn fetch(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn store(&mut self, key: &str, blob: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), blob.to_vec());
    }

    fn delete(&mut self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_keys_survive_flag_and_subdir_changes() {
        assert_eq!(
            cache_key(MailboxKind::Maildir, "new/u1"),
            cache_key(MailboxKind::Maildir, "cur/u1:2,FS")
        );
        assert_eq!("17", cache_key(MailboxKind::Mh, "17"));
    }

    #[test]
    fn blob_round_trip() {
        let mut email = Email::new();
        email.path = "cur/u1:2,S".to_owned();
        email.read = true;
        email.content.offset = 120;
        email.content.length = 3000;
        email.message_id = Some("<x@y>".to_owned());

        let blob = encode(&email, 1500000000).unwrap();
        let cached = decode(&blob).unwrap();
        assert_eq!(1500000000, cached.timestamp);
        assert_eq!(email.path, cached.email.path);
        assert_eq!(email.content, cached.email.content);
        assert_eq!(email.message_id, cached.email.message_id);

        assert!(decode(b"not cbor").is_none());
    }

    #[test]
    fn memory_store_is_shared_between_opens() {
        let store = MemoryCacheStore::new();
        let mailbox = Path::new("/mbx");

        {
            let mut hc = store.open(mailbox).unwrap();
            hc.store("a", b"1");
        }
        {
            let mut hc = store.open(mailbox).unwrap();
            assert_eq!(Some(b"1".to_vec()), hc.fetch("a"));
            hc.delete("a");
        }
        assert_eq!(0, store.len(mailbox));
    }
}
