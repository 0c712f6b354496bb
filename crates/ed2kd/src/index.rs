//! Shared file index and the `GetSources` responder.
//!
//! The server loop only sees the two traits; [`MemoryFileIndex`] is the
//! in-process implementation of both.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use ed2kd_proto::constants::{HASH_LEN, MAX_FOUND_SOURCES};
use ed2kd_proto::messages::{FoundSources, OfferedFile, Source};
use tracing::{debug, trace};

use crate::net::inbound::ConnId;
use crate::net::outbound::try_send_msg;
use crate::session::Session;

type FileHash = [u8; HASH_LEN];

/// Where offered files are recorded.
pub trait FileIndex: Send + Sync {
    /// Record `owner` as a source of `file`.
    fn add(&self, file: &OfferedFile, owner: &Session);

    /// The owner's id or port changed.
    fn update_owner(&self, owner: &Session);

    /// Forget everything `conn_id` offered.
    fn remove_owner(&self, conn_id: ConnId);
}

/// Answers `GetSources` queries.
pub trait SourcesResponder: Send + Sync {
    /// `query` is the raw request payload.
    fn send_found_sources(&self, asker: &Session, query: &[u8]);
}

/// Collaborators the dispatch layer hands work to.
#[derive(Clone)]
pub struct Services {
    pub files: Arc<dyn FileIndex>,
    pub sources: Arc<dyn SourcesResponder>,
}

impl Services {
    /// Both collaborators backed by one [`MemoryFileIndex`].
    pub fn in_memory() -> (Self, Arc<MemoryFileIndex>) {
        let index = Arc::new(MemoryFileIndex::default());
        let services = Self {
            files: index.clone(),
            sources: index.clone(),
        };
        (services, index)
    }
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub file_type: u8,
    owners: HashSet<ConnId>,
}

impl FileEntry {
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }
}

#[derive(Debug, Default)]
struct OwnerEntry {
    source: Option<Source>,
    files: HashSet<FileHash>,
}

/// In-memory index keyed by file hash.
///
/// Locks are never held across the two maps at once.
#[derive(Debug, Default)]
pub struct MemoryFileIndex {
    files: DashMap<FileHash, FileEntry>,
    owners: DashMap<ConnId, OwnerEntry>,
}

impl MemoryFileIndex {
    pub fn file(&self, hash: &FileHash) -> Option<FileEntry> {
        self.files.get(hash).map(|e| e.clone())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Sources of `hash` with an assigned id, except `exclude`.
    pub fn sources(&self, hash: &FileHash, exclude: ConnId) -> Vec<Source> {
        let owners: Vec<ConnId> = match self.files.get(hash) {
            Some(entry) => entry.owners.iter().copied().filter(|&c| c != exclude).collect(),
            None => return Vec::new(),
        };

        owners
            .into_iter()
            .filter_map(|c| self.owners.get(&c).and_then(|o| o.source))
            .filter(|s| s.client_id != 0)
            .take(MAX_FOUND_SOURCES)
            .collect()
    }
}

fn owner_source(owner: &Session) -> Option<Source> {
    (owner.client_id != 0).then(|| owner.source())
}

impl FileIndex for MemoryFileIndex {
    fn add(&self, file: &OfferedFile, owner: &Session) {
        if file.is_complete_source() {
            trace!(conn_id = owner.conn_id, hash = %hex::encode(file.hash), "Complete source offered");
        }

        {
            let mut entry = self.owners.entry(owner.conn_id).or_default();
            entry.source = owner_source(owner);
            entry.files.insert(file.hash);
        }

        let mut entry = self.files.entry(file.hash).or_insert_with(|| FileEntry {
            name: file.name.clone(),
            size: file.size,
            file_type: file.file_type,
            owners: HashSet::new(),
        });
        entry.owners.insert(owner.conn_id);
    }

    fn update_owner(&self, owner: &Session) {
        if let Some(mut entry) = self.owners.get_mut(&owner.conn_id) {
            entry.source = owner_source(owner);
        }
    }

    fn remove_owner(&self, conn_id: ConnId) {
        let Some((_, owner)) = self.owners.remove(&conn_id) else {
            return;
        };
        for hash in owner.files {
            self.files.remove_if_mut(&hash, |_, entry| {
                entry.owners.remove(&conn_id);
                entry.owners.is_empty()
            });
        }
        debug!(conn_id, files = self.files.len(), "Owner removed from file index");
    }
}

impl SourcesResponder for MemoryFileIndex {
    fn send_found_sources(&self, asker: &Session, query: &[u8]) {
        let Some(hash) = query.get(..HASH_LEN).and_then(|h| FileHash::try_from(h).ok()) else {
            debug!(conn_id = asker.conn_id, len = query.len(), "GetSources query too short");
            return;
        };

        let sources = self.sources(&hash, asker.conn_id);
        trace!(conn_id = asker.conn_id, hash = %hex::encode(hash), count = sources.len(), "Found sources");
        if let Err(e) = try_send_msg(&asker.outbound, &FoundSources { hash, sources }) {
            debug!(conn_id = asker.conn_id, error = %e, "Dropping FoundSources");
        }
    }
}
