// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! The value-file: the persistent store of entities across runs.
//!
//! In memory this is a two-level content-addressed index: entities live in
//! buckets keyed by a hash of their name, and a flat key map gives each
//! persisted entity an opaque handle. The same key only ever maps to one
//! entity, and the same name only ever has one live key.
//!
//! On disk the index is a bincode snapshot with a version header, rewritten
//! atomically (write to a temporary file, then rename) whenever it is
//! flushed. Readers therefore see either the pre-write or the post-write
//! state, never a torn one. The rewrite also acts as compaction: pairs that
//! were replaced or removed during the run simply don't appear in the new
//! snapshot. If anything about the on-disk data looks wrong — unknown
//! version, truncated data — the store is discarded and rebuilt rather than
//! repaired, which keeps things robust if something funny happens.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tectonic_errors::{anyhow::Context, prelude::*};
use tectonic_status_base::{tt_warning, StatusBackend};
use tempfile::NamedTempFile;

use crate::entity::{bucket_of, Entity};

/// The opaque handle of one persisted entity.
///
/// Keys are assigned by the value-file and mean nothing to callers; they are
/// only useful for fetching the same entity back later.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct ValueKey(u128);

impl ValueKey {
    /// A placeholder used while assembling key lists; never stored.
    pub(crate) const UNASSIGNED: ValueKey = ValueKey(0);
}

/// Bump this if the snapshot layout changes in a way that should invalidate
/// all previously saved state.
const FORMAT_VERSION: u32 = 1;

const MAGIC: [u8; 8] = *b"gmvfile\0";

#[derive(Deserialize, Serialize)]
struct SnapshotHeader {
    magic: [u8; 8],
    version: u32,
}

#[derive(Deserialize, Serialize)]
struct SnapshotRecord {
    key: ValueKey,
    bucket: u64,
    entity: Entity,
}

/// The persistent entity store.
#[derive(Debug)]
pub struct ValueFile {
    path: PathBuf,
    buckets: HashMap<u64, Vec<(ValueKey, Entity)>>,
    keys: HashMap<ValueKey, Entity>,
    next_key: u128,
}

impl ValueFile {
    /// Open a value-file, loading any previously saved snapshot.
    ///
    /// Errors loading the saved data are reported to the status backend but
    /// not propagated: the store proceeds as if the saved state were simply
    /// missing, and the next flush will overwrite it.
    pub fn open(path: impl Into<PathBuf>, status: &mut dyn StatusBackend) -> Result<Self> {
        let path = path.into();

        let mut vfile = ValueFile {
            path,
            buckets: HashMap::new(),
            keys: HashMap::new(),
            next_key: 0,
        };

        let records = match fs::File::open(&vfile.path) {
            Ok(mut f) => {
                let header: std::result::Result<SnapshotHeader, _> =
                    bincode::deserialize_from(&mut f);

                match header {
                    Ok(h) if h.magic == MAGIC && h.version == FORMAT_VERSION => {
                        match bincode::deserialize_from::<_, Vec<SnapshotRecord>>(&mut f) {
                            Ok(recs) => recs,
                            Err(e) => {
                                tt_warning!(status, "error deserializing value-file `{}`; discarding it", vfile.path.display(); e.into());
                                Vec::new()
                            }
                        }
                    }

                    Ok(h) => {
                        tt_warning!(
                            status,
                            "value-file `{}` has format version {}, expected {}; discarding it",
                            vfile.path.display(),
                            h.version,
                            FORMAT_VERSION
                        );
                        Vec::new()
                    }

                    Err(e) => {
                        tt_warning!(status, "error reading value-file header from `{}`; discarding it", vfile.path.display(); e.into());
                        Vec::new()
                    }
                }
            }

            Err(ref e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).context(format!("failed to open `{}`", vfile.path.display()))
            }
        };

        for rec in records {
            vfile.next_key = vfile.next_key.max(rec.key.0);
            vfile
                .buckets
                .entry(rec.bucket)
                .or_insert_with(Vec::new)
                .push((rec.key, rec.entity.clone()));
            vfile.keys.insert(rec.key, rec.entity);
        }

        Ok(vfile)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn assign_key(&mut self) -> ValueKey {
        self.next_key += 1;
        ValueKey(self.next_key)
    }

    fn bucket_pair(&self, name_bytes: &[u8]) -> Option<&(ValueKey, Entity)> {
        let id = crate::entity::digest_of(name_bytes);
        let pairs = self.buckets.get(&bucket_of(&id))?;
        pairs.iter().find(|(_, e)| e.name_bytes() == name_bytes)
    }

    /// Find the persisted entity with the same name as the given one.
    pub fn find_entity(&self, entity: &Entity) -> Option<&Entity> {
        self.find_entity_by_name(entity.name_bytes())
    }

    /// Find a persisted entity by its raw name bytes.
    pub fn find_entity_by_name(&self, name_bytes: &[u8]) -> Option<&Entity> {
        self.bucket_pair(name_bytes).map(|(_, e)| e)
    }

    /// Find the key under which an entity with this name is persisted.
    pub fn find_entity_key(&self, entity: &Entity) -> Option<ValueKey> {
        self.bucket_pair(entity.name_bytes()).map(|(k, _)| *k)
    }

    pub fn get_entity_by_key(&self, key: ValueKey) -> Option<&Entity> {
        self.keys.get(&key)
    }

    /// Insert an entity, replacing any persisted entity with the same name.
    ///
    /// A replaced pair's old key is dropped; the entity is reachable only
    /// through the freshly assigned key returned here.
    pub fn add_entity(&mut self, entity: Entity) -> ValueKey {
        let id = entity.id();
        let key = self.assign_key();

        let pairs = self.buckets.entry(bucket_of(&id)).or_insert_with(Vec::new);

        match pairs
            .iter()
            .position(|(_, e)| e.name_bytes() == entity.name_bytes())
        {
            Some(idx) => {
                let old_key = pairs[idx].0;
                self.keys.remove(&old_key);
                pairs[idx] = (key, entity.clone());
            }
            None => {
                pairs.push((key, entity.clone()));
            }
        }

        self.keys.insert(key, entity);
        key
    }

    /// Insert several entities, returning their keys in order.
    pub fn add_entities(&mut self, entities: impl IntoIterator<Item = Entity>) -> Vec<ValueKey> {
        entities.into_iter().map(|e| self.add_entity(e)).collect()
    }

    /// Drop the entity stored under `key` and persist `entity` in its place,
    /// under a fresh key.
    pub fn replace_entity(&mut self, key: ValueKey, entity: Entity) -> ValueKey {
        self.remove_key(key);
        self.add_entity(entity)
    }

    /// Remove the entity stored under `key`, if any.
    pub fn remove_key(&mut self, key: ValueKey) -> Option<Entity> {
        let entity = self.keys.remove(&key)?;
        let bucket = bucket_of(&entity.id());

        if let Some(pairs) = self.buckets.get_mut(&bucket) {
            if let Some(idx) = pairs.iter().position(|(k, _)| *k == key) {
                pairs.remove(idx);
            }

            if pairs.is_empty() {
                self.buckets.remove(&bucket);
            }
        }

        Some(entity)
    }

    /// Remove the persisted entity with the same name as the given one,
    /// returning the key it was stored under.
    pub fn remove_entity(&mut self, entity: &Entity) -> Option<ValueKey> {
        let key = self.find_entity_key(entity)?;
        self.remove_key(key);
        Some(key)
    }

    /// Verify the internal consistency of the two-level index.
    pub fn self_test(&self) -> Result<()> {
        let mut size = 0;

        for (bucket_id, pairs) in &self.buckets {
            for (key, entity) in pairs {
                size += 1;

                ensure!(
                    bucket_of(&entity.id()) == *bucket_id,
                    "entity `{}` filed in the wrong bucket",
                    entity.name()
                );

                let by_key = a_ok_or!(
                    self.keys.get(key);
                    ["bucket pair for `{}` has no key entry", entity.name()]
                );

                ensure!(
                    by_key == entity,
                    "key entry for `{}` disagrees with its bucket pair",
                    entity.name()
                );
            }
        }

        ensure!(
            size == self.keys.len(),
            "value-file index size mismatch: {} bucket pairs vs {} keys",
            size,
            self.keys.len()
        );

        Ok(())
    }

    /// Write the current state to disk, atomically replacing any previous
    /// snapshot.
    pub fn flush(&self) -> Result<()> {
        let records: Vec<SnapshotRecord> = self
            .buckets
            .iter()
            .flat_map(|(bucket, pairs)| {
                let bucket = *bucket;
                pairs.iter().map(move |(key, entity)| SnapshotRecord {
                    key: *key,
                    bucket,
                    entity: entity.clone(),
                })
            })
            .collect();

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));

        atry!(
            fs::create_dir_all(dir);
            ["failed to create directory tree `{}`", dir.display()]
        );

        let mut tmp = atry!(
            NamedTempFile::new_in(dir);
            ["failed to create a temporary file in `{}`", dir.display()]
        );

        atry!(
            bincode::serialize_into(
                &mut tmp,
                &SnapshotHeader {
                    magic: MAGIC,
                    version: FORMAT_VERSION,
                }
            );
            ["failed to serialize value-file header"]
        );

        atry!(
            bincode::serialize_into(&mut tmp, &records);
            ["failed to serialize value-file records"]
        );

        atry!(
            tmp.persist(&self.path);
            ["failed to persist value-file to `{}`", self.path.display()]
        );

        Ok(())
    }
}
