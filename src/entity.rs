// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! Entities: immutable, content-addressed build values.
//!
//! An entity pairs a stable *name* (its identity) with a *signature*, a
//! digest of its current content. Two entities with equal id and equal
//! signature are interchangeable for build purposes. A missing signature
//! means the content could not be fingerprinted; such an entity is never
//! actual.
//!
//! Three kinds of entity exist: files on disk ([`FileEntity`]), plain tagged
//! values ([`SimpleEntity`]), and the saved records of executed build units
//! ([`NodeRecord`]). All three are persisted uniformly in the value-file.

use md5::Digest;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    convert::TryInto,
    fs, io,
    path::Path,
    time::UNIX_EPOCH,
};

use crate::{vfile::ValueKey, DigestComputer, DigestData};

/// The stable identity of an entity: the digest of its name.
pub type EntityId = DigestData;

/// A set of string tags attached to an entity.
///
/// Tags carry no meaning for the core; they exist so that filters can select
/// subsets of a node's targets.
pub type Tags = BTreeSet<String>;

/// Compute the digest of a byte string.
pub(crate) fn digest_of(bytes: &[u8]) -> DigestData {
    let mut dc = DigestComputer::new();
    dc.update(bytes);
    dc.finalize()
}

/// The value-file bucket an entity id falls into.
pub(crate) fn bucket_of(id: &EntityId) -> u64 {
    u64::from_le_bytes(id[..8].try_into().unwrap())
}

/// How a [`FileEntity`] fingerprints the file content.
///
/// The policy is chosen at construction and fixed for the entity's lifetime.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SignaturePolicy {
    /// Digest of the file's mtime and size. Cheap but coarse.
    Timestamp,

    /// Digest of the file's content. Exact.
    Checksum,
}

fn probe_file_signature(path: &Path, policy: SignaturePolicy) -> Option<DigestData> {
    match policy {
        SignaturePolicy::Checksum => {
            let mut f = fs::File::open(path).ok()?;
            let mut dc = DigestComputer::new();
            io::copy(&mut f, &mut dc).ok()?;
            Some(dc.finalize())
        }

        SignaturePolicy::Timestamp => {
            let md = fs::metadata(path).ok()?;
            let mtime = md.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;

            let mut dc = DigestComputer::new();
            dc.update(mtime.as_secs().to_le_bytes());
            dc.update(mtime.subsec_nanos().to_le_bytes());
            dc.update(md.len().to_le_bytes());
            Some(dc.finalize())
        }
    }
}

/// An entity backed by a file on disk.
///
/// The name is the file's path, so the entity's identity is stable while its
/// signature tracks the file content under the chosen policy.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FileEntity {
    path: String,
    policy: SignaturePolicy,
    signature: Option<DigestData>,
    tags: Tags,
}

impl FileEntity {
    /// Create a file entity, probing the file to compute its signature.
    ///
    /// A missing or unreadable file yields an entity without a signature,
    /// which is never actual.
    pub fn new(path: impl AsRef<Path>, policy: SignaturePolicy) -> Self {
        let path = path.as_ref();
        let signature = probe_file_signature(path, policy);

        FileEntity {
            path: path.to_string_lossy().into_owned(),
            policy,
            signature,
            tags: Tags::new(),
        }
    }

    /// Attach tags to this entity.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.path)
    }

    pub fn path_str(&self) -> &str {
        &self.path
    }

    pub fn policy(&self) -> SignaturePolicy {
        self.policy
    }

    pub fn signature(&self) -> Option<&DigestData> {
        self.signature.as_ref()
    }

    /// Recompute the signature from the live file and compare with the stored
    /// one. True iff they are equal and non-empty.
    pub fn is_actual(&self) -> bool {
        match &self.signature {
            None => false,
            Some(sig) => probe_file_signature(self.path(), self.policy).as_ref() == Some(sig),
        }
    }

    /// Return an entity reflecting the file's current state: self if actual,
    /// otherwise a freshly probed equivalent.
    pub fn get_actual(&self) -> FileEntity {
        let fresh = probe_file_signature(self.path(), self.policy);

        if fresh == self.signature {
            self.clone()
        } else {
            FileEntity {
                signature: fresh,
                ..self.clone()
            }
        }
    }
}

/// An entity holding a plain serialized value.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SimpleEntity {
    name: String,
    payload: Vec<u8>,
    signature: Option<DigestData>,
    tags: Tags,
}

impl SimpleEntity {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let signature = Some(digest_of(&payload));

        SimpleEntity {
            name: name.into(),
            payload,
            signature,
            tags: Tags::new(),
        }
    }

    /// A simple entity whose name and value are the same text. Used by the
    /// dirname/basename filters for derived path fragments.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        SimpleEntity::new(value.clone(), value.into_bytes())
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn signature(&self) -> Option<&DigestData> {
        self.signature.as_ref()
    }
}

/// The persisted record of one executed build unit.
///
/// This is the replay form: it carries just enough to decide whether the
/// saved targets can be reused (the input fingerprint, the targets, the side
/// effects, and the value-file keys of the implicit dependencies) without
/// recomputing anything from the builder.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeRecord {
    pub(crate) name: DigestData,
    pub(crate) signature: Option<DigestData>,
    pub(crate) target_entities: Option<Vec<Entity>>,
    pub(crate) itarget_entities: Vec<Entity>,
    pub(crate) idep_keys: Vec<ValueKey>,
}

impl NodeRecord {
    pub fn name(&self) -> &DigestData {
        &self.name
    }

    pub fn signature(&self) -> Option<&DigestData> {
        self.signature.as_ref()
    }

    pub fn target_entities(&self) -> Option<&[Entity]> {
        self.target_entities.as_deref()
    }

    pub fn itarget_entities(&self) -> &[Entity] {
        &self.itarget_entities
    }

    pub fn idep_keys(&self) -> &[ValueKey] {
        &self.idep_keys
    }
}

/// Any entity: a file, a plain value, or a saved node record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Entity {
    File(FileEntity),
    Simple(SimpleEntity),
    Node(NodeRecord),
}

impl Entity {
    /// The raw bytes of this entity's name.
    pub fn name_bytes(&self) -> &[u8] {
        match self {
            Entity::File(f) => f.path_str().as_bytes(),
            Entity::Simple(s) => s.name().as_bytes(),
            Entity::Node(n) => &n.name[..],
        }
    }

    /// A printable form of this entity's name.
    pub fn name(&self) -> String {
        match self {
            Entity::File(f) => f.path_str().to_owned(),
            Entity::Simple(s) => s.name().to_owned(),
            Entity::Node(n) => format!("{:x}", n.name),
        }
    }

    /// The stable identity of this entity: the digest of its name.
    pub fn id(&self) -> EntityId {
        digest_of(self.name_bytes())
    }

    pub fn signature(&self) -> Option<&DigestData> {
        match self {
            Entity::File(f) => f.signature(),
            Entity::Simple(s) => s.signature(),
            Entity::Node(n) => n.signature(),
        }
    }

    pub fn tags(&self) -> Option<&Tags> {
        match self {
            Entity::File(f) => Some(&f.tags),
            Entity::Simple(s) => Some(&s.tags),
            Entity::Node(_) => None,
        }
    }

    /// The entity's value as a path-like string, when it has one. Node
    /// records don't.
    pub fn value_str(&self) -> Option<&str> {
        match self {
            Entity::File(f) => Some(f.path_str()),
            Entity::Simple(s) => std::str::from_utf8(s.payload()).ok(),
            Entity::Node(_) => None,
        }
    }

    /// Recompute the signature from the live source and compare with the
    /// stored one. True iff equal and non-empty.
    pub fn is_actual(&self) -> bool {
        match self {
            Entity::File(f) => f.is_actual(),
            Entity::Simple(s) => s.signature.is_some(),
            Entity::Node(n) => n.signature.is_some(),
        }
    }

    /// Return self if actual, otherwise an equivalent entity freshly computed
    /// from the source. Plain values and node records carry their content
    /// with them, so for those this is a clone.
    pub fn get_actual(&self) -> Entity {
        match self {
            Entity::File(f) => Entity::File(f.get_actual()),
            other => other.clone(),
        }
    }
}

impl From<FileEntity> for Entity {
    fn from(f: FileEntity) -> Self {
        Entity::File(f)
    }
}

impl From<SimpleEntity> for Entity {
    fn from(s: SimpleEntity) -> Self {
        Entity::Simple(s)
    }
}

impl From<NodeRecord> for Entity {
    fn from(n: NodeRecord) -> Self {
        Entity::Node(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn checksum_entity_tracks_content() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("data.txt");
        fs::write(&p, "1234567890").unwrap();

        let v1 = FileEntity::new(&p, SignaturePolicy::Checksum);
        let v2 = FileEntity::new(&p, SignaturePolicy::Checksum);

        assert!(v1 == v2);
        assert!(v1.is_actual());

        fs::write(&p, "0987654321").unwrap();
        assert!(!v1.is_actual());

        let v3 = FileEntity::new(&p, SignaturePolicy::Checksum);
        assert!(v1.path() == v3.path());
        assert!(v1 != v3);
        assert!(v3.is_actual());

        let refreshed = v1.get_actual();
        assert!(refreshed == v3);
    }

    #[test]
    fn timestamp_entity_tracks_mtime() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("data.txt");
        fs::write(&p, "1234567890").unwrap();

        let v1 = FileEntity::new(&p, SignaturePolicy::Timestamp);
        assert!(v1.is_actual());

        // Same size, different mtime: the timestamp policy must notice.
        filetime::set_file_mtime(&p, filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();
        assert!(!v1.is_actual());

        let v2 = FileEntity::new(&p, SignaturePolicy::Timestamp);
        assert!(v1.path() == v2.path());
        assert!(v1 != v2);
    }

    #[test]
    fn missing_file_has_no_signature() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("never-created");

        let v = FileEntity::new(&p, SignaturePolicy::Checksum);
        assert!(v.signature().is_none());
        assert!(!v.is_actual());

        let t = FileEntity::new(&p, SignaturePolicy::Timestamp);
        assert!(t.signature().is_none());
        assert!(!t.is_actual());
    }

    #[test]
    fn simple_entity_signature_is_deterministic() {
        let v1 = SimpleEntity::new("results_link", &b"http://example.com/results.out"[..]);
        let v2 = SimpleEntity::new("results_link", &b"http://example.com/results.out"[..]);

        assert!(v1 == v2);
        assert!(v1.signature().is_some());

        let v3 = SimpleEntity::new("results_link", &b"something else"[..]);
        assert!(v1 != v3);
        assert!(Entity::from(v1).id() == Entity::from(v3).id());
    }

    #[test]
    fn entity_ids_follow_names() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("a.txt");
        fs::write(&p, "a").unwrap();

        let e1 = Entity::from(FileEntity::new(&p, SignaturePolicy::Checksum));
        let e2 = Entity::from(FileEntity::new(&p, SignaturePolicy::Timestamp));

        // Identity is derived from the name alone; the signatures differ.
        assert!(e1.id() == e2.id());
        assert!(e1.signature() != e2.signature());
    }
}
