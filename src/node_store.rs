//! The collaborator-facing entry point: an immutable tree of nodes, edited
//! through a base-independent [`NodeBuilder`] and committed with
//! [`NodeStore::merge`]. Everything below this module — the record codec,
//! the writer pool, the store — exists to make this contract possible.
//!
//! `NodeBuilder` deliberately never binds itself to a specific base
//! snapshot: it only records *edits* (`set`/`remove` on properties and
//! children). That lets [`merge`](NodeStore::merge) replay the exact same
//! builder against a freshly read head on a `CommitConflict` retry, without
//! a separate diff/patch representation or a rebase algorithm — each retry
//! simply re-runs [`write_tree`] with the same edits layered onto whatever
//! the current head turns out to be.

use crate::checkpoints::{CheckpointId, Checkpoints};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::id::{RecordId, SegmentId, SegmentKind, Version};
use crate::record::map::{map_get, map_iter, map_put, map_remove, write_map};
use crate::record::node::{read_node, write_node, Node};
use crate::record::property::{self, read_property, write_multi, write_single, write_single_external, Property, PropertyType, PropertyValues};
use crate::record::template::{read_template, write_template, PropertyDescriptor, Template};
use crate::record::RecordType;
use crate::segment::{Builder, Segment};
use crate::store::Store;
use crate::writer_pool::{BufferedWriter, SegmentSink};
use std::collections::BTreeMap;
use std::time::Duration;

/// Writer pool key under which every node-store commit (and the initial
/// bootstrap) buffers its records.
const WRITER_PURPOSE: &str = "node-store";

/// Largest chunk of raw bytes written into a single `Bulk` segment by
/// [`NodeStore::create_blob`]. Blobs bypass `record/block.rs`'s
/// `MAX_BLOCK_SIZE`-capped chunking entirely: that format is meant for
/// small in-record byte strings, not multi-megabyte binary properties, so a
/// blob's chunks are written as raw records directly on a dedicated `Bulk`
/// segment, one chunk per segment.
const BULK_CHUNK_SIZE: usize = 192 * 1024;

/// A read-only view of one node in a committed (or checkpointed) tree.
///
/// Cheap to clone — it is just a [`Store`] handle plus the node's
/// [`RecordId`] — and every accessor re-reads from the store rather than
/// caching, matching the read-mostly, append-only nature of the underlying
/// segments.
#[derive(Clone)]
pub struct NodeState {
    store: Store,
    record_id: RecordId,
}

impl NodeState {
    #[must_use]
    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    fn segment(&self) -> Result<Segment> {
        self.store.read_segment(self.record_id.segment_id)
    }

    fn node(&self) -> Result<Node> {
        let segment = self.segment()?;
        read_node(&segment, self.record_id.offset)
    }

    fn template(&self) -> Result<Template> {
        let node = self.node()?;
        let segment = self.store.read_segment(node.template.segment_id)?;
        read_template(&self.store, &segment, node.template.offset)
    }

    /// Every property name declared by this node's template, in template
    /// (not necessarily alphabetical) order.
    pub fn property_names(&self) -> Result<Vec<String>> {
        Ok(self.template()?.properties.into_iter().map(|p| p.name).collect())
    }

    pub fn get_property(&self, name: &str) -> Result<Option<Property>> {
        let node = self.node()?;
        let template = self.template()?;
        let Some(idx) = template.properties.iter().position(|p| p.name == name) else {
            return Ok(None);
        };
        let prop_id = node.properties[idx];
        let segment = self.store.read_segment(prop_id.segment_id)?;
        Ok(Some(read_property(&self.store, &segment, prop_id.offset)?))
    }

    /// `true` if `name` names a `Binary` property currently backed by an
    /// external blob reference (as opposed to an inline value).
    pub fn is_property_external(&self, name: &str) -> Result<bool> {
        let node = self.node()?;
        let template = self.template()?;
        let Some(idx) = template.properties.iter().position(|p| p.name == name) else {
            return Ok(false);
        };
        let prop_id = node.properties[idx];
        let segment = self.store.read_segment(prop_id.segment_id)?;
        property::is_single_external(&self.store, &segment, prop_id.offset)
    }

    pub fn child_names(&self) -> Result<Vec<String>> {
        let node = self.node()?;
        let Some(map_id) = node.child_map else {
            return Ok(Vec::new());
        };
        let segment = self.store.read_segment(map_id.segment_id)?;
        let entries = map_iter(&self.store, &segment, map_id.offset)?;
        entries
            .into_iter()
            .map(|(key, _)| String::from_utf8(key).map_err(|e| Error::Decode(format!("child name not utf-8: {e}"))))
            .collect()
    }

    pub fn get_child(&self, name: &str) -> Result<Option<NodeState>> {
        let node = self.node()?;
        let Some(map_id) = node.child_map else {
            return Ok(None);
        };
        let segment = self.store.read_segment(map_id.segment_id)?;
        match map_get(&self.store, &segment, map_id.offset, name.as_bytes())? {
            Some(child_id) => Ok(Some(NodeState {
                store: self.store.clone(),
                record_id: child_id,
            })),
            None => Ok(None),
        }
    }
}

#[derive(Clone, Debug)]
enum PropertyEdit {
    Set(PropertyType, PropertyValues),
    SetBlob(String),
    Remove,
}

#[derive(Clone, Debug)]
enum ChildEdit {
    /// Edit a child in place. `fresh` means "ignore whatever base child of
    /// this name exists, start from empty" (a `setChildNode` overwrite);
    /// otherwise the child's base carries forward unedited properties and
    /// grandchildren the same way the parent does.
    Edit { builder: NodeBuilder, fresh: bool },
    Remove,
}

/// A base-independent tree of pending edits.
///
/// Unlike a builder bound to the snapshot it was opened against, which must
/// be rebased with a diff algorithm on conflict, this `NodeBuilder` only
/// ever records *what changed* — it carries no reference to a base
/// snapshot at all. [`NodeStore::merge`] supplies the base at commit time
/// and can supply a different one on each retry.
#[derive(Clone, Debug, Default)]
pub struct NodeBuilder {
    properties: BTreeMap<String, PropertyEdit>,
    children: BTreeMap<String, ChildEdit>,
}

impl NodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_property(&mut self, name: impl Into<String>, property_type: PropertyType, values: PropertyValues) -> &mut Self {
        self.properties.insert(name.into(), PropertyEdit::Set(property_type, values));
        self
    }

    /// Sets a `Binary` property backed by a blob id previously returned by
    /// [`NodeStore::create_blob`].
    pub fn set_blob_property(&mut self, name: impl Into<String>, blob_id: impl Into<String>) -> &mut Self {
        self.properties.insert(name.into(), PropertyEdit::SetBlob(blob_id.into()));
        self
    }

    pub fn remove_property(&mut self, name: &str) -> &mut Self {
        self.properties.insert(name.to_string(), PropertyEdit::Remove);
        self
    }

    /// Returns an edit handle for `name`'s child, creating one that carries
    /// forward whatever base child exists at commit time if this is the
    /// first edit under that name.
    pub fn child_node(&mut self, name: &str) -> &mut NodeBuilder {
        let entry = self
            .children
            .entry(name.to_string())
            .or_insert_with(|| ChildEdit::Edit {
                builder: NodeBuilder::new(),
                fresh: false,
            });
        if matches!(entry, ChildEdit::Remove) {
            *entry = ChildEdit::Edit {
                builder: NodeBuilder::new(),
                fresh: false,
            };
        }
        match entry {
            ChildEdit::Edit { builder, .. } => builder,
            ChildEdit::Remove => unreachable!("just replaced above"),
        }
    }

    /// Like [`Self::child_node`], but discards any base child of this name:
    /// the child starts empty regardless of what (if anything) already
    /// exists there when this builder is eventually merged.
    pub fn set_child_node(&mut self, name: &str) -> &mut NodeBuilder {
        self.children.insert(
            name.to_string(),
            ChildEdit::Edit {
                builder: NodeBuilder::new(),
                fresh: true,
            },
        );
        match self.children.get_mut(name) {
            Some(ChildEdit::Edit { builder, .. }) => builder,
            _ => unreachable!("just inserted above"),
        }
    }

    pub fn remove_child_node(&mut self, name: &str) -> &mut Self {
        self.children.insert(name.to_string(), ChildEdit::Remove);
        self
    }
}

enum ResolvedProperty {
    Inline(PropertyType, PropertyValues),
    Blob(String),
}

/// Recursively writes the tree described by `builder` (edits) layered onto
/// `base` (the unedited starting point, `None` for a brand-new subtree),
/// returning the freshly written root node's id.
///
/// Children untouched by `builder` are never rewritten — their base
/// `RecordId` is reused as-is, which is what lets an edit to one deep child
/// cost only the path from the root down to it rather than a full tree
/// rewrite.
fn write_tree(bw: &mut BufferedWriter, store: &Store, builder: &NodeBuilder, base: Option<&NodeState>) -> Result<RecordId> {
    let mut resolved: BTreeMap<String, ResolvedProperty> = BTreeMap::new();
    if let Some(base) = base {
        for name in base.property_names()? {
            let Some(prop) = base.get_property(&name)? else { continue };
            if base.is_property_external(&name)? {
                let PropertyValues::Single(bytes) = prop.values else {
                    return Err(Error::Decode(format!("external property {name:?} was not single-valued")));
                };
                let blob_id = String::from_utf8(bytes).map_err(|e| Error::Decode(format!("blob id not utf-8: {e}")))?;
                resolved.insert(name, ResolvedProperty::Blob(blob_id));
            } else {
                resolved.insert(name, ResolvedProperty::Inline(prop.property_type, prop.values));
            }
        }
    }
    for (name, edit) in &builder.properties {
        match edit {
            PropertyEdit::Remove => {
                resolved.remove(name);
            }
            PropertyEdit::Set(property_type, values) => {
                resolved.insert(name.clone(), ResolvedProperty::Inline(*property_type, values.clone()));
            }
            PropertyEdit::SetBlob(blob_id) => {
                resolved.insert(name.clone(), ResolvedProperty::Blob(blob_id.clone()));
            }
        }
    }

    // Children untouched by `builder` are never visited at all: instead of
    // rebuilding the full child map from every name, start from the base
    // node's child map record (if any) and layer a `Diff` per edited name
    // on top of it, so an edit to one child costs one map write rather than
    // a rewrite of every sibling's entry.
    let mut child_map: Option<RecordId> = match base {
        Some(b) => b.node()?.child_map,
        None => None,
    };
    for (name, edit) in &builder.children {
        match edit {
            ChildEdit::Remove => {
                if let Some(map_id) = child_map {
                    let map_segment = store.read_segment(map_id.segment_id)?;
                    let current_segment = bw.current_segment();
                    let new_offset = map_remove(store, bw.builder_mut(), current_segment, &map_segment, map_id.offset, name.as_bytes())?;
                    // `map_remove` is a no-op (returns `map_id.offset` unchanged) when
                    // the key is already absent; in that case the offset is still
                    // relative to `map_id.segment_id`, not necessarily `current_segment`.
                    child_map = Some(if new_offset == map_id.offset {
                        map_id
                    } else {
                        RecordId::new(current_segment, new_offset)
                    });
                }
            }
            ChildEdit::Edit { builder: sub, fresh } => {
                let child_base = if *fresh {
                    None
                } else {
                    match base {
                        Some(b) => b.get_child(name)?,
                        None => None,
                    }
                };
                let child_id = write_tree(bw, store, sub, child_base.as_ref())?;
                let current_segment = bw.current_segment();
                child_map = Some(match child_map {
                    Some(map_id) => {
                        let map_segment = store.read_segment(map_id.segment_id)?;
                        let new_offset = map_put(
                            bw.builder_mut(),
                            current_segment,
                            map_segment.id(),
                            map_id.offset,
                            name.as_bytes(),
                            child_id,
                        )?;
                        RecordId::new(current_segment, new_offset)
                    }
                    None => {
                        let offset = write_map(bw.builder_mut(), current_segment, vec![(name.clone().into_bytes(), child_id)])?;
                        RecordId::new(current_segment, offset)
                    }
                });
            }
        }
        bw.seal_if_full(store)?;
    }

    let mut prop_descriptors = Vec::with_capacity(resolved.len());
    let mut prop_ids = Vec::with_capacity(resolved.len());
    for (name, value) in &resolved {
        let current_segment = bw.current_segment();
        let (property_type, offset) = match value {
            ResolvedProperty::Inline(property_type, PropertyValues::Single(bytes)) => (
                *property_type,
                write_single(bw.builder_mut(), current_segment, *property_type, bytes)?,
            ),
            ResolvedProperty::Inline(property_type, PropertyValues::Multi(values)) => (
                *property_type,
                write_multi(bw.builder_mut(), current_segment, *property_type, values)?,
            ),
            ResolvedProperty::Blob(blob_id) => {
                for (chunk_id, _) in decode_blob_id(blob_id)? {
                    bw.builder_mut().add_ref(chunk_id)?;
                }
                (
                    PropertyType::Binary,
                    write_single_external(bw.builder_mut(), current_segment, PropertyType::Binary, blob_id)?,
                )
            }
        };
        prop_descriptors.push(PropertyDescriptor {
            name: name.clone(),
            property_type,
        });
        prop_ids.push(RecordId::new(current_segment, offset));
        bw.seal_if_full(store)?;
    }

    // Template and node share whatever segment is live after the child map
    // writes above; no seal happens between them so `current_segment` stays
    // valid for both.
    let current_segment = bw.current_segment();
    let template = Template {
        properties: prop_descriptors,
        primary_type: None,
        mixin_types: Vec::new(),
        child_name: None,
    };
    let template_offset = write_template(bw.builder_mut(), current_segment, &template)?;
    let template_id = RecordId::new(current_segment, template_offset);

    let node_offset = write_node(bw.builder_mut(), current_segment, template_id, &prop_ids, child_map)?;
    bw.add_root(RecordType::Node, node_offset);
    bw.seal_if_full(store)?;

    Ok(RecordId::new(current_segment, node_offset))
}

/// Details about a [`NodeStore::merge`] commit, passed through to a
/// [`CommitHook`].
#[derive(Clone, Debug)]
pub struct CommitInfo {
    pub user_id: String,
    pub message: Option<String>,
}

impl CommitInfo {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Observes successful commits made via `merge(builder, hook, info)`.
pub trait CommitHook: Send + Sync {
    fn process_commit(&self, before: &NodeState, after: &NodeState, info: &CommitInfo) -> Result<()>;
}

/// The default [`CommitHook`] — observes nothing, same default/observable
/// split as [`crate::gc::monitor::NoopGcMonitor`].
pub struct NoopCommitHook;

impl CommitHook for NoopCommitHook {
    fn process_commit(&self, _before: &NodeState, _after: &NodeState, _info: &CommitInfo) -> Result<()> {
        Ok(())
    }
}

/// The collaborator-facing entry point: an immutable node tree plus
/// checkpoints, layered on top of a [`Store`].
pub struct NodeStore {
    store: Store,
    checkpoints: Checkpoints,
}

impl NodeStore {
    /// Opens (or creates) the repository described by `config` and
    /// bootstraps an empty root if it has never been committed to.
    pub fn open(config: Config) -> Result<Self> {
        let store = Store::open(config)?;
        Self::from_store(store)
    }

    /// Wraps an already-open [`Store`], bootstrapping an empty root if
    /// needed.
    pub fn from_store(store: Store) -> Result<Self> {
        let checkpoints = Checkpoints::open(store.clone())?;
        let node_store = Self { store, checkpoints };
        node_store.bootstrap_root()?;
        Ok(node_store)
    }

    fn bootstrap_root(&self) -> Result<()> {
        if self.store.head().is_some() {
            return Ok(());
        }

        let generation = self.store.current_generation();
        let root_id = self
            .store
            .writer_pool()
            .with_writer(WRITER_PURPOSE, generation, 0, |bw| write_tree(bw, &self.store, &NodeBuilder::new(), None))?;
        self.store.flush()?;

        match self.store.compare_and_set_head(None, root_id) {
            Ok(()) | Err(Error::CommitConflict) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The current committed root.
    pub fn get_root(&self) -> Result<NodeState> {
        let head = self.store.head().ok_or_else(|| Error::Corruption("repository has no head".into()))?;
        Ok(NodeState {
            store: self.store.clone(),
            record_id: head,
        })
    }

    /// A fresh, unattached [`NodeBuilder`] ready to accumulate edits for a
    /// future [`Self::merge`] call.
    #[must_use]
    pub fn root_builder(&self) -> NodeBuilder {
        NodeBuilder::new()
    }

    /// Commits `builder`'s edits atop the current head. On a
    /// [`Error::CommitConflict`] (another writer committed first), rereads
    /// the new head and replays the same builder against it, up to
    /// `gc_options.retry_count` times.
    pub fn merge(&self, builder: &NodeBuilder, hook: &dyn CommitHook, info: &CommitInfo) -> Result<NodeState> {
        let retry_count = self.store.config().gc_options.retry_count;
        let caller = caller_key();
        let mut attempt = 0u32;

        loop {
            let before_id = self.store.head();
            let base = before_id.map(|record_id| NodeState {
                store: self.store.clone(),
                record_id,
            });

            let generation = self.store.current_generation();
            let new_id = self
                .store
                .writer_pool()
                .with_writer(WRITER_PURPOSE, generation, caller, |bw| write_tree(bw, &self.store, builder, base.as_ref()))?;
            self.store.flush()?;

            match self.store.compare_and_set_head(before_id, new_id) {
                Ok(()) => {
                    let after = NodeState {
                        store: self.store.clone(),
                        record_id: new_id,
                    };
                    let before = base.unwrap_or_else(|| after.clone());
                    hook.process_commit(&before, &after, info)?;
                    return Ok(after);
                }
                Err(Error::CommitConflict) => {
                    attempt += 1;
                    if attempt > retry_count {
                        return Err(Error::CommitConflict);
                    }
                    log::debug!("merge lost the head CAS, retrying (attempt {attempt})");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Retains the current head under a fresh checkpoint id for at least
    /// `lifetime`.
    pub fn checkpoint(&self, lifetime: Duration) -> Result<CheckpointId> {
        let head = self.store.head().ok_or_else(|| Error::Corruption("repository has no head".into()))?;
        self.checkpoints.create(head, lifetime)
    }

    /// Resolves a checkpoint id to the root it retained, or `None` if
    /// absent or expired.
    pub fn retrieve(&self, id: CheckpointId) -> Result<Option<NodeState>> {
        let target = self.checkpoints.get(id)?;
        Ok(target.map(|record_id| NodeState {
            store: self.store.clone(),
            record_id,
        }))
    }

    pub fn release_checkpoint(&self, id: CheckpointId) -> Result<bool> {
        self.checkpoints.release(id)
    }

    pub fn checkpoint_ids(&self) -> Result<Vec<CheckpointId>> {
        self.checkpoints.ids()
    }

    pub fn sweep_expired_checkpoints(&self) -> Result<usize> {
        self.checkpoints.sweep_expired()
    }

    /// Writes `bytes` as a chain of `Bulk` segments and returns an opaque
    /// blob id suitable for [`NodeBuilder::set_blob_property`] /
    /// [`Self::read_blob`].
    pub fn create_blob(&self, bytes: &[u8]) -> Result<String> {
        let generation = self.store.current_generation();
        let mut chunks = Vec::new();

        for chunk in bytes.chunks(BULK_CHUNK_SIZE) {
            let segment_id = SegmentId::new_random(SegmentKind::Bulk, Version::CURRENT);
            let mut segment_builder = Builder::new(generation);
            segment_builder.write_record(chunk);
            let (sealed, _) = segment_builder.seal(segment_id)?;
            self.store.write_segment(segment_id, generation, &sealed, &[])?;
            chunks.push((segment_id, chunk.len()));
        }

        Ok(encode_blob_id(&chunks))
    }

    /// Reads back a blob previously written by [`Self::create_blob`].
    pub fn read_blob(&self, blob_id: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (segment_id, len) in decode_blob_id(blob_id)? {
            let segment = self.store.read_segment(segment_id)?;
            out.extend_from_slice(segment.cursor().read_bytes(0, len)?);
        }
        Ok(out)
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }
}

fn caller_key() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

fn encode_blob_id(chunks: &[(SegmentId, usize)]) -> String {
    chunks.iter().map(|(id, len)| format!("{id}:{len}")).collect::<Vec<_>>().join(",")
}

fn decode_blob_id(blob_id: &str) -> Result<Vec<(SegmentId, usize)>> {
    blob_id
        .split(',')
        .filter(|token| !token.is_empty())
        .map(|token| {
            let (id_part, len_part) = token
                .split_once(':')
                .ok_or_else(|| Error::Decode(format!("malformed blob id token {token:?}")))?;
            let segment_id: SegmentId = id_part.parse()?;
            let len: usize = len_part
                .parse()
                .map_err(|e| Error::Decode(format!("bad blob chunk length in {token:?}: {e}")))?;
            Ok((segment_id, len))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use test_log::test;

    #[test]
    fn bootstrap_root_is_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node_store = NodeStore::open(Config::new(dir.path()))?;

        let root = node_store.get_root()?;
        assert!(root.property_names()?.is_empty());
        assert!(root.child_names()?.is_empty());
        node_store.store().close()?;
        Ok(())
    }

    #[test]
    fn merge_sets_property_and_child_visible_after_commit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node_store = NodeStore::open(Config::new(dir.path()))?;

        let mut builder = node_store.root_builder();
        builder.set_property("title", PropertyType::String, PropertyValues::Single(b"hello".to_vec()));
        builder.child_node("a").child_node("b").set_property(
            "count",
            PropertyType::Long,
            PropertyValues::Single(42i64.to_be_bytes().to_vec()),
        );

        let info = CommitInfo::new("tester");
        node_store.merge(&builder, &NoopCommitHook, &info)?;

        let root = node_store.get_root()?;
        let title = root.get_property("title")?.expect("title should be set");
        assert_eq!(title.values, PropertyValues::Single(b"hello".to_vec()));

        let a = root.get_child("a")?.expect("a should exist");
        let b = a.get_child("b")?.expect("b should exist");
        let count = b.get_property("count")?.expect("count should be set");
        assert_eq!(count.property_type, PropertyType::Long);
        match count.values {
            PropertyValues::Single(bytes) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                assert_eq!(i64::from_be_bytes(arr), 42);
            }
            PropertyValues::Multi(_) => panic!("expected single value"),
        }

        node_store.store().close()?;
        Ok(())
    }

    #[test]
    fn merge_leaves_untouched_sibling_intact() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node_store = NodeStore::open(Config::new(dir.path()))?;

        let mut first = node_store.root_builder();
        first.child_node("sibling-a").set_property("marker", PropertyType::String, PropertyValues::Single(b"a".to_vec()));
        node_store.merge(&first, &NoopCommitHook, &CommitInfo::new("t1"))?;

        let mut second = node_store.root_builder();
        second.child_node("sibling-b").set_property("marker", PropertyType::String, PropertyValues::Single(b"b".to_vec()));
        node_store.merge(&second, &NoopCommitHook, &CommitInfo::new("t2"))?;

        let root = node_store.get_root()?;
        assert!(root.get_child("sibling-a")?.is_some());
        assert!(root.get_child("sibling-b")?.is_some());

        node_store.store().close()?;
        Ok(())
    }

    #[test]
    fn concurrent_merges_from_different_threads_all_land() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node_store = NodeStore::open(Config::new(dir.path()).gc_options(crate::config::GcOptions {
            retry_count: 50,
            ..Default::default()
        }))?;

        std::thread::scope(|scope| {
            for i in 0..8 {
                let node_store = &node_store;
                scope.spawn(move || {
                    let mut builder = node_store.root_builder();
                    builder.set_child_node(&format!("child-{i}"));
                    node_store
                        .merge(&builder, &NoopCommitHook, &CommitInfo::new("concurrent"))
                        .expect("merge should eventually succeed");
                });
            }
        });

        let root = node_store.get_root()?;
        for i in 0..8 {
            assert!(root.get_child(&format!("child-{i}"))?.is_some(), "child-{i} missing");
        }
        node_store.store().close()?;
        Ok(())
    }

    #[test]
    fn checkpoint_then_retrieve_matches_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node_store = NodeStore::open(Config::new(dir.path()))?;

        let mut builder = node_store.root_builder();
        builder.set_property("k", PropertyType::String, PropertyValues::Single(b"v".to_vec()));
        node_store.merge(&builder, &NoopCommitHook, &CommitInfo::new("t"))?;

        let root = node_store.get_root()?;
        let cp = node_store.checkpoint(Duration::from_secs(3600))?;

        let retrieved = node_store.retrieve(cp)?.expect("checkpoint should resolve");
        assert_eq!(retrieved.record_id(), root.record_id());

        node_store.store().close()?;
        Ok(())
    }

    #[test]
    fn create_blob_then_read_blob_roundtrips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node_store = NodeStore::open(Config::new(dir.path()))?;

        let payload = vec![7u8; BULK_CHUNK_SIZE + 1024];
        let blob_id = node_store.create_blob(&payload)?;
        let read_back = node_store.read_blob(&blob_id)?;
        assert_eq!(read_back, payload);

        node_store.store().close()?;
        Ok(())
    }

    #[test]
    fn blob_property_survives_merge_and_is_readable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node_store = NodeStore::open(Config::new(dir.path()))?;

        let payload = vec![9u8; 4096];
        let blob_id = node_store.create_blob(&payload)?;

        let mut builder = node_store.root_builder();
        builder.set_blob_property("data", blob_id.clone());
        node_store.merge(&builder, &NoopCommitHook, &CommitInfo::new("t"))?;

        let root = node_store.get_root()?;
        assert!(root.is_property_external("data")?);
        let prop = root.get_property("data")?.expect("data should be set");
        assert_eq!(prop.property_type, PropertyType::Binary);
        let PropertyValues::Single(stored_blob_id) = prop.values else {
            panic!("expected single value");
        };
        assert_eq!(stored_blob_id, blob_id.into_bytes());

        let read_back = node_store.read_blob(&String::from_utf8(stored_blob_id).unwrap())?;
        assert_eq!(read_back, payload);

        node_store.store().close()?;
        Ok(())
    }

    #[test]
    fn blob_property_carried_forward_across_unrelated_merge_stays_readable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node_store = NodeStore::open(Config::new(dir.path()))?;

        let payload = vec![3u8; 2048];
        let blob_id = node_store.create_blob(&payload)?;

        let mut first = node_store.root_builder();
        first.set_blob_property("data", blob_id);
        node_store.merge(&first, &NoopCommitHook, &CommitInfo::new("t1"))?;

        // An unrelated merge that never touches "data" should still carry
        // the blob property forward, re-registering its chunk segments as
        // reachable from the new root.
        let mut second = node_store.root_builder();
        second.set_child_node("unrelated");
        node_store.merge(&second, &NoopCommitHook, &CommitInfo::new("t2"))?;

        let root = node_store.get_root()?;
        let prop = root.get_property("data")?.expect("data should survive");
        let PropertyValues::Single(stored_blob_id) = prop.values else {
            panic!("expected single value");
        };
        let read_back = node_store.read_blob(&String::from_utf8(stored_blob_id).unwrap())?;
        assert_eq!(read_back, payload);

        node_store.store().close()?;
        Ok(())
    }
}
