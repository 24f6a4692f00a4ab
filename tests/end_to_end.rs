//! End-to-end scenarios exercising the whole stack — store, node store,
//! checkpoints and GC together — rather than one module in isolation.

use node_store::config::{Config, GcOptions};
use node_store::node_store::{CommitInfo, NodeStore, NoopCommitHook};
use node_store::record::property::{PropertyType, PropertyValues};
use node_store::Result;
use std::time::Duration;

fn set_property(node_store: &NodeStore, path: &[&str], name: &str, value: &[u8]) -> Result<()> {
    let mut builder = node_store.root_builder();
    let mut cursor = &mut builder;
    for segment in path {
        cursor = cursor.child_node(segment);
    }
    cursor.set_property(name, PropertyType::String, PropertyValues::Single(value.to_vec()));
    node_store.merge(&builder, &NoopCommitHook, &CommitInfo::new("test"))?;
    Ok(())
}

/// Scenario 1: a committed subtree survives a close/reopen cycle.
#[test]
fn persisted_head_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().to_path_buf();

    {
        let node_store = NodeStore::open(Config::new(&path))?;
        set_property(&node_store, &["a", "b"], "marker", b"present")?;
        node_store.store().close()?;
    }

    let node_store = NodeStore::open(Config::new(&path))?;
    let root = node_store.get_root()?;
    let a = root.get_child("a")?.expect("/a should exist");
    let b = a.get_child("b")?.expect("/a/b should exist");
    let marker = b.get_property("marker")?.expect("marker should be set");
    assert_eq!(marker.values, PropertyValues::Single(b"present".to_vec()));
    node_store.store().close()?;
    Ok(())
}

/// Scenario 2: removing a large blob property and compacting reclaims the
/// space it occupied, rather than leaving it as a dangling unreferenced
/// bulk segment chain forever.
#[test]
fn compaction_reclaims_removed_blob() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node_store = NodeStore::open(Config::new(dir.path()).gc_options(GcOptions {
        gain_threshold_pct: 1,
        retained_generations: 2,
        ..GcOptions::default()
    }))?;

    let blob = vec![0x5Au8; 5 * 1024 * 1024];
    let blob_id = node_store.create_blob(&blob)?;

    let mut with_blob = node_store.root_builder();
    with_blob.set_blob_property("blob1", blob_id);
    node_store.merge(&with_blob, &NoopCommitHook, &CommitInfo::new("writer"))?;
    node_store.store().flush()?;

    let size_with_blob = dir_size(dir.path());
    assert!(size_with_blob >= 5 * 1024 * 1024, "expected archive to grow past the blob size, got {size_with_blob}");

    let mut without_blob = node_store.root_builder();
    without_blob.remove_property("blob1");
    node_store.merge(&without_blob, &NoopCommitHook, &CommitInfo::new("writer"))?;
    node_store.store().flush()?;

    node_store.store().compact()?;
    node_store.store().cleanup()?;
    node_store.store().cleanup()?;

    let size_after = dir_size(dir.path());
    assert!(
        size_after < size_with_blob,
        "expected cleanup to shrink the repository below {size_with_blob}, got {size_after}"
    );

    node_store.store().close()?;
    Ok(())
}

/// Scenario 4: each journal line carries exactly three whitespace-separated
/// tokens and the timestamp token is a plausible Unix-millis value.
#[test]
fn journal_lines_carry_a_plausible_timestamp() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node_store = NodeStore::open(Config::new(dir.path()))?;

    let start_millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;

    for i in 0..5 {
        set_property(&node_store, &[], &format!("k{i}"), b"v")?;
    }
    node_store.store().flush()?;

    let journal_text = std::fs::read_to_string(dir.path().join("journal.log"))?;
    let first_line = journal_text.lines().next().expect("journal should have at least one line");
    let tokens: Vec<&str> = first_line.split_whitespace().collect();
    assert_eq!(tokens.len(), 3, "journal line {first_line:?} should have 3 tokens");
    assert_eq!(tokens[1], "root");
    let timestamp: u64 = tokens[2].parse().expect("third token should be a unix-millis integer");
    assert!(timestamp >= start_millis, "timestamp {timestamp} should be >= test start {start_millis}");

    node_store.store().close()?;
    Ok(())
}

/// Scenario 5: a parent written after its child (in a separate writer-pool
/// buffer) must not be treated as unreachable by cleanup just because the
/// child's segment predates the parent's in archive order.
#[test]
fn forward_referencing_parent_stays_reachable_after_cleanup() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node_store = NodeStore::open(Config::new(dir.path()).gc_options(GcOptions {
        gain_threshold_pct: 1,
        ..GcOptions::default()
    }))?;

    set_property(&node_store, &["child"], "marker", b"child-data")?;
    node_store.store().flush()?;

    set_property(&node_store, &["child", "grandchild"], "marker", b"grandchild-data")?;
    node_store.store().flush()?;
    node_store.store().close()?;

    let reopened = NodeStore::open(Config::new(dir.path()))?;
    reopened.store().cleanup()?;

    let root = reopened.get_root()?;
    let child = root.get_child("child")?.expect("child should still be reachable");
    let grandchild = child.get_child("grandchild")?.expect("grandchild should still be reachable");
    let marker = grandchild.get_property("marker")?.expect("marker should survive cleanup");
    assert_eq!(marker.values, PropertyValues::Single(b"grandchild-data".to_vec()));

    reopened.store().close()?;
    Ok(())
}

/// Scenario 6: a checkpoint that is structurally identical to the root
/// compaction just produced resolves to that exact compacted record id,
/// rather than to a stale pre-compaction copy of the same tree.
#[test]
fn checkpoint_deduplicates_against_compacted_root() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node_store = NodeStore::open(Config::new(dir.path()).gc_options(GcOptions {
        gain_threshold_pct: 1,
        ..GcOptions::default()
    }))?;

    set_property(&node_store, &[], "stable", b"unchanged")?;
    node_store.store().flush()?;

    let cp = node_store.checkpoint(Duration::from_secs(3600))?;
    node_store.store().compact()?;

    let root = node_store.get_root()?;
    let retrieved = node_store.retrieve(cp)?.expect("checkpoint should still resolve");
    assert_eq!(retrieved.record_id(), root.record_id());

    node_store.store().close()?;
    Ok(())
}

fn dir_size(path: &std::path::Path) -> u64 {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path).expect("read_dir") {
        let entry = entry.expect("dir entry");
        if let Ok(metadata) = entry.metadata() {
            if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    total
}
