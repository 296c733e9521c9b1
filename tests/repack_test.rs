//! Integration tests for repacking unarchived bundles into packs.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use commission_archiver::manifest::{ManifestStore, PackRecord};
use commission_archiver::repack::{CommitRetry, Repacker};
use commission_archiver::store::{MemoryBlobStore, Repository};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

const REPO: &str = "owner/skeb";

fn key(path: &str) -> String {
    format!("{REPO}/{path}")
}

fn zip_bytes(name: &str, data: &[u8]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(name, SimpleFileOptions::default()).unwrap();
    zip.write_all(data).unwrap();
    zip.finish().unwrap().into_inner()
}

fn manifest(store: &MemoryBlobStore) -> Arc<ManifestStore> {
    Arc::new(ManifestStore::new(Repository::new(Arc::new(store.clone()), REPO)))
}

fn repacker(store: &MemoryBlobStore, work: &TempDir, max_attempts: Option<u32>) -> Repacker {
    let retry = CommitRetry {
        interval: Duration::ZERO,
        max_attempts,
    };
    Repacker::new(manifest(store), work.path(), retry)
}

fn seed_bundle(store: &MemoryBlobStore, id: &str) -> u64 {
    let data = zip_bytes(&format!("alice_1_{id}.png"), id.as_bytes());
    let size = data.len() as u64;
    store.insert(key(&format!("unarchived/{id}.zip")), data);
    size
}

fn keys_under(store: &MemoryBlobStore, dir: &str) -> Vec<String> {
    let prefix = key(dir);
    store
        .keys()
        .into_iter()
        .filter(|key| key.starts_with(&prefix))
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(store: &MemoryBlobStore, path: &str) -> T {
    serde_json::from_slice(&store.get(&key(path)).unwrap()).unwrap()
}

fn pack_entries(store: &MemoryBlobStore, filename: &str) -> Vec<String> {
    let data = store.get(&key(&format!("packs/{filename}"))).unwrap();
    let archive = ZipArchive::new(Cursor::new(data)).unwrap();
    let mut names: Vec<String> = archive.file_names().map(ToString::to_string).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_size_bound_admits_strictly_below_limit() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    let sizes: Vec<u64> = ["r1", "r2", "r3", "r4"]
        .iter()
        .map(|id| seed_bundle(&store, id))
        .collect();
    assert!(sizes.windows(2).all(|w| w[0] == w[1]));
    let unit = sizes[0];

    let batch = repacker(&store, &work, Some(1))
        .repack_zips(unit * 3 + unit / 2)
        .await
        .unwrap();
    assert_eq!(
        batch.consumed,
        vec!["unarchived/r1.zip", "unarchived/r2.zip", "unarchived/r3.zip"]
    );
    assert!(batch.package.is_some());

    // Exactly at the limit is already too much.
    let batch = repacker(&store, &work, Some(1))
        .repack_zips(unit * 3)
        .await
        .unwrap();
    assert_eq!(batch.consumed.len(), 2);
}

#[tokio::test]
async fn test_repack_commits_pack_and_manifest() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    for id in ["imgur_a", "dropbox_b"] {
        seed_bundle(&store, id);
    }

    let record = repacker(&store, &work, Some(1))
        .repack_all(u64::MAX)
        .await
        .unwrap()
        .unwrap();

    assert!(keys_under(&store, "unarchived/").is_empty());
    assert!(record.filename.starts_with("pack_") && record.filename.ends_with(".zip"));
    assert_eq!(
        store.get(&key(&format!("packs/{}", record.filename))).unwrap().len() as u64,
        record.size
    );
    assert_eq!(
        pack_entries(&store, &record.filename),
        vec!["dropbox_b/alice_1_dropbox_b.png", "imgur_a/alice_1_imgur_a.png"]
    );

    let archived: Vec<String> = read_json(&store, "archived.json");
    assert_eq!(archived, vec!["dropbox_b", "imgur_a"]);
    let index: Vec<PackRecord> = read_json(&store, "index.json");
    assert_eq!(index, vec![record.clone()]);

    let readme = String::from_utf8(store.get(&key("README.md")).unwrap()).unwrap();
    assert!(readme.starts_with("---\nlicense: other\n---\n"));
    assert!(readme.contains("| Filename | Size | Link |"));
    assert!(readme.contains(&format!("| {} |", record.filename)));
    assert!(readme.contains(&format!("[Download](memory://{REPO}/packs/{})", record.filename)));

    // No journal or staging blobs are left behind.
    assert!(store.keys().iter().all(|k| !k.contains(".commits/") && !k.contains(".staging/")));
}

#[tokio::test]
async fn test_failing_commit_changes_nothing() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    seed_bundle(&store, "imgur_a");
    seed_bundle(&store, "imgur_b");
    store.insert(key("archived.json"), br#"["imgur_old"]"#.to_vec());
    store.set_unavailable(true);

    let result = repacker(&store, &work, Some(2)).repack_all(u64::MAX).await;
    assert!(result.is_err());

    assert_eq!(keys_under(&store, "unarchived/").len(), 2);
    assert!(keys_under(&store, "packs/").is_empty());
    let archived: Vec<String> = read_json(&store, "archived.json");
    assert_eq!(archived, vec!["imgur_old"]);
}

#[tokio::test]
async fn test_corrupt_bundle_is_consumed_without_aborting() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    seed_bundle(&store, "good");
    store.insert(key("unarchived/bad.zip"), b"definitely not a zip".to_vec());

    let record = repacker(&store, &work, Some(1))
        .repack_all(u64::MAX)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(pack_entries(&store, &record.filename), vec!["good/alice_1_good.png"]);
    assert!(keys_under(&store, "unarchived/").is_empty());
    let archived: Vec<String> = read_json(&store, "archived.json");
    assert_eq!(archived, vec!["bad", "good"]);
}

#[tokio::test]
async fn test_unreadable_bundles_alone_commit_nothing() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    store.insert(key("unarchived/dropbox_x.zip"), b"not a zip".to_vec());

    let record = repacker(&store, &work, Some(1)).repack_all(u64::MAX).await.unwrap();

    assert!(record.is_none());
    assert_eq!(keys_under(&store, "unarchived/"), vec![key("unarchived/dropbox_x.zip")]);
    assert!(store.get(&key("archived.json")).is_none());
    assert!(keys_under(&store, "packs/").is_empty());
}

#[tokio::test]
async fn test_leftover_bundle_is_removed_even_without_a_pack() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    store.insert(key("archived.json"), br#"["old"]"#.to_vec());
    seed_bundle(&store, "old");
    store.insert(key("unarchived/bad.zip"), b"not a zip".to_vec());

    let record = repacker(&store, &work, Some(1)).repack_all(u64::MAX).await.unwrap();

    assert!(record.is_none());
    assert_eq!(keys_under(&store, "unarchived/"), vec![key("unarchived/bad.zip")]);
    let archived: Vec<String> = read_json(&store, "archived.json");
    assert_eq!(archived, vec!["old"]);
}

#[tokio::test]
async fn test_closed_budget_stops_size_lookups() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    for id in ["r1", "r2", "r3", "r4"] {
        seed_bundle(&store, id);
    }

    let batch = repacker(&store, &work, Some(1)).repack_zips(1).await.unwrap();

    assert!(batch.consumed.is_empty());
    assert!(batch.package.is_none());
    assert_eq!(store.size_requests(), 1);
}

#[tokio::test]
async fn test_failed_staging_leaves_no_blobs_after_retry() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    seed_bundle(&store, "imgur_a");
    let repacker = repacker(&store, &work, Some(1));

    // The pack is staged, then the store goes down.
    store.fail_after_writes(1);
    assert!(repacker.repack_all(u64::MAX).await.is_err());
    store.set_unavailable(false);

    let record = repacker.repack_all(u64::MAX).await.unwrap().unwrap();
    assert!(store.get(&key(&format!("packs/{}", record.filename))).is_some());
    assert!(keys_under(&store, ".staging/").is_empty());
    assert!(keys_under(&store, ".commits/").is_empty());
}

#[tokio::test]
async fn test_orphan_bundle_is_deleted_not_repacked() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    store.insert(key("archived.json"), br#"["old"]"#.to_vec());
    seed_bundle(&store, "old");
    seed_bundle(&store, "new");

    let record = repacker(&store, &work, Some(1))
        .repack_all(u64::MAX)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(pack_entries(&store, &record.filename), vec!["new/alice_1_new.png"]);
    assert!(keys_under(&store, "unarchived/").is_empty());
    let archived: Vec<String> = read_json(&store, "archived.json");
    assert_eq!(archived, vec!["old", "new"]);
}

#[tokio::test]
async fn test_index_grows_and_readme_lists_newest_first() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();

    seed_bundle(&store, "first");
    let one = repacker(&store, &work, Some(1)).repack_all(u64::MAX).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    seed_bundle(&store, "second");
    let two = repacker(&store, &work, Some(1)).repack_all(u64::MAX).await.unwrap().unwrap();

    assert!(one.filename < two.filename);
    let index: Vec<PackRecord> = read_json(&store, "index.json");
    assert_eq!(index, vec![one.clone(), two.clone()]);

    let readme = String::from_utf8(store.get(&key("README.md")).unwrap()).unwrap();
    let first_row = readme.find(&one.filename).unwrap();
    let second_row = readme.find(&two.filename).unwrap();
    assert!(second_row < first_row);
}

#[tokio::test]
async fn test_interrupted_commit_is_completed_on_reopen() {
    let store = MemoryBlobStore::new();
    let work = TempDir::new().unwrap();
    seed_bundle(&store, "imgur_a");

    // Four staged blobs and the journal succeed; applying the commit fails.
    store.fail_after_writes(5);
    let record = repacker(&store, &work, Some(1))
        .repack_all(u64::MAX)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(keys_under(&store, "unarchived/").len(), 1);
    assert!(!keys_under(&store, ".commits/").is_empty());

    store.set_unavailable(false);
    let reopened = manifest(&store);
    assert_eq!(reopened.load_archived_ids().await.unwrap(), vec!["imgur_a"]);
    assert!(keys_under(&store, "unarchived/").is_empty());
    assert!(keys_under(&store, ".commits/").is_empty());
    assert!(store.get(&key(&format!("packs/{}", record.filename))).is_some());
    assert!(!reopened.is_resource_exist("imgur_b").await.unwrap());
    assert!(reopened.is_resource_exist("imgur_a").await.unwrap());
}
