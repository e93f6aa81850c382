use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use crate::config::{RepoConfig, RepoLayout};
use crate::delegation::DelegationRequest;
use crate::errors::{RepoError, Result};
use crate::keys::{encrypt_private_key, KdfParams, Key, PrivateKey};
use crate::release::ReleaseState;
use crate::repository::Repository;
use crate::store::FsMetadataStore;
use crate::traits::{FixedClock, MetadataStore};
use crate::types::{PathConstraint, Payload, RoleName, SignedDocument, TopLevelRole};

/// Filesystem store that fails on demand.
struct FlakyStore {
    inner: FsMetadataStore,
    fail_write: Option<&'static str>,
    fail_publish: bool,
}

impl MetadataStore for FlakyStore {
    fn write_staged(&self, file: &str, bytes: &[u8]) -> Result<()> {
        if self.fail_write == Some(file) {
            return Err(RepoError::io(file, io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        self.inner.write_staged(file, bytes)
    }
    fn read_staged(&self, file: &str) -> Result<Option<Vec<u8>>> { self.inner.read_staged(file) }
    fn read_live(&self, file: &str) -> Result<Option<Vec<u8>>> { self.inner.read_live(file) }
    fn remove_staged(&self, file: &str) -> Result<()> { self.inner.remove_staged(file) }
    fn list_staged(&self) -> Result<Vec<String>> { self.inner.list_staged() }
    fn publish(&self) -> Result<()> {
        if self.fail_publish {
            return Err(RepoError::io(self.inner.live_dir(), io::Error::new(io::ErrorKind::Other, "rename failed")));
        }
        self.inner.publish()
    }
}

fn key(seed: u8) -> Key {
    Key::from_private(PrivateKey::ed25519_from_seed([seed; 32])).unwrap()
}

fn clock() -> Box<FixedClock> {
    Box::new(FixedClock(Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap()))
}

fn fs_store(layout: &RepoLayout) -> FsMetadataStore {
    FsMetadataStore::open(layout.staged_dir(), layout.live_dir()).expect("store opens")
}

/// Top-level role `i` is trusted with, and signed by, `key(i + 1)`.
fn load_top_level_keys(repo: &mut Repository) {
    for (i, top) in TopLevelRole::ALL.into_iter().enumerate() {
        repo.load_signing_key(&top.into(), key(i as u8 + 1)).expect("signing key loads");
    }
}

fn init(dir: &TempDir) -> Repository {
    let layout = RepoLayout::new(dir.path());
    let store = fs_store(&layout);
    let mut repo = Repository::create_with(layout, RepoConfig::default(), Box::new(store), clock()).expect("create");
    for (i, top) in TopLevelRole::ALL.into_iter().enumerate() {
        repo.add_verification_key(top, &key(i as u8 + 1)).expect("trust key");
    }
    load_top_level_keys(&mut repo);
    repo
}

fn reload(dir: &TempDir, store: Box<dyn MetadataStore>) -> Repository {
    let mut repo = Repository::load_with(RepoLayout::new(dir.path()), RepoConfig::default(), store, clock()).expect("load");
    load_top_level_keys(&mut repo);
    repo
}

fn live_document(dir: &Path, file: &str) -> SignedDocument {
    let raw = fs::read(dir.join("tufrepo/metadata").join(file)).expect("live file exists");
    serde_json::from_slice(&raw).expect("valid document")
}

fn snapshot_tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fs::read_dir(dir)
        .expect("dir exists")
        .map(|e| {
            let e = e.unwrap();
            (e.file_name().to_string_lossy().into_owned(), fs::read(e.path()).unwrap())
        })
        .collect()
}

#[test]
fn first_release_publishes_four_verifiable_roles() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    repo.set_target_path(&RoleName::TARGETS, "a.txt", json!({})).unwrap();
    let written = repo.write_all(false).unwrap();
    assert_eq!(written, vec![RoleName::ROOT, RoleName::TARGETS, RoleName::SNAPSHOT, RoleName::TIMESTAMP]);
    assert_eq!(repo.release_state(), ReleaseState::Staged);
    repo.publish().unwrap();
    assert_eq!(repo.release_state(), ReleaseState::Published);

    let Payload::Targets(targets) = live_document(dir.path(), "targets.json").signed else { panic!("targets") };
    assert!(targets.targets.contains_key("a.txt"));
    let Payload::Snapshot(snapshot) = live_document(dir.path(), "snapshot.json").signed else { panic!("snapshot") };
    assert_eq!(snapshot.meta["targets.json"].version, targets.version);
    assert!(snapshot.meta.contains_key("root.json"));
    let Payload::Timestamp(timestamp) = live_document(dir.path(), "timestamp.json").signed else { panic!("timestamp") };
    assert_eq!(timestamp.meta["snapshot.json"].version, snapshot.version);
    assert_eq!(timestamp.meta["snapshot.json"], *repo.get_role(&RoleName::SNAPSHOT).unwrap().file_meta().unwrap());

    for top in TopLevelRole::ALL {
        assert!(repo.is_verifiable(&top.into()).unwrap(), "{top} should verify");
        assert!(!repo.get_role(&top.into()).unwrap().is_dirty());
    }
}

#[test]
fn later_release_bumps_only_what_changed() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    repo.write_all(false).unwrap();
    repo.publish().unwrap();

    repo.set_target_path(&RoleName::TARGETS, "b.txt", json!({"build": 7})).unwrap();
    let written = repo.write_all(false).unwrap();
    assert_eq!(written, vec![RoleName::TARGETS, RoleName::SNAPSHOT, RoleName::TIMESTAMP]);
    let version = |role: RoleName| repo.get_role(&role).unwrap().version;
    assert_eq!(version(RoleName::ROOT), 1);
    assert_eq!(version(RoleName::TARGETS), 2);
    assert_eq!(version(RoleName::SNAPSHOT), 2);
    assert_eq!(version(RoleName::TIMESTAMP), 2);
}

#[test]
fn loading_restores_the_published_repository() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    let dist_key = key(9);
    repo.delegate(
        &RoleName::TARGETS,
        DelegationRequest::new("dist", vec![dist_key.public_only()], vec!["releases/*".into()]).terminating(true),
    )
    .unwrap();
    let dist = RoleName::Delegated("dist".into());
    repo.load_signing_key(&dist, dist_key).unwrap();
    repo.set_target_path(&dist, "releases/v1.tgz", json!({"channel": "stable"})).unwrap();
    repo.write_all(true).unwrap();
    repo.publish().unwrap();

    let layout = RepoLayout::new(dir.path());
    let loaded = reload(&dir, Box::new(fs_store(&layout)));
    assert_eq!(loaded.release_state(), ReleaseState::Published);
    assert!(loaded.consistent_snapshot().unwrap());
    for role in [RoleName::ROOT, RoleName::TARGETS, RoleName::SNAPSHOT, RoleName::TIMESTAMP, dist.clone()] {
        let (a, b) = (repo.get_role(&role).unwrap(), loaded.get_role(&role).unwrap());
        assert_eq!(a.version, b.version, "{role}");
        assert_eq!(a.keyids, b.keyids, "{role}");
        assert_eq!(a.data, b.data, "{role}");
        assert!(loaded.is_verifiable(&role).unwrap(), "{role}");
        assert!(!b.is_dirty());
    }
    assert!(loaded.get_role(&RoleName::TARGETS).unwrap().delegation("dist").unwrap().terminating);
    assert!(dir.path().join("tufrepo/metadata/1.dist.json").exists());
    assert!(!dir.path().join("tufrepo/metadata/1.timestamp.json").exists());
}

#[test]
fn delegated_role_signed_by_an_untrusted_key_is_not_verifiable() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    repo.delegate(
        &RoleName::TARGETS,
        DelegationRequest::new("dist", vec![key(10).public_only()], vec!["releases/*".into()]),
    )
    .unwrap();
    let dist = RoleName::Delegated("dist".into());
    repo.load_signing_key(&dist, key(11)).unwrap();
    repo.write_all(false).unwrap();

    assert!(!repo.get_role(&dist).unwrap().signatures.is_empty());
    assert!(!repo.is_verifiable(&dist).unwrap());
    assert!(repo.is_verifiable(&RoleName::TARGETS).unwrap());
}

#[test]
fn failed_staging_leaves_live_and_graph_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    repo.write_all(false).unwrap();
    repo.publish().unwrap();
    let live_before = snapshot_tree(&dir.path().join("tufrepo/metadata"));

    let layout = RepoLayout::new(dir.path());
    let flaky = FlakyStore { inner: fs_store(&layout), fail_write: Some("snapshot.json"), fail_publish: false };
    let mut repo = reload(&dir, Box::new(flaky));
    repo.set_target_path(&RoleName::TARGETS, "a.txt", json!({})).unwrap();
    let before = repo.get_role(&RoleName::TARGETS).unwrap().clone();

    assert!(matches!(repo.write_all(false), Err(RepoError::Io { .. })));
    assert_eq!(repo.get_role(&RoleName::TARGETS).unwrap(), &before);
    assert_eq!(repo.release_state(), ReleaseState::Mutated);
    assert_eq!(snapshot_tree(&dir.path().join("tufrepo/metadata")), live_before);

    // targets.json v2 is staged but snapshot.json is not: it must never go live.
    assert!(matches!(repo.publish(), Err(RepoError::NotStaged(ReleaseState::Mutated))));
    assert_eq!(snapshot_tree(&dir.path().join("tufrepo/metadata")), live_before);
    assert_eq!(repo.release_state(), ReleaseState::Mutated);
}

#[test]
fn publish_requires_a_fresh_complete_stage() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    assert!(matches!(repo.publish(), Err(RepoError::NotStaged(ReleaseState::Mutated))));

    repo.write_all(false).unwrap();
    repo.set_target_path(&RoleName::TARGETS, "late.txt", json!({})).unwrap();
    assert!(matches!(repo.publish(), Err(RepoError::NotStaged(ReleaseState::Mutated))));
    assert!(!dir.path().join("tufrepo/metadata").exists());

    repo.write_all(false).unwrap();
    repo.publish().unwrap();
    assert!(matches!(repo.publish(), Err(RepoError::NotStaged(ReleaseState::Published))));
    let Payload::Targets(targets) = live_document(dir.path(), "targets.json").signed else { panic!("targets") };
    assert!(targets.targets.contains_key("late.txt"));
}

#[test]
fn numeric_role_names_survive_staged_pruning() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    let quarter = RoleName::Delegated("2024.q1".into());
    repo.delegate(&RoleName::TARGETS, DelegationRequest::new("2024.q1", vec![key(14).public_only()], vec!["q1/*".into()]))
        .unwrap();
    repo.load_signing_key(&quarter, key(14)).unwrap();
    repo.write_all(false).unwrap();
    repo.publish().unwrap();

    let live = dir.path().join("tufrepo/metadata");
    assert!(live.join("2024.q1.json").exists());
    let Payload::Snapshot(snapshot) = live_document(dir.path(), "snapshot.json").signed else { panic!("snapshot") };
    assert!(snapshot.meta.contains_key("2024.q1.json"));

    repo.set_target_path(&quarter, "q1/report.pdf", json!({})).unwrap();
    repo.write_all(true).unwrap();
    repo.publish().unwrap();
    assert!(live.join("2024.q1.json").exists());
    assert!(live.join("2.2024.q1.json").exists());
    let loaded = reload(&dir, Box::new(fs_store(&RepoLayout::new(dir.path()))));
    assert!(loaded.get_role(&quarter).unwrap().targets().unwrap().contains_key("q1/report.pdf"));
}

#[test]
fn hash_prefix_delegation_survives_a_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    let bins = RoleName::Delegated("bins".into());
    let request = DelegationRequest::new("bins", vec![key(15).public_only()], vec![])
        .paths(PathConstraint::HashPrefixes(vec!["93".into()]));
    repo.delegate(&RoleName::TARGETS, request).unwrap();
    repo.load_signing_key(&bins, key(15)).unwrap();
    // sha256("releases/a.tgz") starts with 93
    repo.set_target_path(&bins, "releases/a.tgz", json!({})).unwrap();
    assert!(matches!(
        repo.set_target_path(&bins, "docs/readme.md", json!({})),
        Err(RepoError::PathNotDelegated { .. })
    ));
    repo.write_all(false).unwrap();
    repo.publish().unwrap();

    let Payload::Targets(targets) = live_document(dir.path(), "targets.json").signed else { panic!("targets") };
    let table = targets.delegations.expect("delegations table");
    let entry = &table.roles[0];
    assert_eq!(entry.path_hash_prefixes, Some(vec!["93".to_string()]));
    assert_eq!(entry.paths, None);

    let loaded = reload(&dir, Box::new(fs_store(&RepoLayout::new(dir.path()))));
    let delegation = loaded.get_role(&RoleName::TARGETS).unwrap().delegation("bins").unwrap().clone();
    assert_eq!(delegation.paths, PathConstraint::HashPrefixes(vec!["93".into()]));
    assert!(loaded.is_verifiable(&bins).unwrap());
    assert!(loaded.get_role(&bins).unwrap().targets().unwrap().contains_key("releases/a.tgz"));
}

#[test]
fn failed_publish_keeps_roles_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(dir.path());
    let flaky = FlakyStore { inner: fs_store(&layout), fail_write: None, fail_publish: true };
    let mut repo = Repository::create_with(layout, RepoConfig::default(), Box::new(flaky), clock()).unwrap();
    repo.write_all(false).unwrap();

    assert!(repo.publish().is_err());
    assert_eq!(repo.release_state(), ReleaseState::Staged);
    assert!(repo.get_role(&RoleName::ROOT).unwrap().is_dirty());
    assert!(!dir.path().join("tufrepo/metadata").exists());
}

#[test]
fn revoked_role_is_dropped_from_the_next_release() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    repo.delegate(
        &RoleName::TARGETS,
        DelegationRequest::new("dist", vec![key(12).public_only()], vec!["releases/*".into()]),
    )
    .unwrap();
    repo.write_all(false).unwrap();
    repo.publish().unwrap();
    assert!(dir.path().join("tufrepo/metadata/dist.json").exists());

    repo.revoke(&RoleName::TARGETS, "dist").unwrap();
    repo.write_all(false).unwrap();
    repo.publish().unwrap();
    assert!(!dir.path().join("tufrepo/metadata/dist.json").exists());
    let Payload::Snapshot(snapshot) = live_document(dir.path(), "snapshot.json").signed else { panic!("snapshot") };
    assert!(!snapshot.meta.contains_key("dist.json"));
    assert!(repo.get_role(&RoleName::TARGETS).unwrap().delegations().is_empty());
}

#[test]
fn top_level_delegation_leaves_the_repository_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    repo.write_all(false).unwrap();
    repo.publish().unwrap();

    let err = repo
        .delegate(&RoleName::TARGETS, DelegationRequest::new("snapshot", vec![key(13)], vec!["*".into()]))
        .unwrap_err();
    assert!(matches!(err, RepoError::TopLevelDelegation(_)));
    assert!(repo.graph().dirty_roles().is_empty());
    assert_eq!(repo.release_state(), ReleaseState::Published);
}

#[test]
fn top_level_threshold_must_be_positive() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    let err = repo.set_threshold(TopLevelRole::Timestamp, 0).unwrap_err();
    assert!(matches!(err, RepoError::InvalidThreshold { threshold: 0, .. }));
    assert_eq!(repo.get_role(&RoleName::TIMESTAMP).unwrap().threshold, 1);
}

#[test]
fn removing_a_root_key_breaks_verification() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    repo.write_all(false).unwrap();
    let keyid = key(1).keyid().to_string();
    repo.remove_verification_key(TopLevelRole::Root, &keyid).unwrap();
    assert!(!repo.is_verifiable(&RoleName::ROOT).unwrap());
    assert!(matches!(
        repo.remove_verification_key(TopLevelRole::Root, &keyid),
        Err(RepoError::KeyNotFound(_))
    ));
}

#[test]
fn target_files_are_copied_and_hashed() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    let source = dir.path().join("payload.bin");
    fs::write(&source, b"hello").unwrap();

    assert!(repo.add_target_file(&RoleName::TARGETS, &source, "bin/payload.bin", json!({})).unwrap());
    assert!(!repo.add_target_file(&RoleName::TARGETS, &dir.path().join("missing"), "missing", json!({})).unwrap());

    let entry = repo.get_role(&RoleName::TARGETS).unwrap().targets().unwrap()["bin/payload.bin"].clone();
    assert_eq!(entry.length, Some(5));
    assert_eq!(
        entry.hashes["sha256"],
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert_eq!(fs::read(dir.path().join("tufrepo/targets/bin/payload.bin")).unwrap(), b"hello");
}

#[test]
fn imported_signing_key_signs_its_role() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    let kdf = KdfParams { memory_kib: 64, iterations: 1, parallelism: 1 };
    let raw = encrypt_private_key(&PrivateKey::ed25519_from_seed([20u8; 32]), "pw", &kdf).unwrap();
    let imported = repo.import_signing_key(&RoleName::TARGETS, &raw, Some("pw")).unwrap();
    repo.add_verification_key(TopLevelRole::Targets, &imported).unwrap();

    repo.write(&RoleName::TARGETS, false).unwrap();
    assert!(repo.is_verifiable(&RoleName::TARGETS).unwrap());
    let signers: Vec<_> =
        repo.get_role(&RoleName::TARGETS).unwrap().signatures.iter().map(|s| s.keyid.clone()).collect();
    assert!(signers.contains(&imported.keyid().to_string()));
}

#[test]
fn client_directory_mirrors_live_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = init(&dir);
    repo.write_all(false).unwrap();
    repo.publish().unwrap();

    let metadata = repo.create_client_directory().unwrap();
    let live = snapshot_tree(&dir.path().join("tufrepo/metadata"));
    assert_eq!(snapshot_tree(&metadata.join("current")), live);
    assert_eq!(snapshot_tree(&metadata.join("previous")), live);

    Repository::clean(dir.path()).unwrap();
    assert!(!dir.path().join("tufrepo").exists());
    assert!(!dir.path().join("tufclient").exists());
}
