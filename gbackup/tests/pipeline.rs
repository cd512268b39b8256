//! End-to-end backup and restore against the in-memory store and a scripted
//! tool runner.

use gbackup::cipher::CipherKey;
use gbackup::pipeline::batch::run_batch;
use gbackup::pipeline::job::{BackupJob, DatabaseLocator, RestoreSource};
use gbackup::pipeline::{FailureClass, JobState, StageName};
use gbackup::remote::{MemoryStore, RetentionManager, RetentionPolicy};
use gbackup::testing::ScriptedRunner;
use gbackup::tools::MongoTools;
use gbackup::{GBackupError, Pipeline, PipelineEnv};
use std::net::TcpListener;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const FOLDER: &str = "folder-1";
const ARTIFACT: &str = "orders.tar.zst.enc";

struct Harness {
    tmp: TempDir,
    // Keeps the database port accepting connections
    listener: TcpListener,
    runner: Arc<ScriptedRunner>,
    store: Arc<MemoryStore>,
    env: PipelineEnv,
    key: Arc<CipherKey>,
}

impl Harness {
    fn new(store: MemoryStore, dump_files: &[(&str, &[u8])]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let runner = Arc::new(ScriptedRunner::new().with_dump_files(dump_files));
        let store = Arc::new(store);
        let retention = Arc::new(RetentionManager::new(store.clone()));
        let env = PipelineEnv::new(MongoTools::new(runner.clone()), retention);
        Self {
            tmp: TempDir::new().unwrap(),
            listener,
            runner,
            store,
            env,
            key: Arc::new(CipherKey::from_bytes([42u8; 32])),
        }
    }

    fn locator(&self, name: &str) -> DatabaseLocator {
        let port = self.listener.local_addr().unwrap().port();
        DatabaseLocator::new(name).with_address("127.0.0.1", port)
    }

    fn job(&self, dir: &str, policy: RetentionPolicy) -> BackupJob {
        BackupJob::new(
            self.locator("orders"),
            self.tmp.path().join(dir),
            ARTIFACT,
            FOLDER,
            policy,
            self.key.clone(),
        )
    }
}

fn default_dump() -> Vec<(&'static str, &'static [u8])> {
    vec![
        ("items.bson", &b"\x16\x00\x00\x00\x02sku\x00\x04\x00\x00\x00A-1\x00\x00"[..]),
        ("items.metadata.json", &b"{\"indexes\":[{\"v\":2,\"key\":{\"_id\":1}}]}"[..]),
    ]
}

/// Incompressible bytes so the ciphertext spans several upload chunks.
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

#[tokio::test]
async fn backup_then_restore_round_trip() {
    let dump = default_dump();
    let h = Harness::new(MemoryStore::new(), &dump);

    let backup = Pipeline::backup(&h.env)
        .run(h.job("backup", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    assert!(backup.succeeded(), "{:?}", backup.failure);
    assert_eq!(
        backup.transitions,
        vec![
            JobState::Running(StageName::Preflighting),
            JobState::Running(StageName::Dumping),
            JobState::Running(StageName::Packing),
            JobState::Running(StageName::Stamping),
            JobState::Running(StageName::Encrypting),
            JobState::Running(StageName::Publishing),
            JobState::Done,
        ]
    );

    let remote = h.store.files(FOLDER);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].name, ARTIFACT);
    let digest = backup.integrity().unwrap().hex_digest.clone();
    assert_eq!(remote[0].sha256.as_deref(), Some(digest.as_str()));

    let report = std::fs::read_to_string(backup.artifacts.hash_report.as_ref().unwrap()).unwrap();
    assert!(report.contains(&format!("SHA256 Checksum: {digest}")));

    // The uploaded bytes are ciphertext, not the archive
    let archive = std::fs::read(&backup.artifacts.archive.as_ref().unwrap().path).unwrap();
    assert_ne!(h.store.content(&remote[0].id).unwrap(), archive);

    let restore = Pipeline::restore(&h.env, RestoreSource::Latest)
        .run(h.job("restore", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    assert!(restore.succeeded(), "{:?}", restore.failure);
    assert_eq!(restore.integrity_verified, Some(true));
    assert_eq!(
        restore.transitions,
        vec![
            JobState::Running(StageName::Preflighting),
            JobState::Running(StageName::Fetching),
            JobState::Running(StageName::Decrypting),
            JobState::Running(StageName::VerifyingIntegrity),
            JobState::Running(StageName::Unpacking),
            JobState::Running(StageName::Restoring),
            JobState::Done,
        ]
    );

    let restored = h.runner.restored();
    let expected: Vec<(String, Vec<u8>)> = dump.iter().map(|(n, b)| (n.to_string(), b.to_vec())).collect();
    let actual: Vec<(String, Vec<u8>)> = restored.into_iter().collect();
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn restore_by_remote_id_and_from_local_artifact() {
    let h = Harness::new(MemoryStore::new(), &default_dump());
    let backup = Pipeline::backup(&h.env)
        .run(h.job("backup", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    let file = backup.remote_file.clone().unwrap();

    let by_id = Pipeline::restore(&h.env, RestoreSource::RemoteId(file.id.clone()))
        .run(h.job("restore-id", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    assert!(by_id.succeeded(), "{:?}", by_id.failure);
    assert_eq!(by_id.remote_file.map(|f| f.id), Some(file.id));

    let local = backup.artifacts.ciphertext.clone().unwrap();
    let from_disk = Pipeline::restore(&h.env, RestoreSource::LocalArtifact(local))
        .run(h.job("restore-local", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    assert!(from_disk.succeeded(), "{:?}", from_disk.failure);
    // hash.txt sits next to the ciphertext in the backup working directory
    assert_eq!(from_disk.integrity_verified, Some(true));
}

#[tokio::test]
async fn authentication_required_never_reaches_dumping() {
    let h = Harness::new(MemoryStore::new(), &default_dump());
    h.runner.fail_when(
        "mongodump",
        "--archive",
        1,
        "Failed: error running listCollections: command listCollections requires authentication",
    );

    let job = h.job("backup", RetentionPolicy::OverwriteByName);
    let dump_dir = job.dump_dir();
    let report = Pipeline::backup(&h.env).run(job, CancellationToken::new()).await;

    assert!(!report.reached(StageName::Dumping));
    assert!(!dump_dir.exists());
    assert!(h.store.files(FOLDER).is_empty());
    let failure = report.into_result().unwrap_err();
    assert_eq!(failure.stage, StageName::Preflighting);
    assert!(matches!(failure.cause, GBackupError::AuthenticationRequired { .. }));
}

#[tokio::test]
async fn failed_upload_keeps_prior_remote_file() {
    let h = Harness::new(MemoryStore::without_update_in_place(), &default_dump());
    let prior = h.store.insert(FOLDER, ARTIFACT, b"previous generation");
    h.store.fail_next_uploads(1);

    let job = h.job("backup", RetentionPolicy::OverwriteByName);
    let report = Pipeline::backup(&h.env).run(job, CancellationToken::new()).await;

    assert_eq!(h.store.files(FOLDER), vec![prior.clone()]);
    assert_eq!(h.store.content(&prior.id).unwrap(), b"previous generation");

    // Local artifacts survive for inspection
    let ciphertext = report.artifacts.ciphertext.clone().unwrap();
    assert!(ciphertext.is_file());
    let failure = report.into_result().unwrap_err();
    assert_eq!(failure.stage, StageName::Publishing);
    assert_eq!(failure.class, FailureClass::Retryable);
}

#[tokio::test]
async fn failed_update_in_place_falls_back_to_new_file() {
    let h = Harness::new(MemoryStore::new(), &default_dump());
    let prior = h.store.insert(FOLDER, ARTIFACT, b"previous generation");
    h.store.fail_next_updates(1);

    let report = Pipeline::backup(&h.env)
        .run(h.job("backup", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    assert!(report.succeeded(), "{:?}", report.failure);

    let files = h.store.files(FOLDER);
    assert_eq!(files.len(), 1);
    assert_ne!(files[0].id, prior.id);
}

#[tokio::test]
async fn reused_work_dir_backs_up_only_the_latest_dump() {
    let h = Harness::new(
        MemoryStore::new(),
        &[("a.bson", &b"first"[..]), ("dropped.bson", &b"gone soon"[..])],
    );
    let first = Pipeline::backup(&h.env)
        .run(h.job("backup", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    assert!(first.succeeded(), "{:?}", first.failure);

    h.runner.set_dump_files(&[("a.bson", &b"second"[..])]);
    let second = Pipeline::backup(&h.env)
        .run(h.job("backup", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    assert!(second.succeeded(), "{:?}", second.failure);

    let restore = Pipeline::restore(&h.env, RestoreSource::Latest)
        .run(h.job("restore", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    assert!(restore.succeeded(), "{:?}", restore.failure);

    let restored: Vec<(String, Vec<u8>)> = h.runner.restored().into_iter().collect();
    assert_eq!(restored, vec![("a.bson".to_string(), b"second".to_vec())]);
}

#[tokio::test]
async fn overwrite_by_name_keeps_one_copy() {
    let h = Harness::new(MemoryStore::new(), &default_dump());
    for _ in 0..3 {
        let report = Pipeline::backup(&h.env)
            .run(h.job("backup", RetentionPolicy::OverwriteByName), CancellationToken::new())
            .await;
        assert!(report.succeeded(), "{:?}", report.failure);
    }
    let files = h.store.files(FOLDER);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, ARTIFACT);
}

#[tokio::test]
async fn keep_newest_three_of_five() {
    let h = Harness::new(MemoryStore::new(), &default_dump());
    let policy = RetentionPolicy::KeepNewest { keep: 3 };
    let mut published = Vec::new();
    for _ in 0..5 {
        let report = Pipeline::backup(&h.env)
            .run(h.job("backup", policy), CancellationToken::new())
            .await;
        assert!(report.succeeded(), "{:?}", report.failure);
        published.push(report.remote_file.unwrap().id);
    }

    let survivors: Vec<String> = h.store.files(FOLDER).into_iter().map(|f| f.id).collect();
    assert_eq!(survivors, published[2..].to_vec());

    // Restore picks the newest generation
    let restore = Pipeline::restore(&h.env, RestoreSource::Latest)
        .run(h.job("restore", policy), CancellationToken::new())
        .await;
    assert!(restore.succeeded(), "{:?}", restore.failure);
    assert_eq!(restore.remote_file.map(|f| f.id).as_ref(), published.last());
}

#[tokio::test]
async fn wrong_key_fails_decryption_before_restore() {
    let h = Harness::new(MemoryStore::new(), &default_dump());
    let backup = Pipeline::backup(&h.env)
        .run(h.job("backup", RetentionPolicy::OverwriteByName), CancellationToken::new())
        .await;
    assert!(backup.succeeded());

    let mut job = h.job("restore", RetentionPolicy::OverwriteByName);
    job.key = Arc::new(CipherKey::from_bytes([7u8; 32]));
    let report = Pipeline::restore(&h.env, RestoreSource::Latest)
        .run(job, CancellationToken::new())
        .await;

    assert!(!report.reached(StageName::Restoring));
    assert!(h.runner.restored().is_empty());
    let failure = report.into_result().unwrap_err();
    assert_eq!(failure.stage, StageName::Decrypting);
    assert!(matches!(failure.cause, GBackupError::DecryptionFailed));
}

#[tokio::test]
async fn cancellation_mid_upload_leaves_folder_untouched() {
    let large = noise(1024 * 1024);
    let h = Harness::new(MemoryStore::new(), &[("blob.bson", large.as_slice())]);
    let prior = h.store.insert(FOLDER, ARTIFACT, b"previous generation");

    let cancel = CancellationToken::new();
    h.store.cancel_after_chunks(1, cancel.clone());
    let report = Pipeline::backup(&h.env)
        .run(h.job("backup", RetentionPolicy::OverwriteByName), cancel)
        .await;

    assert_eq!(h.store.files(FOLDER), vec![prior.clone()]);
    assert_eq!(h.store.content(&prior.id).unwrap(), b"previous generation");
    let failure = report.into_result().unwrap_err();
    assert_eq!(failure.stage, StageName::Publishing);
    assert!(matches!(failure.cause, GBackupError::Cancelled));
}

#[tokio::test]
async fn batch_isolates_failing_database() {
    let h = Harness::new(MemoryStore::new(), &default_dump());
    let job = |name: &str| {
        BackupJob::new(
            h.locator(name),
            h.tmp.path().join(name),
            format!("{name}.tar.zst.enc"),
            FOLDER,
            RetentionPolicy::OverwriteByName,
            h.key.clone(),
        )
    };
    let jobs = vec![job("orders"), job("broken")];
    // Only the real dump of "broken" fails; its preflight probe passes
    let broken_out = jobs[1].dump_dir().display().to_string();
    h.runner.fail_when("mongodump", &broken_out, 1, "Failed: unexpected error in dump");
    let broken_archive = jobs[1].archive_path();

    let entries = run_batch(
        Arc::new(Pipeline::backup(&h.env)),
        jobs,
        2,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(entries[0].succeeded());
    assert!(!entries[1].succeeded());
    let broken = entries[1].result.as_ref().unwrap();
    let failure = broken.failure.as_ref().unwrap();
    assert_eq!(failure.stage, StageName::Dumping);
    assert!(failure.to_string().contains("unexpected error in dump"));
    assert!(!broken_archive.exists());

    let names: Vec<String> = h.store.files(FOLDER).into_iter().map(|f| f.name).collect();
    assert_eq!(names, vec!["orders.tar.zst.enc".to_string()]);
}
