use holdfast_core::BlobType;
use repository::{set_observer, LocalStore, Repository};
use telemetry::repo_observer::{global as repo_global, snapshot_counters};

#[test]
fn registers_observer_and_counts_metrics() -> Result<(), Box<dyn std::error::Error>> {
    let _ = set_observer(repo_global());
    let before = snapshot_counters();

    let dir = tempfile::tempdir()?;
    let store = LocalStore::open(dir.path().to_path_buf())?;
    let repo = Repository::open(store, crypto::Key::random()?)?;

    let data = vec![0x61u8; 4096];
    let id = repo.save(BlobType::Data, &data, None)?;
    let dup = repo.save(BlobType::Data, &data, None)?;
    assert_eq!(id, dup);
    repo.flush()?;

    let mut buf = Vec::new();
    let got = repo.load_blob(BlobType::Data, &id, &mut buf)?;
    assert_eq!(got, data.as_slice());

    let after = snapshot_counters();
    assert!(after.0 - before.0 >= data.len() as u64, "saved bytes counted");
    assert!(after.1 - before.1 >= data.len() as u64, "loaded bytes counted");
    assert!(after.2 > before.2, "duplicate counted");
    assert!(after.3 > before.3, "pack bytes counted");
    Ok(())
}
