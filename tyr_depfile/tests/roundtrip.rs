//! Save / update / load round trips between the shared table and its file.

use parking_lot::Mutex;
use tyr_shm::{ShmConfig, SharedMem};

// All regions map at the same fixed address, so tests must not overlap.
static REGION_LOCK: Mutex<()> = Mutex::new(());

fn with_region<F: FnOnce(&SharedMem)>(f: F) {
    let _guard = REGION_LOCK.lock();
    let config = ShmConfig {
        global_size_b: 4096,
        heap_size: 1024 * 1024,
        dep_table_pow: 10,
        hash_table_pow: 8,
        ..Default::default()
    };
    let (shm, _connector) = SharedMem::init(&config).expect("region init failed");
    // Cached readers must not leak between tests sharing this process.
    tyr_depfile::cleanup(&shm);
    f(&shm);
}

#[test]
fn save_then_open_round_trips() {
    with_region(|shm| {
        let deps = shm.deps();
        deps.add(1, 2).unwrap();
        deps.add(1, 3).unwrap();
        deps.add(9, 4).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.bin");
        let edges = tyr_depfile::save(shm, &path, "rev-1", false).unwrap();
        assert_eq!(edges, 3);

        // The store stays in memory mode on a plain save.
        assert_eq!(shm.sink_path(), None);
        assert_eq!(deps.entry_count(), 3);

        let mut file = tyr_depfile::DepFile::open(&path, Some("rev-1")).unwrap();
        assert_eq!(file.build_revision(), "rev-1");
        assert_eq!(file.key_count(), 2);
        let mut vals = file.get(1).unwrap().into_vec();
        vals.sort_unstable();
        assert_eq!(vals, vec![2, 3]);
        assert_eq!(file.get(9).unwrap().into_vec(), vec![4]);
        assert!(file.get(42).unwrap().is_empty());
    });
}

#[test]
fn build_revision_is_verified_unless_ignored() {
    with_region(|shm| {
        shm.deps().add(1, 2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.bin");
        tyr_depfile::save(shm, &path, "rev-old", false).unwrap();

        let err = tyr_depfile::DepFile::open(&path, Some("rev-new")).unwrap_err();
        assert!(matches!(
            err,
            tyr_depfile::DepFileError::BuildRevisionMismatch(_, _)
        ));

        // Ignoring the revision still verifies the magic.
        let file = tyr_depfile::DepFile::open(&path, None).unwrap();
        assert_eq!(file.build_revision(), "rev-old");
    });
}

#[test]
fn update_merges_existing_rows() {
    with_region(|shm| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.bin");

        shm.deps().add(1, 2).unwrap();
        shm.deps().add(1, 3).unwrap();
        tyr_depfile::save(shm, &path, "rev", false).unwrap();

        // A new round of checking produces different edges.
        shm.deps().reset();
        shm.deps().add(1, 4).unwrap();
        shm.deps().add(5, 6).unwrap();
        let merged = tyr_depfile::update(shm, &path, "rev", false).unwrap();
        assert_eq!(merged, 2);

        let mut file = tyr_depfile::DepFile::open(&path, Some("rev")).unwrap();
        let mut vals = file.get(1).unwrap().into_vec();
        vals.sort_unstable();
        assert_eq!(vals, vec![2, 3, 4]);
        assert_eq!(file.get(5).unwrap().into_vec(), vec![6]);
    });
}

#[test]
fn save_with_replace_switches_to_file_mode() {
    with_region(|shm| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.bin");

        shm.deps().add(7, 8).unwrap();
        shm.deps().add(7, 9).unwrap();
        tyr_depfile::save(shm, &path, "rev", true).unwrap();

        // The in-memory table was retired and the path recorded.
        assert_eq!(shm.deps().entry_count(), 0);
        assert_eq!(shm.sink_path().as_deref(), path.to_str());

        // Queries now come from the file, through the cached reader.
        let mut vals = tyr_depfile::get_dep(shm, 7).unwrap().unwrap().into_vec();
        vals.sort_unstable();
        assert_eq!(vals, vec![8, 9]);
        assert!(tyr_depfile::get_dep(shm, 1000).unwrap().unwrap().is_empty());

        tyr_depfile::cleanup(shm);
        assert_eq!(shm.sink_path(), None);
        assert!(tyr_depfile::get_dep(shm, 7).unwrap().is_none());
    });
}

#[test]
fn load_adopts_an_existing_file() {
    with_region(|shm| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.bin");

        shm.deps().add(11, 12).unwrap();
        tyr_depfile::save(shm, &path, "rev-x", false).unwrap();
        shm.deps().reset();

        tyr_depfile::load(shm, &path, Some("rev-x")).unwrap();
        assert_eq!(shm.sink_path().as_deref(), path.to_str());
        assert_eq!(
            tyr_depfile::get_dep(shm, 11).unwrap().unwrap().into_vec(),
            vec![12]
        );
    });
}

#[test]
fn env_var_selects_the_file() {
    assert!(tyr_depfile::file_info_on_disk_path().is_none());
    std::env::set_var(tyr_depfile::FILE_INFO_ON_DISK_PATH, "");
    assert!(tyr_depfile::file_info_on_disk_path().is_none());
    std::env::set_var(tyr_depfile::FILE_INFO_ON_DISK_PATH, "/tmp/fi.bin");
    assert_eq!(
        tyr_depfile::file_info_on_disk_path(),
        Some(std::path::PathBuf::from("/tmp/fi.bin"))
    );
    std::env::remove_var(tyr_depfile::FILE_INFO_ON_DISK_PATH);
}
