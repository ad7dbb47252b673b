//! Round-trip tests for the runtime: register fabricated counter and name
//! tables, drive the lifecycle against a real memory-mapped report file,
//! and decode the result.
//!
//! The runtime state is process-wide, so every test serializes on one
//! lock and re-registers its own tables.

use std::ffi::{CString, c_char};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tinycoverage_format::parse_report;
use tinycoverage_runtime as cov;

static LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fabricated per-block counter and name tables, standing in for the
/// linker-concatenated ELF sections.
struct Fixture {
    counters: Box<[u8]>,
    name_ptrs: Vec<*const c_char>,
    _names: Vec<CString>,
}

impl Fixture {
    fn new(block_owners: &[&str]) -> Self {
        let names: Vec<CString> = block_owners
            .iter()
            .map(|name| CString::new(*name).unwrap())
            .collect();
        let name_ptrs: Vec<*const c_char> = names.iter().map(|name| name.as_ptr()).collect();
        Self {
            counters: vec![0u8; block_owners.len()].into_boxed_slice(),
            name_ptrs,
            _names: names,
        }
    }

    /// What the synthesized module constructor does at program start.
    fn register(&mut self) {
        let start = self.counters.as_mut_ptr().cast::<bool>();
        unsafe {
            cov::__tinycoverage_init(
                start,
                start.add(self.counters.len()),
                self.name_ptrs.as_ptr().cast_mut(),
            );
        }
    }

    /// What an instrumented block does when it executes.
    fn fire(&mut self, index: usize) {
        self.counters[index] = 1;
    }
}

#[test]
fn run_without_tests_contains_only_name_tables() {
    let _guard = lock();
    let mut fixture = Fixture::new(&["a", "a", "b"]);
    fixture.register();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report");
    cov::init(&path).unwrap();
    cov::shut_down().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let report = parse_report(&bytes).unwrap();
    assert!(report.tests.is_empty());
    assert_eq!(report.block_name_ids, vec![0, 0, 1]);
    assert_eq!(
        report.names,
        vec![(0, "a".to_string()), (1, "b".to_string())]
    );

    // truncated to the written words plus one: magic + 3 ids + magic +
    // 2 * (id + len + payload) = 11 words
    assert_eq!(bytes.len(), 12 * 4);
}

#[test]
fn test_finished_with_no_hits_is_an_empty_record() {
    let _guard = lock();
    let mut fixture = Fixture::new(&["f"]);
    fixture.register();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report");
    cov::init(&path).unwrap();
    cov::test_finished();
    cov::shut_down().unwrap();

    let report = parse_report(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(report.tests, vec![Vec::<u32>::new()]);
}

#[test]
fn delta_records_clear_flags_and_repeat_empty() {
    let _guard = lock();
    let mut fixture = Fixture::new(&["f", "f", "g"]);
    fixture.register();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report");
    cov::init(&path).unwrap();

    fixture.fire(1);
    fixture.fire(2);
    cov::test_finished();
    assert_eq!(&fixture.counters[..], &[0, 0, 0], "reporting clears flags");

    // nothing ran in between: the second record must be empty
    cov::test_finished();
    cov::shut_down().unwrap();

    let report = parse_report(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(report.tests, vec![vec![1, 2], vec![]]);
}

/// The two-branch harness scenario: main's entry/else/merge and bar fire
/// first, then only foo.
#[test]
fn two_run_harness_scenario() {
    let _guard = lock();
    let mut fixture = Fixture::new(&["main", "main", "main", "main", "foo", "bar"]);
    fixture.register();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report");
    cov::init(&path).unwrap();

    for index in [0, 2, 3, 5] {
        fixture.fire(index);
    }
    cov::test_finished();

    fixture.fire(4);
    cov::test_finished();
    cov::shut_down().unwrap();

    let report = parse_report(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(report.tests, vec![vec![0, 2, 3, 5], vec![4]]);
    assert_eq!(report.block_name_ids, vec![0, 0, 0, 0, 1, 2]);
    assert_eq!(
        report.names,
        vec![
            (0, "main".to_string()),
            (1, "foo".to_string()),
            (2, "bar".to_string()),
        ]
    );
}

#[test]
fn inverted_branch_scenario() {
    let _guard = lock();
    let mut fixture = Fixture::new(&["main", "main", "main", "main", "foo", "bar"]);
    fixture.register();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report");
    cov::init(&path).unwrap();

    for index in [0, 1, 3, 4] {
        fixture.fire(index);
    }
    cov::test_finished();
    fixture.fire(5);
    cov::test_finished();
    cov::shut_down().unwrap();

    let report = parse_report(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(report.tests, vec![vec![0, 1, 3, 4], vec![5]]);
}

#[test]
fn report_is_preallocated_then_truncated() {
    let _guard = lock();
    let mut fixture = Fixture::new(&["f"]);
    fixture.register();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report");
    cov::init_with_capacity(&path, 8192).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);

    cov::test_finished();
    cov::shut_down().unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    assert!(len < 8192, "file must shrink to the written prefix");
    assert_eq!(len % 4, 0);
}

#[test]
fn init_failure_surfaces_errno() {
    let _guard = lock();
    let mut fixture = Fixture::new(&["f"]);
    fixture.register();

    let err = cov::init(Path::new("/nonexistent-tinycoverage-dir/report")).unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENOENT));
    assert!(err.to_string().contains("open"));
}

#[test]
fn c_abi_mirrors_the_rust_api() {
    let _guard = lock();
    let mut fixture = Fixture::new(&["f", "g"]);
    fixture.register();

    let dir = tempfile::tempdir().unwrap();
    let path = CString::new(dir.path().join("report").to_str().unwrap()).unwrap();

    assert_eq!(unsafe { cov::tinycoverage_init(std::ptr::null()) }, -1);

    let bad = CString::new("/nonexistent-tinycoverage-dir/report").unwrap();
    assert_eq!(unsafe { cov::tinycoverage_init(bad.as_ptr()) }, -1);

    assert_eq!(unsafe { cov::tinycoverage_init(path.as_ptr()) }, 0);
    fixture.fire(1);
    cov::tinycoverage_test_finished();
    assert_eq!(cov::tinycoverage_shut_down(), 0);

    let report =
        parse_report(&std::fs::read(dir.path().join("report")).unwrap()).unwrap();
    assert_eq!(report.tests, vec![vec![1]]);
    assert_eq!(report.names, vec![(0, "f".to_string()), (1, "g".to_string())]);
}
