//! Process-wide coverage state and lifecycle
//!
//! The runtime is a singleton driven from a single controller thread:
//! `init` once, `test_finished` between test cases, `shut_down` once at
//! exit. The instrumented code itself may run on many threads; it only
//! ever stores `true` into its flag, so the races on the counter bytes
//! are benign and are read back with relaxed atomics.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use tinycoverage_format::{MAGIC_NAME_INDICES, MAGIC_NAMES, MAGIC_TEST_ENTRY};

use crate::error::{RuntimeError, RuntimeResult};
use crate::report::{DEFAULT_REPORT_CAPACITY, ReportFile};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninit,
    Initialized,
    Finalized,
}

struct Runtime {
    phase: Phase,
    counters: *mut u8,
    block_count: usize,
    func_names: *const *const c_char,
    report: Option<ReportFile>,
}

struct RuntimeCell(UnsafeCell<Runtime>);

// The lifecycle contract pins all mutation to one controller thread; the
// per-module constructors run before main, ahead of any test traffic.
unsafe impl Sync for RuntimeCell {}

static RUNTIME: RuntimeCell = RuntimeCell(UnsafeCell::new(Runtime {
    phase: Phase::Uninit,
    counters: std::ptr::null_mut(),
    block_count: 0,
    func_names: std::ptr::null(),
    report: None,
}));

/// # Safety
///
/// Callers must be on the controller thread and must not hold a previous
/// reference from this function across the call.
unsafe fn state() -> &'static mut Runtime {
    &mut *RUNTIME.0.get()
}

/// Table registration, invoked by every instrumented module's synthesized
/// constructor. The linker has already concatenated the sections, so each
/// module passes the same whole-image bounds and the last write wins.
///
/// # Safety
///
/// `cnt_start..cnt_end` and `names_start` must describe the coverage
/// sections of the running image (or be null/empty when no module was
/// instrumented).
#[no_mangle]
pub unsafe extern "C" fn __tinycoverage_init(
    cnt_start: *mut bool,
    cnt_end: *mut bool,
    names_start: *mut *const c_char,
) {
    let rt = state();
    rt.counters = cnt_start.cast::<u8>();
    rt.block_count = if cnt_start.is_null() || cnt_end.is_null() {
        0
    } else {
        cnt_end.offset_from(cnt_start) as usize
    };
    rt.func_names = names_start.cast_const();
}

/// Open and map the report file with the default capacity.
pub fn init(report_path: &Path) -> RuntimeResult<()> {
    init_with_capacity(report_path, DEFAULT_REPORT_CAPACITY)
}

/// Open and map the report file.
///
/// The file is created at `capacity` bytes up front and shrunk to the
/// written prefix by [`shut_down`]; a crashed run leaves it at full size.
pub fn init_with_capacity(report_path: &Path, capacity: usize) -> RuntimeResult<()> {
    let path = CString::new(report_path.as_os_str().as_bytes()).map_err(|_| RuntimeError::Io {
        op: "open",
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;
    init_cstr(&path, capacity)
}

pub(crate) fn init_cstr(path: &CStr, capacity: usize) -> RuntimeResult<()> {
    let report = ReportFile::create(path, capacity)?;
    let rt = unsafe { state() };
    rt.report = Some(report);
    rt.phase = Phase::Initialized;
    Ok(())
}

/// Append one delta record: the indices of every flag set since the last
/// call, ascending, each flag cleared as it is reported.
///
/// Because reporting clears the flags, a reader cannot distinguish "block
/// never hit" from "block hit before the first `test_finished`"; harnesses
/// that care should call this once before their first test case.
pub fn test_finished() {
    let rt = unsafe { state() };
    if rt.phase != Phase::Initialized {
        return;
    }
    let Some(report) = rt.report.as_mut() else {
        return;
    };

    report.push(MAGIC_TEST_ENTRY);
    for index in 0..rt.block_count {
        // Relaxed is deliberate: the writers store a constant `true`, and
        // a hit lost to a racing scan reappears on the next test that
        // exercises the block.
        let flag = unsafe { &*(rt.counters.add(index) as *const AtomicU8) };
        if flag.load(Ordering::Relaxed) != 0 {
            report.push(index as u32);
            flag.store(0, Ordering::Relaxed);
        }
    }
}

/// Append the name tables, flush the mapping, and shrink the report file
/// to its real size. Idempotent once finalized.
pub fn shut_down() -> RuntimeResult<()> {
    let rt = unsafe { state() };
    let Some(mut report) = rt.report.take() else {
        return Ok(());
    };
    rt.phase = Phase::Finalized;

    emit_name_tables(rt, &mut report);
    report.finalize()
}

/// Names are deduplicated once at shutdown instead of streamed per test:
/// first a block-index -> name-id table, then the dictionary in
/// first-seen order.
fn emit_name_tables(rt: &Runtime, report: &mut ReportFile) {
    report.push(MAGIC_NAME_INDICES);

    let mut ids: HashMap<*const c_char, u32> = HashMap::new();
    let mut first_seen: Vec<*const c_char> = Vec::new();

    if !rt.func_names.is_null() {
        for index in 0..rt.block_count {
            let name = unsafe { *rt.func_names.add(index) };
            let next_id = ids.len() as u32;
            let id = *ids.entry(name).or_insert_with(|| {
                first_seen.push(name);
                next_id
            });
            report.push(id);
        }
    }

    report.push(MAGIC_NAMES);
    for (id, name) in first_seen.iter().enumerate() {
        report.push(id as u32);
        let bytes = if name.is_null() {
            &[][..]
        } else {
            unsafe { CStr::from_ptr(*name) }.to_bytes()
        };
        report.push_str(bytes);
    }
}

/// C ABI for non-Rust harnesses: returns 0 on success, -1 on failure with
/// `errno` left in place.
///
/// # Safety
///
/// `report_file_path` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tinycoverage_init(report_file_path: *const c_char) -> libc::c_int {
    if report_file_path.is_null() {
        return -1;
    }
    match init_cstr(CStr::from_ptr(report_file_path), DEFAULT_REPORT_CAPACITY) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// C ABI for [`test_finished`].
#[no_mangle]
pub extern "C" fn tinycoverage_test_finished() {
    test_finished();
}

/// C ABI for [`shut_down`]: returns 0 on success, -1 on failure.
#[no_mangle]
pub extern "C" fn tinycoverage_shut_down() -> libc::c_int {
    match shut_down() {
        Ok(()) => 0,
        Err(_) => -1,
    }
}
