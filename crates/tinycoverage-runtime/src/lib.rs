//! In-process runtime for tinycoverage-instrumented binaries
//!
//! The instrumentation pass gives every module a constructor that calls
//! [`__tinycoverage_init`] with the linker-resolved bounds of the counter
//! and name sections. The harness then drives the lifecycle:
//!
//! ```text
//! init -> (test_finished)* -> shut_down
//! ```
//!
//! `init` maps the report file; each `test_finished` appends a delta
//! record of the blocks that fired since the previous call (clearing them);
//! `shut_down` appends the function-name tables, flushes, and truncates
//! the file to its real size. The resulting binary format is defined in
//! `tinycoverage-format`.
//!
//! # Platform support
//!
//! ELF + POSIX only: section bounds come from the linker's
//! `__start_<section>` / `__stop_<section>` symbols and the report file is
//! written through `mmap`.
//!
//! # Thread safety
//!
//! `init`, `test_finished`, and `shut_down` must be driven from one
//! controller thread. The code under test may run on any number of
//! threads: coverage flags are one-way booleans, and the scan tolerates
//! the benign race by design.

mod error;
mod report;
mod runtime;

pub use error::{RuntimeError, RuntimeResult};
pub use report::DEFAULT_REPORT_CAPACITY;
pub use runtime::{
    __tinycoverage_init, init, init_with_capacity, shut_down, test_finished, tinycoverage_init,
    tinycoverage_shut_down, tinycoverage_test_finished,
};
