// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Basic-block coverage instrumentation for LLVM modules.
//!
//! For every eligible function the pass picks a reduced set of basic
//! blocks using dominator / post-dominator reasoning, injects a one-shot
//! `if !flag { flag = true }` store per selected block, and lays out two
//! per-module arrays in dedicated ELF sections:
//!
//! - `__tinycoverage_counters`: one byte-wide flag per instrumented block;
//! - `__tinycoverage_func_names`: one pointer per block to the owning
//!   function's NUL-terminated linkage name.
//!
//! A synthesized module constructor hands the linker-provided section
//! bounds to the runtime's `__tinycoverage_init` before `main` runs. A
//! sidecar `<source stem>.tcno` file records which source lines each
//! instrumented block covers.
//!
//! The pass-plugin registration shim is the host's concern; embedding the
//! pass is a single call:
//!
//! ```ignore
//! let mut pass = TinycoveragePass::new(&context, PassConfig::default());
//! let summary = pass.run(&module);
//! println!("instrumented {} blocks", summary.instrumented_blocks);
//! ```

mod di;
mod error;
mod graph;
mod inject;
mod layout;
mod notes;
mod pass;
mod select;

pub use error::NotesError;
pub use layout::{
    COUNTERS_SECTION, COUNTERS_START_SYMBOL, COUNTERS_STOP_SYMBOL, CTOR_PRIORITY,
    FUNC_NAMES_SECTION, FUNC_NAMES_START_SYMBOL, INIT_CALLBACK, MODULE_CTOR,
};
pub use pass::{PassConfig, RunSummary, TinycoveragePass};

use inkwell::context::Context;
use inkwell::module::Module;

/// Instrument `module` with a fresh pass instance.
///
/// Convenience wrapper around [`TinycoveragePass::run`].
pub fn instrument_module<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    config: PassConfig,
) -> RunSummary {
    TinycoveragePass::new(context, config).run(module)
}
