// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The module pass driver.
//!
//! One [`TinycoveragePass`] instance serves one module at a time; the host
//! (a pass-plugin shim or a build tool) calls [`TinycoveragePass::run`]
//! once per module. Per-module state is reset at the start of each run, so
//! an instance can be reused sequentially; concurrent modules need their
//! own instances.
//!
//! A run walks the module in phases: select blocks and capture their
//! source lines while the IR is still untouched, then lay out the
//! per-module metadata arrays, then inject the guards, then emit the notes
//! sidecar and synthesize the constructor. Notes I/O failure degrades the
//! run (logged, recorded in the summary) but never aborts it.

use std::collections::BTreeSet;
use std::path::PathBuf;

use inkwell::basic_block::BasicBlock;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::values::{FunctionValue, GlobalValue};
use log::{debug, warn};

use crate::di;
use crate::error::NotesError;
use crate::graph::FlowGraph;
use crate::inject::Injector;
use crate::layout;
use crate::notes::{self, NotesBuilder};
use crate::select;

/// Pass configuration.
#[derive(Debug, Clone)]
pub struct PassConfig {
    /// Directory receiving the `<source stem>.tcno` sidecar files.
    pub notes_dir: PathBuf,
    /// Skip sidecar emission entirely when false.
    pub emit_notes: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            notes_dir: PathBuf::from("."),
            emit_notes: true,
        }
    }
}

/// What one [`TinycoveragePass::run`] did to its module.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub instrumented_functions: usize,
    pub instrumented_blocks: usize,
    /// Notes sidecar written this run, if any.
    pub notes_path: Option<PathBuf>,
    /// Set when notes emission failed; instrumentation itself still
    /// happened.
    pub notes_error: Option<NotesError>,
}

struct BlockPlan<'ctx> {
    block: BasicBlock<'ctx>,
    lines: BTreeSet<u32>,
}

struct FunctionPlan<'ctx> {
    function: FunctionValue<'ctx>,
    name: String,
    source_file: String,
    blocks: Vec<BlockPlan<'ctx>>,
}

/// Module-level basic-block coverage instrumentation.
pub struct TinycoveragePass<'ctx> {
    context: &'ctx Context,
    config: PassConfig,
    notes: NotesBuilder,
    keep_alive: Vec<GlobalValue<'ctx>>,
}

impl<'ctx> TinycoveragePass<'ctx> {
    pub fn new(context: &'ctx Context, config: PassConfig) -> Self {
        Self {
            context,
            config,
            notes: NotesBuilder::default(),
            keep_alive: Vec::new(),
        }
    }

    /// Instrument every eligible function of `module`.
    pub fn run(&mut self, module: &Module<'ctx>) -> RunSummary {
        self.notes.clear();
        self.keep_alive.clear();

        let target_data = layout::module_target_data(module);
        let bool_ty = self.context.bool_type();
        let intptr_ty = self.context.ptr_sized_int_type(&target_data, None);

        // Phase 1: decide what to instrument and capture source lines
        // while the IR is still untouched.
        let mut plans: Vec<FunctionPlan<'ctx>> = Vec::new();
        for function in module.get_functions() {
            if !select::should_instrument_function(function) {
                continue;
            }
            // No subprogram means the selector has nothing to record.
            if di::subprogram(function).is_none() {
                continue;
            }
            let Some(graph) = FlowGraph::new(function) else {
                continue;
            };
            let blocks = select::select_blocks(function, &graph);
            if blocks.is_empty() {
                continue;
            }

            let name = function.get_name().to_string_lossy().into_owned();
            let source_file = di::function_source_file(function)
                .unwrap_or_else(|| "<unknown>".to_string());
            plans.push(FunctionPlan {
                function,
                name,
                source_file,
                blocks: blocks
                    .into_iter()
                    .map(|block| BlockPlan {
                        block,
                        lines: notes::block_line_set(block),
                    })
                    .collect(),
            });
        }

        let total_blocks: usize = plans.iter().map(|plan| plan.blocks.len()).sum();
        debug!(
            "tinycoverage: {} blocks in {} functions of {}",
            total_blocks,
            plans.len(),
            module.get_name().to_string_lossy(),
        );

        // Phase 2 + 3: metadata arrays, then the guards indexing into them.
        if total_blocks > 0 {
            let (counters, counters_ty) =
                layout::create_counters(module, bool_ty, &target_data, total_blocks as u32);
            let owners: Vec<String> = plans
                .iter()
                .flat_map(|plan| plan.blocks.iter().map(|_| plan.name.clone()))
                .collect();
            let func_names =
                layout::create_func_names(self.context, module, &target_data, &owners);
            self.keep_alive.push(counters);
            self.keep_alive.push(func_names);

            let builder = self.context.create_builder();
            let injector = Injector {
                context: self.context,
                builder: &builder,
                counters,
                counters_ty,
                bool_ty,
                intptr_ty,
            };
            let mut index = 0u64;
            for plan in &plans {
                for block in &plan.blocks {
                    injector.inject(plan.function, block.block, index);
                    index += 1;
                }
            }
        }

        // Phase 4: notes sidecar for this compilation unit.
        for plan in &plans {
            self.notes.record(
                &plan.source_file,
                &plan.name,
                plan.blocks.iter().map(|block| block.lines.clone()).collect(),
            );
        }
        let mut notes_path = None;
        let mut notes_error = None;
        if self.config.emit_notes && !self.notes.is_empty() {
            let path = notes::notes_path(&self.config.notes_dir, module);
            match self.notes.write_to(&path) {
                Ok(()) => notes_path = Some(path),
                Err(err) => {
                    warn!("tinycoverage: {err}; continuing without notes");
                    notes_error = Some(err);
                }
            }
        }

        // Phase 5: constructor and liveness. The bounds symbols and the
        // constructor are emitted even for modules with nothing
        // instrumented, so every object file links against the runtime the
        // same way; the weak bounds resolve to an empty range.
        let (counters_start, counters_stop, func_names_start) =
            layout::declare_section_bounds(self.context, module, bool_ty);
        layout::synthesize_ctor(
            self.context,
            module,
            counters_start,
            counters_stop,
            func_names_start,
        );
        layout::append_to_compiler_used(self.context, module, &self.keep_alive);

        RunSummary {
            instrumented_functions: plans.len(),
            instrumented_blocks: total_blocks,
            notes_path,
            notes_error,
        }
    }
}
