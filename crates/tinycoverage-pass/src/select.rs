// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block selection: decide which basic blocks carry a coverage flag.
//!
//! The goal is a useful reduction, not a graph-theoretically minimal
//! feedback set. A block that dominates all of its successors executes iff
//! one of them executes, so instrumenting the successor suffices; the
//! symmetric argument removes blocks that post-dominate every predecessor,
//! unless the predecessor edge is unique. The entry block has no guarding
//! predecessor and is always kept.

use inkwell::basic_block::BasicBlock;
use inkwell::module::Linkage;
use inkwell::values::{BasicValueEnum, FunctionValue, InstructionOpcode, InstructionValue};

use crate::graph::FlowGraph;

/// Function names the pass must never touch: its own runtime, other
/// sanitizers, and synthesized module constructors.
const RESERVED_PREFIXES: [&str; 2] = ["__sanitizer_", "__tinycoverage_"];

/// Name of the callee for direct calls, `None` otherwise.
pub(crate) fn callee_name(inst: InstructionValue<'_>) -> Option<String> {
    if inst.get_opcode() != InstructionOpcode::Call {
        return None;
    }
    // The callee is the last operand of a call instruction.
    let count = inst.get_num_operands();
    if count == 0 {
        return None;
    }
    match inst.get_operand(count - 1)?.left()? {
        BasicValueEnum::PointerValue(callee) => {
            Some(callee.get_name().to_string_lossy().into_owned())
        }
        _ => None,
    }
}

fn is_intrinsic_call(inst: InstructionValue<'_>, prefix: &str) -> bool {
    callee_name(inst).is_some_and(|name| name.starts_with(prefix))
}

pub(crate) fn is_debug_intrinsic(inst: InstructionValue<'_>) -> bool {
    is_intrinsic_call(inst, "llvm.dbg.")
}

fn is_lifetime_intrinsic(inst: InstructionValue<'_>) -> bool {
    is_intrinsic_call(inst, "llvm.lifetime.")
}

fn is_local_escape(inst: InstructionValue<'_>) -> bool {
    is_intrinsic_call(inst, "llvm.localescape")
}

/// An `alloca` with a compile-time constant size.
fn is_static_alloca(inst: InstructionValue<'_>) -> bool {
    if inst.get_opcode() != InstructionOpcode::Alloca {
        return false;
    }
    match inst.get_operand(0).and_then(|operand| operand.left()) {
        Some(BasicValueEnum::IntValue(size)) => size.is_const(),
        _ => false,
    }
}

/// First instruction that is not a phi, debug intrinsic, or lifetime
/// marker. This is the instruction the "empty block" checks look at.
pub(crate) fn first_effective_instruction(
    block: BasicBlock<'_>,
) -> Option<InstructionValue<'_>> {
    block.get_instructions().find(|inst| {
        inst.get_opcode() != InstructionOpcode::Phi
            && !is_debug_intrinsic(*inst)
            && !is_lifetime_intrinsic(*inst)
    })
}

/// First position new code may be inserted at: after phis and landing
/// pads. `catchswitch` blocks have no valid insertion point at all.
pub(crate) fn first_insertion_point(block: BasicBlock<'_>) -> Option<InstructionValue<'_>> {
    let first = block.get_instructions().find(|inst| {
        !matches!(
            inst.get_opcode(),
            InstructionOpcode::Phi | InstructionOpcode::LandingPad
        )
    })?;
    match first.get_opcode() {
        InstructionOpcode::CatchSwitch => None,
        _ => Some(first),
    }
}

/// Insertion point for the entry block: additionally skips the prologue of
/// static allocas and `llvm.localescape` calls so those stay ahead of the
/// flag update when the block is split.
pub(crate) fn entry_insertion_point(block: BasicBlock<'_>) -> Option<InstructionValue<'_>> {
    block.get_instructions().find(|inst| {
        !matches!(inst.get_opcode(), InstructionOpcode::Phi)
            && !is_debug_intrinsic(*inst)
            && !is_lifetime_intrinsic(*inst)
            && !is_static_alloca(*inst)
            && !is_local_escape(*inst)
    })
}

/// Whether the pass instruments `function` at all.
pub(crate) fn should_instrument_function(function: FunctionValue<'_>) -> bool {
    let Some(entry) = function.get_first_basic_block() else {
        return false;
    };

    let name = function.get_name().to_string_lossy();
    if name.contains(".module_ctor") || RESERVED_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return false;
    }

    if function.get_linkage() == Linkage::AvailableExternally {
        return false;
    }

    match entry.get_terminator() {
        Some(term) => term.get_opcode() != InstructionOpcode::Unreachable,
        None => false,
    }
}

/// The selection predicate for a single block.
pub(crate) fn should_instrument_block<'ctx>(
    function: FunctionValue<'ctx>,
    block: BasicBlock<'ctx>,
    graph: &FlowGraph<'ctx>,
) -> bool {
    // Blocks that immediately trap are never reported, and typically carry
    // no debug locations either.
    match first_effective_instruction(block) {
        Some(inst) if inst.get_opcode() == InstructionOpcode::Unreachable => return false,
        Some(_) => {}
        None => return false,
    }

    if first_insertion_point(block).is_none() {
        return false;
    }

    if function.get_first_basic_block() == Some(block) {
        return true;
    }

    !graph.is_full_dominator(block)
        && !(graph.is_full_post_dominator(block) && graph.incoming_edge_count(block) > 1)
}

/// All blocks of `function` to instrument, in function order. This order
/// defines the block indices used by the metadata arrays and the notes
/// file.
pub(crate) fn select_blocks<'ctx>(
    function: FunctionValue<'ctx>,
    graph: &FlowGraph<'ctx>,
) -> Vec<BasicBlock<'ctx>> {
    function
        .get_basic_blocks()
        .into_iter()
        .filter(|block| should_instrument_block(function, *block, graph))
        .collect()
}

#[cfg(test)]
mod tests {
    use inkwell::context::Context;
    use inkwell::module::Module;
    use inkwell::values::FunctionValue;

    use super::*;

    fn empty_function<'ctx>(
        context: &'ctx Context,
        module: &Module<'ctx>,
        name: &str,
    ) -> FunctionValue<'ctx> {
        let fn_ty = context.void_type().fn_type(&[], false);
        module.add_function(name, fn_ty, None)
    }

    /// entry -> ret
    fn straight_line<'ctx>(context: &'ctx Context, module: &Module<'ctx>) -> FunctionValue<'ctx> {
        let function = empty_function(context, module, "straight");
        let builder = context.create_builder();
        let entry = context.append_basic_block(function, "entry");
        builder.position_at_end(entry);
        builder.build_return(None).unwrap();
        function
    }

    /// entry -> {then, other} -> merge -> ret
    fn diamond<'ctx>(context: &'ctx Context, module: &Module<'ctx>) -> FunctionValue<'ctx> {
        let function = empty_function(context, module, "diamond");
        let builder = context.create_builder();
        let entry = context.append_basic_block(function, "entry");
        let then = context.append_basic_block(function, "then");
        let other = context.append_basic_block(function, "other");
        let merge = context.append_basic_block(function, "merge");

        builder.position_at_end(entry);
        let cond = context.bool_type().const_int(1, false);
        builder.build_conditional_branch(cond, then, other).unwrap();
        builder.position_at_end(then);
        builder.build_unconditional_branch(merge).unwrap();
        builder.position_at_end(other);
        builder.build_unconditional_branch(merge).unwrap();
        builder.position_at_end(merge);
        builder.build_return(None).unwrap();
        function
    }

    /// entry -> header -> {body, exit}, body -> header
    fn simple_loop<'ctx>(context: &'ctx Context, module: &Module<'ctx>) -> FunctionValue<'ctx> {
        let function = empty_function(context, module, "looped");
        let builder = context.create_builder();
        let entry = context.append_basic_block(function, "entry");
        let header = context.append_basic_block(function, "header");
        let body = context.append_basic_block(function, "body");
        let exit = context.append_basic_block(function, "exit");

        let cond = context.bool_type().const_int(1, false);
        builder.position_at_end(entry);
        builder.build_unconditional_branch(header).unwrap();
        builder.position_at_end(header);
        builder.build_conditional_branch(cond, body, exit).unwrap();
        builder.position_at_end(body);
        builder.build_unconditional_branch(header).unwrap();
        builder.position_at_end(exit);
        builder.build_return(None).unwrap();
        function
    }

    fn selected_names(function: FunctionValue<'_>) -> Vec<String> {
        let graph = FlowGraph::new(function).unwrap();
        select_blocks(function, &graph)
            .into_iter()
            .map(|block| block.get_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn entry_is_always_selected() {
        let context = Context::create();
        let module = context.create_module("m");
        let function = straight_line(&context, &module);
        assert_eq!(selected_names(function), ["entry"]);
    }

    #[test]
    fn diamond_keeps_entry_and_arms() {
        let context = Context::create();
        let module = context.create_module("m");
        let function = diamond(&context, &module);
        // merge post-dominates both arms and has two predecessors
        assert_eq!(selected_names(function), ["entry", "then", "other"]);
    }

    #[test]
    fn chain_drops_full_dominator_keeps_tail() {
        let context = Context::create();
        let module = context.create_module("m");
        let function = empty_function(&context, &module, "chain");
        let builder = context.create_builder();
        let a = context.append_basic_block(function, "a");
        let b = context.append_basic_block(function, "b");
        let c = context.append_basic_block(function, "c");
        builder.position_at_end(a);
        builder.build_unconditional_branch(b).unwrap();
        builder.position_at_end(b);
        builder.build_unconditional_branch(c).unwrap();
        builder.position_at_end(c);
        builder.build_return(None).unwrap();

        // b fully dominates its successor; c has a single incoming edge, so
        // the post-dominator clause does not remove it
        assert_eq!(selected_names(function), ["a", "c"]);
    }

    #[test]
    fn loop_selects_body_and_exit_not_header() {
        let context = Context::create();
        let module = context.create_module("m");
        let function = simple_loop(&context, &module);
        // header fully dominates body and exit
        assert_eq!(selected_names(function), ["entry", "body", "exit"]);
    }

    #[test]
    fn unreachable_block_is_skipped() {
        let context = Context::create();
        let module = context.create_module("m");
        let function = empty_function(&context, &module, "traps");
        let builder = context.create_builder();
        let entry = context.append_basic_block(function, "entry");
        let trap = context.append_basic_block(function, "trap");
        let done = context.append_basic_block(function, "done");
        let cond = context.bool_type().const_int(1, false);
        builder.position_at_end(entry);
        builder.build_conditional_branch(cond, trap, done).unwrap();
        builder.position_at_end(trap);
        builder.build_unreachable().unwrap();
        builder.position_at_end(done);
        builder.build_return(None).unwrap();

        assert_eq!(selected_names(function), ["entry", "done"]);
    }

    #[test]
    fn selection_is_deterministic() {
        let context = Context::create();
        let module = context.create_module("m");
        let function = simple_loop(&context, &module);
        assert_eq!(selected_names(function), selected_names(function));
    }

    #[test]
    fn reserved_names_and_declarations_are_rejected() {
        let context = Context::create();
        let module = context.create_module("m");

        let declaration = empty_function(&context, &module, "declared_only");
        assert!(!should_instrument_function(declaration));

        for name in [
            "__sanitizer_cov_reset",
            "__tinycoverage_init",
            "app.module_ctor",
        ] {
            let function = empty_function(&context, &module, name);
            let builder = context.create_builder();
            let entry = context.append_basic_block(function, "entry");
            builder.position_at_end(entry);
            builder.build_return(None).unwrap();
            assert!(!should_instrument_function(function), "{name}");
        }
    }

    #[test]
    fn unreachable_entry_terminator_rejects_function() {
        let context = Context::create();
        let module = context.create_module("m");
        let function = empty_function(&context, &module, "aborts");
        let builder = context.create_builder();
        let entry = context.append_basic_block(function, "entry");
        builder.position_at_end(entry);
        builder.build_unreachable().unwrap();
        assert!(!should_instrument_function(function));
    }
}
