// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One-shot flag injection: `if !A[i] { A[i] = true }` at a block's first
//! insertion point.
//!
//! The guarded form costs a load and a not-taken branch after the first
//! execution. The load/store pair is intentionally not atomic: concurrent
//! executions race to store the same constant, which is benign.
//!
//! Splitting a block is not available through the LLVM C API, so the
//! primitive here rebuilds it: move the instructions at and after the
//! insertion point into a fresh tail block, retarget phis of the old
//! successors, and wire the guard branch in between.

use std::ffi::CStr;

use inkwell::IntPredicate;
use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::types::{ArrayType, IntType};
use inkwell::values::{
    AsValueRef, FunctionValue, GlobalValue, InstructionOpcode, InstructionValue, IntValue,
};
use llvm_sys::core::{
    LLVMAddIncoming, LLVMBuildPhi, LLVMCountIncoming, LLVMGetIncomingBlock, LLVMGetIncomingValue,
    LLVMInsertIntoBuilder, LLVMInstructionEraseFromParent, LLVMPositionBuilderBefore,
    LLVMReplaceAllUsesWith, LLVMTypeOf,
};
use llvm_sys::prelude::{LLVMBasicBlockRef, LLVMValueRef};

use crate::di;
use crate::graph;
use crate::select;

const PHI_NAME: &CStr = c"cov_phi";

/// Injects the guarded flag store for one module's counter array.
pub(crate) struct Injector<'a, 'ctx> {
    pub(crate) context: &'ctx Context,
    pub(crate) builder: &'a Builder<'ctx>,
    pub(crate) counters: GlobalValue<'ctx>,
    pub(crate) counters_ty: ArrayType<'ctx>,
    pub(crate) bool_ty: IntType<'ctx>,
    pub(crate) intptr_ty: IntType<'ctx>,
}

impl<'a, 'ctx> Injector<'a, 'ctx> {
    /// Instrument `block` as counter `index` of the module array.
    pub(crate) fn inject(
        &self,
        function: FunctionValue<'ctx>,
        block: BasicBlock<'ctx>,
        index: u64,
    ) {
        let Some(sp) = di::subprogram(function) else {
            return;
        };

        let is_entry = function.get_first_basic_block() == Some(block);
        let insertion_point = if is_entry {
            select::entry_insertion_point(block)
        } else {
            select::first_insertion_point(block)
        };
        let Some(insertion_point) = insertion_point else {
            return;
        };

        // Injected instructions need a location: the subprogram's scope
        // line for the entry block, line 0 elsewhere.
        let line = if is_entry { di::subprogram_line(sp) } else { 0 };
        let location = di::synthetic_location(self.context, line, sp);

        self.builder.position_before(&insertion_point);
        let indices = [
            self.intptr_ty.const_zero(),
            self.intptr_ty.const_int(index, false),
        ];
        let flag_ptr = unsafe {
            self.builder
                .build_gep(
                    self.counters_ty,
                    self.counters.as_pointer_value(),
                    &indices,
                    "cov_flag_ptr",
                )
                .unwrap()
        };
        let flag = self
            .builder
            .build_load(self.bool_ty, flag_ptr, "cov_flag")
            .unwrap()
            .into_int_value();
        let is_cold = self
            .builder
            .build_int_compare(
                IntPredicate::EQ,
                flag,
                self.bool_ty.const_zero(),
                "cov_cold",
            )
            .unwrap();

        let split = split_block_and_insert_if_then(
            self.context,
            self.builder,
            block,
            insertion_point,
            is_cold,
        );

        self.builder.position_before(&split.record_terminator);
        let store = self
            .builder
            .build_store(flag_ptr, self.bool_ty.const_int(1, false))
            .unwrap();

        // Keep other instrumentation passes off the flag accesses.
        let nosanitize = self.context.get_kind_id("nosanitize");
        let tag = self.context.metadata_node(&[]);
        let load_inst = flag.as_instruction();
        if let Some(load_inst) = load_inst {
            let _ = load_inst.set_metadata(tag, nosanitize);
        }
        let _ = store.set_metadata(tag, nosanitize);

        let stamped = [
            flag_ptr.as_instruction(),
            load_inst,
            is_cold.as_instruction(),
            Some(split.cond_br),
            Some(split.record_terminator),
            Some(store),
        ];
        for inst in stamped.into_iter().flatten() {
            di::set_location(inst, location);
        }
    }
}

struct SplitBlock<'ctx> {
    cond_br: InstructionValue<'ctx>,
    record_terminator: InstructionValue<'ctx>,
}

/// Split `block` before `split_before` and insert a conditional branch
/// whose true arm is a fresh single-branch block.
///
/// Afterwards `block` ends with `br condition, record, tail`; the moved
/// instructions (including the original terminator) live in the tail.
fn split_block_and_insert_if_then<'ctx>(
    context: &'ctx Context,
    builder: &Builder<'ctx>,
    block: BasicBlock<'ctx>,
    split_before: InstructionValue<'ctx>,
    condition: IntValue<'ctx>,
) -> SplitBlock<'ctx> {
    let function = block
        .get_parent()
        .expect("split target must be attached to a function");

    let record = context.append_basic_block(function, "cov_record");
    let tail = context.append_basic_block(function, "cov_tail");
    record.move_after(block).unwrap();
    tail.move_after(record).unwrap();

    let mut pending = Vec::new();
    let mut cursor = Some(split_before);
    while let Some(inst) = cursor {
        pending.push(inst);
        cursor = inst.get_next_instruction();
    }

    builder.position_at_end(tail);
    unsafe {
        let builder_ref = builder.as_mut_ptr();
        for inst in &pending {
            inst.remove_from_basic_block();
            LLVMInsertIntoBuilder(builder_ref, inst.as_value_ref());
        }
    }

    // The moved terminator's successors still record `block` as the
    // incoming edge of their phis; that edge now originates from `tail`.
    for successor in graph::successors(tail) {
        retarget_phis(builder, successor, block, tail);
    }

    builder.position_at_end(block);
    let cond_br = builder
        .build_conditional_branch(condition, record, tail)
        .unwrap();
    builder.position_at_end(record);
    let record_terminator = builder.build_unconditional_branch(tail).unwrap();

    SplitBlock {
        cond_br,
        record_terminator,
    }
}

fn retarget_phis<'ctx>(
    builder: &Builder<'ctx>,
    block_with_phis: BasicBlock<'ctx>,
    old_pred: BasicBlock<'ctx>,
    new_pred: BasicBlock<'ctx>,
) {
    let mut cursor = block_with_phis.get_first_instruction();
    while let Some(phi) = cursor {
        if phi.get_opcode() != InstructionOpcode::Phi {
            break;
        }
        let next = phi.get_next_instruction();
        rewrite_phi_incoming(builder, phi, old_pred, new_pred);
        cursor = next;
    }
}

/// The C API cannot edit a phi's incoming blocks in place, so a phi that
/// names the old predecessor is rebuilt with the edge retargeted and
/// swapped in for the original.
fn rewrite_phi_incoming<'ctx>(
    builder: &Builder<'ctx>,
    phi: InstructionValue<'ctx>,
    old_pred: BasicBlock<'ctx>,
    new_pred: BasicBlock<'ctx>,
) {
    unsafe {
        let phi_ref = phi.as_value_ref();
        let old_ref = old_pred.as_mut_ptr();
        let count = LLVMCountIncoming(phi_ref);

        let affected = (0..count).any(|i| LLVMGetIncomingBlock(phi_ref, i) == old_ref);
        if !affected {
            return;
        }

        let mut values: Vec<LLVMValueRef> = (0..count)
            .map(|i| LLVMGetIncomingValue(phi_ref, i))
            .collect();
        let mut blocks: Vec<LLVMBasicBlockRef> = (0..count)
            .map(|i| {
                let incoming = LLVMGetIncomingBlock(phi_ref, i);
                if incoming == old_ref {
                    new_pred.as_mut_ptr()
                } else {
                    incoming
                }
            })
            .collect();

        let builder_ref = builder.as_mut_ptr();
        LLVMPositionBuilderBefore(builder_ref, phi_ref);
        let replacement = LLVMBuildPhi(builder_ref, LLVMTypeOf(phi_ref), PHI_NAME.as_ptr());
        LLVMAddIncoming(
            replacement,
            values.as_mut_ptr(),
            blocks.as_mut_ptr(),
            count,
        );
        LLVMReplaceAllUsesWith(phi_ref, replacement);
        LLVMInstructionEraseFromParent(phi_ref);
    }
}
