// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Debug-info accessors over the LLVM C API surface inkwell does not wrap.
//!
//! The pass only needs four things from debug info: the subprogram attached
//! to a function, its line, the source file and line recorded on values,
//! and the ability to stamp a synthesized location onto an injected
//! instruction. All of these exist in the stable C API, so the helpers here
//! drop to `llvm_sys` directly with references obtained from inkwell
//! wrappers of the same LLVM version.

use std::os::raw::c_uint;

use inkwell::context::{AsContextRef, Context};
use inkwell::values::{AsValueRef, FunctionValue, InstructionValue};
use llvm_sys::core::{LLVMGetDebugLocFilename, LLVMGetDebugLocLine, LLVMInstructionSetDebugLoc};
use llvm_sys::debuginfo::{
    LLVMDIBuilderCreateDebugLocation, LLVMDISubprogramGetLine, LLVMGetSubprogram,
};
use llvm_sys::prelude::LLVMMetadataRef;

/// The subprogram attached to `function`, if the front end emitted one.
pub(crate) fn subprogram(function: FunctionValue<'_>) -> Option<LLVMMetadataRef> {
    let sp = unsafe { LLVMGetSubprogram(function.as_value_ref()) };
    (!sp.is_null()).then_some(sp)
}

/// The line the subprogram's definition starts on.
pub(crate) fn subprogram_line(sp: LLVMMetadataRef) -> u32 {
    unsafe { LLVMDISubprogramGetLine(sp) }
}

/// Source file recorded in the function's debug info.
pub(crate) fn function_source_file(function: FunctionValue<'_>) -> Option<String> {
    let mut len: c_uint = 0;
    let ptr = unsafe { LLVMGetDebugLocFilename(function.as_value_ref(), &mut len) };
    if ptr.is_null() || len == 0 {
        return None;
    }
    let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize) };
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Line of the instruction's debug location; 0 when it has none.
pub(crate) fn instruction_line(inst: InstructionValue<'_>) -> u32 {
    unsafe { LLVMGetDebugLocLine(inst.as_value_ref()) }
}

/// Synthesize a `(line, column 0)` location scoped to `sp`.
pub(crate) fn synthetic_location(
    context: &Context,
    line: u32,
    sp: LLVMMetadataRef,
) -> LLVMMetadataRef {
    unsafe {
        LLVMDIBuilderCreateDebugLocation(context.as_ctx_ref(), line, 0, sp, std::ptr::null_mut())
    }
}

/// Stamp `loc` onto an injected instruction.
pub(crate) fn set_location(inst: InstructionValue<'_>, loc: LLVMMetadataRef) {
    unsafe { LLVMInstructionSetDebugLoc(inst.as_value_ref(), loc) }
}
