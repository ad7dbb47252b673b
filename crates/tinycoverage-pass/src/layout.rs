// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-module metadata: the counter and name arrays in their dedicated ELF
//! sections, the weak section-bounds declarations, and the synthesized
//! module constructor that hands the bounds to the runtime.

use std::ffi::CStr;

use inkwell::AddressSpace;
use inkwell::GlobalVisibility;
use inkwell::comdat::ComdatSelectionKind;
use inkwell::context::Context;
use inkwell::module::{Linkage, Module};
use inkwell::targets::TargetData;
use inkwell::types::{ArrayType, AsTypeRef, IntType};
use inkwell::values::{AsValueRef, FunctionValue, GlobalValue, PointerValue};
use llvm_sys::LLVMLinkage;
use llvm_sys::core::{
    LLVMAddGlobal, LLVMArrayType2, LLVMConstArray2, LLVMDeleteGlobal, LLVMGetAggregateElement,
    LLVMGetArrayLength2, LLVMGetDataLayoutStr, LLVMGetInitializer, LLVMGetNamedGlobal,
    LLVMSetAlignment, LLVMSetInitializer, LLVMSetLinkage, LLVMSetSection, LLVMTypeOf,
};
use llvm_sys::prelude::{LLVMTypeRef, LLVMValueRef};

/// Section holding one byte-wide flag per instrumented block.
pub const COUNTERS_SECTION: &str = "__tinycoverage_counters";
/// Section holding one name pointer per instrumented block.
pub const FUNC_NAMES_SECTION: &str = "__tinycoverage_func_names";

/// Linker-resolved bounds of [`COUNTERS_SECTION`].
pub const COUNTERS_START_SYMBOL: &str = "__start___tinycoverage_counters";
pub const COUNTERS_STOP_SYMBOL: &str = "__stop___tinycoverage_counters";
/// Linker-resolved start of [`FUNC_NAMES_SECTION`].
pub const FUNC_NAMES_START_SYMBOL: &str = "__start___tinycoverage_func_names";

/// Runtime entry point the module constructor calls.
pub const INIT_CALLBACK: &str = "__tinycoverage_init";
/// Name of the synthesized constructor; comdat-grouped so duplicates
/// across translation units fold at link time.
pub const MODULE_CTOR: &str = "tinycoverage.module_ctor";
/// Constructor priority, before user constructors.
pub const CTOR_PRIORITY: u64 = 2;

const COUNTERS_GLOBAL: &str = "__tinycoverage_gen_counters";
const FUNC_NAMES_GLOBAL: &str = "__tinycoverage_gen_func_names";
const NAME_GLOBAL_PREFIX: &str = "__tinycoverage_func_name_";

/// Parse the module's data layout into a `TargetData` for store-size and
/// pointer-width queries. A module without a layout gets the defaults.
pub(crate) fn module_target_data(module: &Module<'_>) -> TargetData {
    let raw = unsafe { CStr::from_ptr(LLVMGetDataLayoutStr(module.as_mut_ptr())) };
    TargetData::create(&raw.to_string_lossy())
}

/// Zero-initialized `[count x i1]` in the counters section.
pub(crate) fn create_counters<'ctx>(
    module: &Module<'ctx>,
    bool_ty: IntType<'ctx>,
    target_data: &TargetData,
    count: u32,
) -> (GlobalValue<'ctx>, ArrayType<'ctx>) {
    let array_ty = bool_ty.array_type(count);
    let array = module.add_global(array_ty, Some(AddressSpace::default()), COUNTERS_GLOBAL);
    array.set_initializer(&array_ty.const_zero());
    array.set_linkage(Linkage::Private);
    array.set_section(Some(COUNTERS_SECTION));
    set_alignment(array, target_data.get_store_size(&bool_ty) as u32);
    (array, array_ty)
}

/// `[N x ptr]` in the names section, entry `i` pointing at the linkage
/// name of the function owning block `i`.
pub(crate) fn create_func_names<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    target_data: &TargetData,
    block_owners: &[String],
) -> GlobalValue<'ctx> {
    let ptr_ty = context.ptr_type(AddressSpace::default());
    let entries: Vec<PointerValue<'ctx>> = block_owners
        .iter()
        .map(|name| function_name_global(context, module, name))
        .collect();

    let array_ty = ptr_ty.array_type(entries.len() as u32);
    let array = module.add_global(array_ty, Some(AddressSpace::default()), FUNC_NAMES_GLOBAL);
    array.set_initializer(&ptr_ty.const_array(&entries));
    array.set_linkage(Linkage::Private);
    array.set_section(Some(FUNC_NAMES_SECTION));
    set_alignment(array, target_data.get_store_size(&ptr_ty) as u32);
    array
}

fn set_alignment(global: GlobalValue<'_>, bytes: u32) {
    unsafe { LLVMSetAlignment(global.as_value_ref(), bytes) };
}

/// NUL-terminated name string, `link_once` so identical names emitted by
/// several translation units collapse into one definition.
fn function_name_global<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    name: &str,
) -> PointerValue<'ctx> {
    let symbol = format!("{NAME_GLOBAL_PREFIX}{name}");
    if let Some(existing) = module.get_global(&symbol) {
        return existing.as_pointer_value();
    }

    let init = context.const_string(name.as_bytes(), true);
    let global = module.add_global(init.get_type(), Some(AddressSpace::default()), &symbol);
    global.set_initializer(&init);
    global.set_constant(true);
    global.set_linkage(Linkage::LinkOnceAny);
    global.as_pointer_value()
}

/// The three weak hidden declarations the linker resolves to section
/// bounds. They are mutable: the linker emits non-constant symbols.
pub(crate) fn declare_section_bounds<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    bool_ty: IntType<'ctx>,
) -> (GlobalValue<'ctx>, GlobalValue<'ctx>, GlobalValue<'ctx>) {
    let ptr_ty = context.ptr_type(AddressSpace::default());

    let declare = |name: &str, is_bool: bool| {
        let global = if is_bool {
            module.add_global(bool_ty, Some(AddressSpace::default()), name)
        } else {
            module.add_global(ptr_ty, Some(AddressSpace::default()), name)
        };
        global.set_linkage(Linkage::ExternalWeak);
        global.set_visibility(GlobalVisibility::Hidden);
        global
    };

    (
        declare(COUNTERS_START_SYMBOL, true),
        declare(COUNTERS_STOP_SYMBOL, true),
        declare(FUNC_NAMES_START_SYMBOL, false),
    )
}

/// Synthesize `tinycoverage.module_ctor`, calling the runtime with the
/// section bounds, and register it at [`CTOR_PRIORITY`].
pub(crate) fn synthesize_ctor<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    counters_start: GlobalValue<'ctx>,
    counters_stop: GlobalValue<'ctx>,
    func_names_start: GlobalValue<'ctx>,
) -> FunctionValue<'ctx> {
    let ptr_ty = context.ptr_type(AddressSpace::default());
    let void_ty = context.void_type();

    let callback_ty = void_ty.fn_type(&[ptr_ty.into(), ptr_ty.into(), ptr_ty.into()], false);
    let callback = match module.get_function(INIT_CALLBACK) {
        Some(function) => function,
        None => module.add_function(INIT_CALLBACK, callback_ty, Some(Linkage::External)),
    };

    let ctor = module.add_function(MODULE_CTOR, void_ty.fn_type(&[], false), None);
    ctor.set_linkage(Linkage::Internal);
    let comdat = module.get_or_insert_comdat(MODULE_CTOR);
    comdat.set_selection_kind(ComdatSelectionKind::Any);
    ctor.as_global_value().set_comdat(comdat);

    let builder = context.create_builder();
    let body = context.append_basic_block(ctor, "entry");
    builder.position_at_end(body);
    builder
        .build_call(
            callback,
            &[
                counters_start.as_pointer_value().into(),
                counters_stop.as_pointer_value().into(),
                func_names_start.as_pointer_value().into(),
            ],
            "",
        )
        .unwrap();
    builder.build_return(None).unwrap();

    register_global_ctor(context, module, ctor, CTOR_PRIORITY);
    ctor
}

fn register_global_ctor<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    ctor: FunctionValue<'ctx>,
    priority: u64,
) {
    let ptr_ty = context.ptr_type(AddressSpace::default());
    let i32_ty = context.i32_type();
    let entry_ty = context.struct_type(&[i32_ty.into(), ptr_ty.into(), ptr_ty.into()], false);

    let ctor_ptr = ctor.as_global_value().as_pointer_value();
    let entry = context.const_struct(
        &[
            i32_ty.const_int(priority, false).into(),
            ctor_ptr.into(),
            // associated-data slot: the ctor itself, so comdat resolution
            // drops the entry together with the function
            ctor_ptr.into(),
        ],
        false,
    );

    append_to_appending_global(
        module,
        c"llvm.global_ctors",
        entry_ty.as_type_ref(),
        &[entry.as_value_ref()],
        None,
    );
}

/// Keep the metadata arrays alive through dead-stripping.
pub(crate) fn append_to_compiler_used<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    globals: &[GlobalValue<'ctx>],
) {
    if globals.is_empty() {
        return;
    }
    let ptr_ty = context.ptr_type(AddressSpace::default());
    let entries: Vec<LLVMValueRef> = globals
        .iter()
        .map(|global| global.as_pointer_value().as_value_ref())
        .collect();
    append_to_appending_global(
        module,
        c"llvm.compiler.used",
        ptr_ty.as_type_ref(),
        &entries,
        Some(c"llvm.metadata"),
    );
}

/// Append constants to a module-level appending-linkage array, preserving
/// any entries already present (the C API cannot grow an initializer in
/// place, so the global is rebuilt).
fn append_to_appending_global(
    module: &Module<'_>,
    name: &CStr,
    element_ty: LLVMTypeRef,
    fresh: &[LLVMValueRef],
    section: Option<&CStr>,
) {
    unsafe {
        let module_ref = module.as_mut_ptr();
        let mut entries: Vec<LLVMValueRef> = Vec::new();

        let existing = LLVMGetNamedGlobal(module_ref, name.as_ptr());
        if !existing.is_null() {
            let init = LLVMGetInitializer(existing);
            if !init.is_null() {
                let len = LLVMGetArrayLength2(LLVMTypeOf(init));
                for i in 0..len {
                    entries.push(LLVMGetAggregateElement(init, i as u32));
                }
            }
            LLVMDeleteGlobal(existing);
        }

        entries.extend_from_slice(fresh);

        let array_ty = LLVMArrayType2(element_ty, entries.len() as u64);
        let global = LLVMAddGlobal(module_ref, array_ty, name.as_ptr());
        LLVMSetLinkage(global, LLVMLinkage::LLVMAppendingLinkage);
        LLVMSetInitializer(
            global,
            LLVMConstArray2(element_ty, entries.as_mut_ptr(), entries.len() as u64),
        );
        if let Some(section) = section {
            LLVMSetSection(global, section.as_ptr());
        }
    }
}
