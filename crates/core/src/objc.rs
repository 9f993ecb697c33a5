//! Objective-C method-list metadata.
//!
//! Method tables are module globals named `_OBJC_$_INSTANCE_METHODS_<Class>`
//! or `_OBJC_$_CLASS_METHODS_<Class>` whose structured initializer carries
//! `(entsize, count, [(selector, type, imp), ...])`. Two ABI encodings are in
//! circulation and the module is decoded under exactly one of them, resolved
//! up front rather than guessed at each access site:
//!
//! - [`ObjcAbi::Opaque`]: references appear directly; an implementation
//!   pointer is either the function itself or a `llvm.ptrauth`-sectioned
//!   global whose initializer holds the signed function.
//! - [`ObjcAbi::TypedPtrAuth`]: every reference is wrapped in a cast and the
//!   implementation pointer always routes through the authentication global.
//!
//! A shape that does not match the resolved encoding means the variant was
//! misdetected for this module; that is an input-contract violation and
//! decoding fails loudly.

use crate::ir::{FuncId, GlobalId, Initializer, Module, Ty};
use vigil_utils::errors::ObjcError;

pub const INSTANCE_METHODS_PREFIX: &str = "_OBJC_$_INSTANCE_METHODS_";
pub const CLASS_METHODS_PREFIX: &str = "_OBJC_$_CLASS_METHODS_";

/// Method-list ABI encoding in effect for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjcAbi {
    /// Opaque pointers, references stored directly.
    Opaque,
    /// Typed pointers with authentication wrappers around every reference.
    TypedPtrAuth,
}

/// Resolves the encoding for a module, once, before any table is decoded.
pub fn detect_abi(module: &Module) -> ObjcAbi {
    if module.typed_pointers {
        ObjcAbi::TypedPtrAuth
    } else {
        ObjcAbi::Opaque
    }
}

/// One decoded method-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodEntry {
    pub class_name: String,
    pub selector: String,
    pub is_class_method: bool,
    pub imp: FuncId,
}

/// True when the module defines any decodable method table.
pub fn has_method_lists(module: &Module) -> bool {
    !method_list_globals(module).is_empty()
}

/// Ids of the module's method-table globals: matching name prefix, carrying
/// an initializer, and not themselves pointer-authentication metadata.
pub fn method_list_globals(module: &Module) -> Vec<GlobalId> {
    module
        .global_ids()
        .filter(|&id| {
            let gv = module.global(id);
            let name = module.global_name(id);
            gv.init.is_some()
                && !gv.has_ptrauth_section()
                && (name.starts_with(INSTANCE_METHODS_PREFIX)
                    || name.starts_with(CLASS_METHODS_PREFIX))
        })
        .collect()
}

/// Declares the dynamic-runtime entry points the swizzle detector emits
/// calls to. Idempotent.
pub fn declare_runtime(module: &mut Module) {
    module.get_or_insert_function("objc_getClass", vec![Ty::Ptr], Ty::Ptr, false);
    module.get_or_insert_function("sel_registerName", vec![Ty::Ptr], Ty::Ptr, false);
    module.get_or_insert_function(
        "class_getInstanceMethod",
        vec![Ty::Ptr, Ty::Ptr],
        Ty::Ptr,
        false,
    );
    module.get_or_insert_function(
        "class_getClassMethod",
        vec![Ty::Ptr, Ty::Ptr],
        Ty::Ptr,
        false,
    );
    module.get_or_insert_function("method_getImplementation", vec![Ty::Ptr], Ty::Ptr, false);
}

/// Decodes every entry of one method table under the resolved encoding.
pub fn decode_method_list(
    module: &Module,
    table: GlobalId,
    abi: ObjcAbi,
) -> Result<Vec<MethodEntry>, ObjcError> {
    let name = module.global_name(table).to_owned();
    let is_class_method = name.starts_with(CLASS_METHODS_PREFIX);
    let class_name = name
        .strip_prefix(CLASS_METHODS_PREFIX)
        .or_else(|| name.strip_prefix(INSTANCE_METHODS_PREFIX))
        .ok_or(ObjcError::MalformedMethodList {
            global: name.clone(),
            reason: "name does not identify a method table",
        })?
        .to_owned();

    let init = module
        .global(table)
        .init
        .as_ref()
        .ok_or(ObjcError::MissingInitializer {
            global: name.clone(),
        })?;

    let Initializer::Struct(fields) = init else {
        return Err(malformed(&name, "table initializer is not a struct"));
    };
    let Some(Initializer::Array(entries)) = fields.get(2) else {
        return Err(malformed(&name, "table struct has no entry array"));
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Initializer::Struct(ops) = entry else {
            return Err(malformed(&name, "entry is not a struct"));
        };
        if ops.len() < 3 {
            return Err(malformed(&name, "entry struct is truncated"));
        }
        let selector = decode_selector(module, &name, &ops[0], abi)?;
        let imp = decode_imp(module, &name, &ops[2], abi)?;
        out.push(MethodEntry {
            class_name: class_name.clone(),
            selector,
            is_class_method,
            imp,
        });
    }
    tracing::debug!("decoded {} method entries from `{name}`", out.len());
    Ok(out)
}

fn malformed(global: &str, reason: &'static str) -> ObjcError {
    ObjcError::MalformedMethodList {
        global: global.to_owned(),
        reason,
    }
}

/// Selector field: a reference to a C-string global, direct or cast-wrapped
/// depending on the encoding.
fn decode_selector(
    module: &Module,
    table: &str,
    init: &Initializer,
    abi: ObjcAbi,
) -> Result<String, ObjcError> {
    let gv = match (abi, init) {
        (ObjcAbi::Opaque, Initializer::Global(g)) => *g,
        (ObjcAbi::TypedPtrAuth, Initializer::Cast(inner)) => match inner.as_ref() {
            Initializer::Global(g) => *g,
            _ => return Err(malformed(table, "selector cast does not wrap a global")),
        },
        _ => return Err(malformed(table, "selector reference has the wrong encoding")),
    };
    match &module.global(gv).init {
        Some(Initializer::CString(s)) => Ok(s.clone()),
        _ => Err(malformed(table, "selector name is not a C string")),
    }
}

/// Implementation field: the function pointer, possibly routed through a
/// `llvm.ptrauth` authentication global.
fn decode_imp(
    module: &Module,
    table: &str,
    init: &Initializer,
    abi: ObjcAbi,
) -> Result<FuncId, ObjcError> {
    match (abi, init) {
        (ObjcAbi::Opaque, Initializer::Func(f)) => Ok(*f),
        (ObjcAbi::Opaque, Initializer::Global(g)) => signed_imp(module, table, *g, false),
        (ObjcAbi::TypedPtrAuth, Initializer::Cast(inner)) => match inner.as_ref() {
            Initializer::Global(g) => signed_imp(module, table, *g, true),
            _ => Err(malformed(table, "implementation cast does not wrap a global")),
        },
        _ => Err(malformed(table, "implementation reference has the wrong encoding")),
    }
}

/// Follows an authentication global to the function it signs. In the typed
/// encoding the signed slot is itself cast-wrapped.
fn signed_imp(
    module: &Module,
    table: &str,
    auth: GlobalId,
    cast_wrapped: bool,
) -> Result<FuncId, ObjcError> {
    if !module.global(auth).has_ptrauth_section() {
        return Err(malformed(table, "implementation global is not ptrauth metadata"));
    }
    let slot = match &module.global(auth).init {
        Some(Initializer::Struct(fields)) if !fields.is_empty() => &fields[0],
        Some(Initializer::PtrAuth { inner, .. }) => inner.as_ref(),
        _ => return Err(malformed(table, "ptrauth global has no signed slot")),
    };
    match (cast_wrapped, slot) {
        (false, Initializer::Func(f)) => Ok(*f),
        (true, Initializer::Cast(inner)) => match inner.as_ref() {
            Initializer::Func(f) => Ok(*f),
            _ => Err(malformed(table, "signed slot cast does not wrap a function")),
        },
        _ => Err(malformed(table, "signed slot has the wrong encoding")),
    }
}
