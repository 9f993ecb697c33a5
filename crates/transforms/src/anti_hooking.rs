//! Anti-tamper instrumentation.
//!
//! Three mitigations, all driven from one transform:
//!
//! - **Inline-hook detection** (AArch64 only): the function's entry is split
//!   and detection blocks are inserted that read the function's own first
//!   three instruction words as data and match them against the branch, trap
//!   and indirect-branch signatures an inline hook would plant. Hooks already
//!   present when the function is entered branch into the tamper response;
//!   clean prologues fall through to the original body.
//! - **Method-swizzle detection** (Apple targets with Objective-C method
//!   tables): each eligible method implementation re-derives its own
//!   registration through the dynamic runtime and compares the installed
//!   implementation pointer against its own address.
//! - **Symbol-rebind mitigation** (opt-in): external call sites are rewritten
//!   to load the callee from a private pinned-address global, so patching the
//!   import table no longer redirects them.
//!
//! The tamper response prefers a module-defined callback (declared when a
//! precompiled handler fragment is found), then an inlined supervisor trap
//! with a randomized number on Darwin/AArch64, then `abort`.

use crate::Transform;
use crate::eligibility::{AnnotationOracle, Oracle};
use rand::{Rng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use vigil_core::ir::{
    Builder, Callee, FuncId, Function, GlobalId, GlobalVariable, Initializer, InstId, Linkage,
    Module, Op, Terminator, Ty, Value, first_insertion_point, split_block,
};
use vigil_core::objc::{self, MethodEntry};
use vigil_core::{decoder, ir::BlockId};
use vigil_utils::errors::TransformError;
use vigil_utils::paths;

/// Name of the optional module-defined tamper-response entry point.
pub const TAMPER_CALLBACK: &str = "tamper_callback";

const TRANSFORM_NAME: &str = "antihook";

/// Configuration for [`AntiHooking`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiHookingConfig {
    /// Path to a precompiled handler IR fragment. When unset, the per-user
    /// cache location keyed by target architecture and OS is probed.
    pub handler_path: Option<PathBuf>,
    /// Rewrite external call sites through pinned function-pointer globals.
    pub anti_rebind: bool,
}

/// The anti-tamper instrumentation engine.
pub struct AntiHooking {
    config: AntiHookingConfig,
    oracle: Box<dyn Oracle>,
}

impl fmt::Debug for AntiHooking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AntiHooking")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// How emitted handler blocks respond to detected tampering. Resolved once
/// per module, before any function is touched.
enum Response {
    Callback(FuncId),
    InlineTrap,
    Abort(FuncId),
}

impl AntiHooking {
    pub fn new(config: AntiHookingConfig) -> Self {
        Self {
            config,
            oracle: Box::new(AnnotationOracle::default()),
        }
    }

    pub fn with_oracle(config: AntiHookingConfig, oracle: Box<dyn Oracle>) -> Self {
        Self { config, oracle }
    }

    /// Best-effort handler-fragment probe. A readable fragment gets the
    /// callback declared so emitted responses route through it; linking the
    /// fragment itself is the host pipeline's job. Failure is logged and the
    /// trap/abort fallback stays in effect.
    fn link_handler(&self, module: &mut Module) {
        let path = self.config.handler_path.clone().or_else(|| {
            paths::handler_cache_path(module.target.arch_name(), module.target.os_name())
        });
        let Some(path) = path else {
            warn!("no handler fragment location could be resolved; using fallback response");
            return;
        };
        match std::fs::read(&path) {
            Ok(bytes) => {
                info!(
                    "linking precompiled anti-hooking handler from {} ({} bytes)",
                    path.display(),
                    bytes.len()
                );
                module.get_or_insert_function(TAMPER_CALLBACK, vec![], Ty::Void, false);
            }
            Err(err) => {
                warn!(
                    "failed to read precompiled anti-hooking handler from {}: {err}",
                    path.display()
                );
            }
        }
    }

    fn resolve_response(module: &mut Module) -> Response {
        if let Some(cb) = module.function_named(TAMPER_CALLBACK) {
            return Response::Callback(cb);
        }
        if module.target.is_darwin() && module.target.is_aarch64() {
            return Response::InlineTrap;
        }
        let abort = module.get_or_insert_function("abort", vec![], Ty::Void, false);
        module.func_mut(abort).attrs.insert("noreturn".to_owned());
        Response::Abort(abort)
    }
}

impl Transform for AntiHooking {
    fn name(&self) -> &'static str {
        "AntiHooking"
    }

    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<bool, TransformError> {
        self.link_handler(module);

        let has_objc = module.target.is_apple_vendor() && objc::has_method_lists(module);
        if has_objc {
            objc::declare_runtime(module);
        }

        let response = Self::resolve_response(module);
        let mut changed = false;

        let eligible: Vec<FuncId> = module
            .func_ids()
            .filter(|&f| self.oracle.should_transform(module.func(f), TRANSFORM_NAME))
            .collect();

        for f in eligible {
            info!("running anti-hooking on `{}`", module.func(f).name);
            if module.target.is_aarch64() {
                instrument_entry(module.func_mut(f), f, &response, rng);
                changed = true;
            }
            // Inline-hook detection is AArch64-only and is skipped silently
            // elsewhere; rebind pinning is architecture-independent.
            if self.config.anti_rebind {
                changed |= pin_external_calls(module, f);
            }
        }

        if has_objc {
            let abi = objc::detect_abi(module);
            for table in objc::method_list_globals(module) {
                for entry in objc::decode_method_list(module, table, abi)? {
                    if !self
                        .oracle
                        .should_transform(module.func(entry.imp), TRANSFORM_NAME)
                    {
                        continue;
                    }
                    instrument_method(module, &entry, &response, rng);
                    changed = true;
                }
            }
        }

        Ok(changed)
    }
}

/// Splits the entry of `func` and inserts the detection chain:
///
/// ```text
/// entry -> detect -> detect.more -> cont
///             \           \-> handler -/
///              \-> handler
/// ```
///
/// `detect` reads the function's first instruction word and matches the
/// branch and trap signatures; `detect.more` reads the words at +4 and +8
/// and matches the indirect-branch signature.
fn instrument_entry(func: &mut Function, self_id: FuncId, response: &Response, rng: &mut StdRng) {
    let i1 = Ty::Int(1);
    let i32t = Ty::Int(32);
    let i64t = Ty::Int(64);

    let entry = func.entry();
    let at = first_insertion_point(func, entry);
    let cont = split_block(func, entry, at);
    let detect = func.add_block("hook.detect");
    let detect_more = func.add_block("hook.detect.more");
    let handler = func.add_block("hook.handler");
    func.set_terminator(entry, Terminator::Br { dest: detect });

    let own_addr = Value::Func(self_id);

    {
        let mut b = Builder::new(func, detect);
        let code = b.ptr_cast(own_addr);
        let word = b.load(i32t, code);
        let branch_view = b.lshr(i32t, word, Value::const_int(32, u64::from(decoder::SHIFT_B)));
        let is_branch = b.icmp_eq(
            branch_view,
            Value::const_int(32, u64::from(decoder::AARCH64_SIGNATURE_B)),
        );
        let trap_view = b.lshr(i32t, word, Value::const_int(32, u64::from(decoder::SHIFT_BRK)));
        let is_trap = b.icmp_eq(
            trap_view,
            Value::const_int(32, u64::from(decoder::AARCH64_SIGNATURE_BRK)),
        );
        let hooked = b.or(i1, is_branch, is_trap);
        b.cond_br(hooked, handler, detect_more);
    }

    {
        let mut b = Builder::new(func, detect_more);
        let base = b.ptr_to_int(i64t, own_addr);
        let indirect_at = |b: &mut Builder<'_>, offset: u64| {
            let addr = b.add(i64t, base, Value::const_int(64, offset));
            let ptr = b.int_to_ptr(addr);
            let word = b.load(i32t, ptr);
            let view = b.lshr(i32t, word, Value::const_int(32, u64::from(decoder::SHIFT_BR)));
            b.icmp_eq(
                view,
                Value::const_int(32, u64::from(decoder::AARCH64_SIGNATURE_BR)),
            )
        };
        let hooked_at_4 = indirect_at(&mut b, 4);
        let hooked_at_8 = indirect_at(&mut b, 8);
        let hooked = b.or(i1, hooked_at_4, hooked_at_8);
        b.cond_br(hooked, handler, cont);
    }

    emit_response(func, handler, cont, response, rng);
    debug!("instrumented entry of `{}`", func.name);
}

/// Splits the entry of an Objective-C method implementation and emits the
/// swizzle check: re-resolve (class, selector) through the runtime and
/// compare the installed implementation pointer with the method's own
/// address.
fn instrument_method(
    module: &mut Module,
    entry: &MethodEntry,
    response: &Response,
    rng: &mut StdRng,
) {
    let class_str = intern_cstring(module, &entry.class_name);
    let sel_str = intern_cstring(module, &entry.selector);

    let get_class = module
        .function_named("objc_getClass")
        .expect("runtime declared before instrumentation");
    let register_sel = module
        .function_named("sel_registerName")
        .expect("runtime declared before instrumentation");
    let lookup = module
        .function_named(if entry.is_class_method {
            "class_getClassMethod"
        } else {
            "class_getInstanceMethod"
        })
        .expect("runtime declared before instrumentation");
    let get_imp = module
        .function_named("method_getImplementation")
        .expect("runtime declared before instrumentation");

    let f = entry.imp;
    let func = module.func_mut(f);
    let entry_bb = func.entry();
    let at = first_insertion_point(func, entry_bb);
    let cont = split_block(func, entry_bb, at);
    let handler = func.add_block("swizzle.handler");

    {
        let mut b = Builder::new(func, entry_bb);
        let class = b.call(Callee::Func(get_class), vec![Value::Global(class_str)], Ty::Ptr);
        let sel = b.call(Callee::Func(register_sel), vec![Value::Global(sel_str)], Ty::Ptr);
        let method = b.call(Callee::Func(lookup), vec![class, sel], Ty::Ptr);
        let installed = b.call(Callee::Func(get_imp), vec![method], Ty::Ptr);
        let own = b.ptr_cast(Value::Func(f));
        let unmodified = b.icmp_eq(installed, own);
        b.cond_br(unmodified, cont, handler);
    }

    emit_response(module.func_mut(f), handler, cont, response, rng);
    debug!(
        "instrumented {}[{} {}]",
        if entry.is_class_method { "+" } else { "-" },
        entry.class_name,
        entry.selector
    );
}

/// Rewrites external call sites in `f` to load their callee from a pinned
/// private global instead of referencing the symbol directly. One pin global
/// per callee, cached across the function.
fn pin_external_calls(module: &mut Module, f: FuncId) -> bool {
    // Collect sites first; pin-global creation and call rewriting below
    // mutate the module.
    let mut sites: Vec<(BlockId, InstId, FuncId)> = Vec::new();
    {
        let func = module.func(f);
        for bb in func.block_ids() {
            for &inst in &func.block(bb).insts {
                let Op::Call { callee, .. } = func.op(inst) else {
                    continue;
                };
                let target = match callee {
                    Callee::Func(id) => Some(*id),
                    Callee::Value(v) => match func.strip_pointer_casts(*v) {
                        Value::Func(id) => Some(id),
                        _ => None,
                    },
                    Callee::Asm(_) => None,
                };
                let Some(target) = target else { continue };
                let callee_fn = module.func(target);
                if callee_fn.is_declaration()
                    && callee_fn.linkage == Linkage::External
                    && !callee_fn.intrinsic
                    && !callee_fn.name.starts_with("clang.")
                {
                    sites.push((bb, inst, target));
                }
            }
        }
    }

    let mut pins: HashMap<FuncId, GlobalId> = HashMap::new();
    for (bb, inst, target) in &sites {
        let gv = *pins.entry(*target).or_insert_with(|| {
            let name = format!("symbol_pin_{}", module.func(*target).name);
            module.get_or_insert_global(&name, || GlobalVariable {
                linkage: Linkage::Private,
                is_constant: true,
                section: None,
                init: Some(Initializer::Func(*target)),
                retained: false,
            })
        });
        // Pins must survive DCE: nothing else references them by name.
        module.global_mut(gv).retained = true;

        let func = module.func_mut(f);
        let pos = func
            .position_in_block(*bb, *inst)
            .expect("collected call site is placed in its block");
        let loaded = func.insert_at(*bb, pos, Op::Load {
            ty: Ty::Ptr,
            ptr: Value::Global(gv),
            atomic: false,
        });
        let cast = func.insert_at(*bb, pos + 1, Op::PtrCast { value: loaded });
        let Op::Call { callee, .. } = func.op_mut(*inst) else {
            unreachable!("collected site is a call");
        };
        *callee = Callee::Value(cast);
        debug!(
            "pinned call to `{}` in `{}`",
            module.func(*target).name,
            module.func(f).name
        );
    }
    !sites.is_empty()
}

/// Fills a handler block with the tamper response and branches back to the
/// continuation. Execution is not expected to return from the response, but
/// the block is terminated regardless so the representation stays
/// well-formed.
fn emit_response(
    func: &mut Function,
    handler: BlockId,
    cont: BlockId,
    response: &Response,
    rng: &mut StdRng,
) {
    let mut b = Builder::new(func, handler);
    match response {
        Response::Callback(cb) => {
            b.call(Callee::Func(*cb), vec![], Ty::Void);
        }
        Response::InlineTrap => {
            // Randomized trap number, so handler blocks do not share one
            // byte pattern across functions.
            let trap: u32 = rng.random_range(0..65536);
            b.call(
                Callee::Asm(format!("mov w16, #1\nsvc #{trap}\n")),
                vec![],
                Ty::Void,
            );
        }
        Response::Abort(abort) => {
            b.call(Callee::Func(*abort), vec![], Ty::Void);
        }
    }
    b.br(cont);
}

/// Creates a fresh private constant holding a NUL-terminated string.
fn intern_cstring(module: &mut Module, s: &str) -> GlobalId {
    let name = module.fresh_global_name("str");
    module.add_global(name, GlobalVariable::private(Initializer::CString(s.to_owned())))
}
