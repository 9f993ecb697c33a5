//! End-to-end behavior of the anti-tamper instrumentation: detection shape,
//! semantic transparency on clean prologues, and the response paths.

use crate::util;
use rand::{SeedableRng, rngs::StdRng};
use std::cell::Cell;
use std::rc::Rc;
use vigil_core::ir::{
    Function, GlobalVariable, Initializer, Linkage, Module, Op, Terminator, Ty, Value,
};
use vigil_core::objc::INSTANCE_METHODS_PREFIX;
use vigil_transform::Transform;
use vigil_transform::anti_hooking::{AntiHooking, AntiHookingConfig, TAMPER_CALLBACK};
use vigil_utils::errors::EvalError;
use vigil_verification::{Evaluator, verify_module};

// brk #0, b #0, br x17, nop
const BRK_WORD: u32 = 0xd420_0000;
const B_WORD: u32 = 0x1400_0000;
const BR_WORD: u32 = 0xd61f_0220;
const NOP_WORD: u32 = 0xd503_201f;

fn instrumented_module() -> (Module, vigil_core::ir::FuncId) {
    util::init_tracing();
    let mut m = Module::new("m", util::darwin_arm64());
    let f = util::affine_fn(&mut m);
    let pass = AntiHooking::new(AntiHookingConfig {
        // Point at a path that cannot exist so the environment of the test
        // runner cannot inject a callback.
        handler_path: Some("/nonexistent/handler.bc".into()),
        ..Default::default()
    });
    let mut rng = StdRng::seed_from_u64(0xa11);
    assert!(pass.apply(&mut m, &mut rng).unwrap());
    verify_module(&m).expect("instrumented module must verify");
    (m, f)
}

#[test]
fn clean_prologue_is_semantically_transparent() {
    let mut original = Module::new("m", util::darwin_arm64());
    let f0 = util::affine_fn(&mut original);
    let mut ev = Evaluator::new(&original);
    let expected = ev.run(f0, &[5]).unwrap();

    let (instrumented, f) = instrumented_module();
    let mut ev = Evaluator::new(&instrumented);
    ev.set_code_image(f, &[NOP_WORD, NOP_WORD, NOP_WORD]);
    assert_eq!(ev.run(f, &[5]).unwrap(), expected);
    // And with no image at all (reads as zeroes).
    let mut ev = Evaluator::new(&instrumented);
    assert_eq!(ev.run(f, &[5]).unwrap(), expected);
}

#[test]
fn overwritten_first_word_reaches_the_response() {
    let (m, f) = instrumented_module();
    for word in [BRK_WORD, B_WORD] {
        let mut ev = Evaluator::new(&m);
        ev.set_code_image(f, &[word, NOP_WORD, NOP_WORD]);
        assert!(
            matches!(ev.run(f, &[5]), Err(EvalError::Trapped(_))),
            "first word {word:#010x} must be detected"
        );
    }
}

#[test]
fn indirect_branch_in_second_or_third_slot_is_detected() {
    let (m, f) = instrumented_module();
    for image in [
        [NOP_WORD, BR_WORD, NOP_WORD],
        [NOP_WORD, NOP_WORD, BR_WORD],
    ] {
        let mut ev = Evaluator::new(&m);
        ev.set_code_image(f, &image);
        assert!(matches!(ev.run(f, &[5]), Err(EvalError::Trapped(_))));
    }
    // A br planted in the first slot is not what slot one looks for; the
    // first slot matches branch/trap only.
    let mut ev = Evaluator::new(&m);
    ev.set_code_image(f, &[BR_WORD, NOP_WORD, NOP_WORD]);
    assert!(ev.run(f, &[5]).is_ok());
}

#[test]
fn callback_runs_and_execution_continues() {
    let dir = tempfile::tempdir().unwrap();
    let handler = dir.path().join("handler.bc");
    std::fs::write(&handler, b"BC\xc0\xde").unwrap();

    let mut m = Module::new("m", util::darwin_arm64());
    let f = util::affine_fn(&mut m);
    let pass = AntiHooking::new(AntiHookingConfig {
        handler_path: Some(handler),
        ..Default::default()
    });
    let mut rng = StdRng::seed_from_u64(3);
    pass.apply(&mut m, &mut rng).unwrap();
    assert!(m.function_named(TAMPER_CALLBACK).is_some());

    let called = Rc::new(Cell::new(false));
    let seen = called.clone();
    let mut ev = Evaluator::new(&m);
    ev.register_external(
        TAMPER_CALLBACK,
        Box::new(move |_, _| {
            seen.set(true);
            Ok(0)
        }),
    );
    ev.set_code_image(f, &[BRK_WORD, NOP_WORD, NOP_WORD]);
    // The callback returns, the handler branches back, and the original
    // body still produces its result.
    assert_eq!(ev.run(f, &[5]).unwrap(), Some(5 * 7 + 3));
    assert!(called.get());
}

#[test]
fn abort_response_on_non_darwin_aarch64() {
    let mut m = Module::new("m", "aarch64-unknown-linux".parse().unwrap());
    let f = util::affine_fn(&mut m);
    let pass = AntiHooking::new(AntiHookingConfig {
        handler_path: Some("/nonexistent/handler.bc".into()),
        ..Default::default()
    });
    let mut rng = StdRng::seed_from_u64(3);
    assert!(pass.apply(&mut m, &mut rng).unwrap());
    let abort = m.function_named("abort").expect("abort declared");
    assert!(m.func(abort).attrs.contains("noreturn"));

    let mut ev = Evaluator::new(&m);
    ev.set_code_image(f, &[BRK_WORD, NOP_WORD, NOP_WORD]);
    assert!(matches!(ev.run(f, &[5]), Err(EvalError::Aborted)));
}

fn objc_module() -> (Module, vigil_core::ir::FuncId) {
    let mut m = Module::new("m", util::darwin_arm64());
    let mut imp = Function::define("greet_impl", vec![], Ty::Int(32));
    let entry = imp.entry();
    imp.set_terminator(entry, Terminator::Ret {
        value: Some(Value::const_int(32, 42)),
    });
    let imp = m.add_function(imp);

    let sel = m.add_global(
        "sel.greet".to_owned(),
        GlobalVariable::private(Initializer::CString("greet".to_owned())),
    );
    m.add_global(
        format!("{INSTANCE_METHODS_PREFIX}Greeter"),
        GlobalVariable {
            linkage: Linkage::Internal,
            is_constant: false,
            section: None,
            init: Some(Initializer::Struct(vec![
                Initializer::Int(vigil_core::ir::ConstInt::new(32, 24)),
                Initializer::Int(vigil_core::ir::ConstInt::new(32, 1)),
                Initializer::Array(vec![Initializer::Struct(vec![
                    Initializer::Global(sel),
                    Initializer::CString("v16@0:8".to_owned()),
                    Initializer::Func(imp),
                ])]),
            ])),
            retained: false,
        },
    );
    (m, imp)
}

fn objc_evaluator<'a>(m: &'a Module, installed: u64) -> Evaluator<'a> {
    let mut ev = Evaluator::new(m);
    ev.register_external("objc_getClass", Box::new(|_, _| Ok(0x1111)));
    ev.register_external("sel_registerName", Box::new(|_, _| Ok(0x2222)));
    ev.register_external("class_getInstanceMethod", Box::new(|_, _| Ok(0x3333)));
    ev.register_external(
        "method_getImplementation",
        Box::new(move |_, _| Ok(installed)),
    );
    ev
}

#[test]
fn unswizzled_method_runs_unchanged() {
    let (mut m, imp) = objc_module();
    let pass = AntiHooking::new(AntiHookingConfig {
        handler_path: Some("/nonexistent/handler.bc".into()),
        ..Default::default()
    });
    let mut rng = StdRng::seed_from_u64(11);
    assert!(pass.apply(&mut m, &mut rng).unwrap());
    verify_module(&m).expect("objc instrumentation must verify");

    let mut ev = objc_evaluator(&m, Evaluator::function_address(imp));
    assert_eq!(ev.run(imp, &[]).unwrap(), Some(42));
}

#[test]
fn swizzled_method_reaches_the_response() {
    let (mut m, imp) = objc_module();
    let pass = AntiHooking::new(AntiHookingConfig {
        handler_path: Some("/nonexistent/handler.bc".into()),
        ..Default::default()
    });
    let mut rng = StdRng::seed_from_u64(11);
    pass.apply(&mut m, &mut rng).unwrap();

    // The runtime reports somebody else's implementation pointer.
    let mut ev = objc_evaluator(&m, 0xdead_beef);
    assert!(matches!(ev.run(imp, &[]), Err(EvalError::Trapped(_))));
}

#[test]
fn selector_names_are_passed_to_the_runtime() {
    let (mut m, imp) = objc_module();
    let pass = AntiHooking::new(AntiHookingConfig {
        handler_path: Some("/nonexistent/handler.bc".into()),
        ..Default::default()
    });
    let mut rng = StdRng::seed_from_u64(11);
    pass.apply(&mut m, &mut rng).unwrap();

    let seen = Rc::new(Cell::new(false));
    let flag = seen.clone();
    let mut ev = objc_evaluator(&m, Evaluator::function_address(imp));
    ev.register_external(
        "sel_registerName",
        Box::new(move |machine, args| {
            assert_eq!(machine.read_cstr(args[0]), "greet");
            flag.set(true);
            Ok(0x2222)
        }),
    );
    ev.run(imp, &[]).unwrap();
    assert!(seen.get());
}

#[test]
fn pinned_calls_still_reach_their_target() {
    let mut m = Module::new("m", "x86_64-pc-linux".parse().unwrap());
    let external = m.add_function(Function::declare(
        "getpagesize",
        vec![],
        Ty::Int(32),
        false,
    ));
    let mut f = Function::define("caller", vec![], Ty::Int(32));
    let entry = f.entry();
    let size = f.append(entry, Op::Call {
        callee: vigil_core::ir::Callee::Func(external),
        args: vec![],
        ret: Ty::Int(32),
    });
    f.set_terminator(entry, Terminator::Ret { value: Some(size) });
    let f = m.add_function(f);

    let pass = AntiHooking::new(AntiHookingConfig {
        handler_path: Some("/nonexistent/handler.bc".into()),
        anti_rebind: true,
    });
    let mut rng = StdRng::seed_from_u64(1);
    assert!(pass.apply(&mut m, &mut rng).unwrap());
    verify_module(&m).expect("pinned module must verify");
    assert!(m.global_named("symbol_pin_getpagesize").is_some());

    // The call goes ptr-load -> cast -> indirect, and the pinned address
    // resolves back to the declaration's handler.
    let mut ev = Evaluator::new(&m);
    ev.register_external("getpagesize", Box::new(|_, _| Ok(4096)));
    assert_eq!(ev.run(f, &[]).unwrap(), Some(4096));
}
