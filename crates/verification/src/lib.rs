//! Verification support for transformed modules.
//!
//! Two complementary halves:
//!
//! 1. **Structural verification**: invariant checks over the representation
//!    (every reference resolves, every placed instruction is placed once,
//!    the entry block is phi-free). Transforms must hand the code generator
//!    a well-formed module no matter what they did to it.
//! 2. **Reference evaluation**: a small deterministic interpreter used to
//!    check semantic transparency - an instrumented function with no
//!    tampering present must behave exactly like the original.

pub mod interp;
pub mod structural;

use serde::{Deserialize, Serialize};
use vigil_core::Module;

pub use interp::Evaluator;
pub use structural::{verify_function, verify_module};

/// Summary of a structural verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Module the report covers.
    pub module: String,
    /// Number of defined functions checked.
    pub functions_checked: usize,
    /// Whether every check passed.
    pub sound: bool,
    /// Human-readable findings, empty when sound.
    pub findings: Vec<String>,
}

/// Runs every structural check and folds the outcome into a report.
pub fn report(module: &Module) -> VerificationReport {
    let mut findings = Vec::new();
    let mut functions_checked = 0;

    for f in module.func_ids() {
        if module.func(f).is_declaration() {
            continue;
        }
        functions_checked += 1;
        if let Err(err) = verify_function(module, f) {
            findings.push(err.to_string());
        }
    }
    if let Err(err) = structural::verify_globals(module) {
        findings.push(err.to_string());
    }

    let sound = findings.is_empty();
    if !sound {
        tracing::warn!(
            "module `{}` failed verification: {} finding(s)",
            module.name,
            findings.len()
        );
    }
    VerificationReport {
        module: module.name.clone(),
        functions_checked,
        sound,
        findings,
    }
}
