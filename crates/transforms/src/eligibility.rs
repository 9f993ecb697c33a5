//! Per-function eligibility decisions.
//!
//! Engines never decide for themselves which functions to touch; they ask an
//! [`Oracle`] once per function (and once more per Objective-C method
//! implementation) whether a named transform applies. The default oracle
//! combines a global enable flag with per-function attribute overrides, so a
//! single function can opt in or out of one transform without affecting the
//! rest of the module.

use vigil_core::ir::Function;

/// Answers whether a named transform should run on a function.
pub trait Oracle: Send + Sync {
    fn should_transform(&self, func: &Function, transform: &str) -> bool;
}

/// Attribute-driven oracle.
///
/// A `no-<transform>` attribute always wins; a `<transform>` attribute opts
/// the function in even when the global flag is off. Declarations and
/// intrinsics are never eligible.
#[derive(Debug, Clone)]
pub struct AnnotationOracle {
    pub enabled: bool,
}

impl Default for AnnotationOracle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Oracle for AnnotationOracle {
    fn should_transform(&self, func: &Function, transform: &str) -> bool {
        if func.is_declaration() || func.intrinsic {
            return false;
        }
        if func.attrs.contains(&format!("no-{transform}")) {
            return false;
        }
        if func.attrs.contains(transform) {
            return true;
        }
        self.enabled
    }
}
