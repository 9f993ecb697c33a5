pub mod anti_hooking;
pub mod constant_encryption;
pub mod eligibility;
pub mod obfuscator;
pub mod pass;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use vigil_core::Module;
use vigil_core::ir::{BlockId, Function, InstId};
use vigil_utils::errors::TransformError;

/// Trait for obfuscation transforms over the program representation.
pub trait Transform: Send + Sync {
    /// Returns the transform's name for logging and identification.
    fn name(&self) -> &'static str;
    /// Applies the transform to the module, returning whether changes were made.
    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<bool, TransformError>;
}

/// External collaborator that rewrites a synthesized XOR into an equivalent
/// disguised instruction sequence. The engine only knows where the XOR sits;
/// what it becomes is entirely up to the substituter.
pub trait XorSubstituter: Send + Sync {
    fn substitute(&self, func: &mut Function, block: BlockId, xor: InstId, rng: &mut StdRng);
}

/// Configuration for transform passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassConfig {
    /// Minimum quality threshold for accepting transforms
    pub accept_threshold: f64,
    /// Apply transforms aggressively without quality gates
    pub aggressive: bool,
    /// Maximum allowable instruction-count increase (as ratio)
    pub max_inst_growth: f32,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.0,
            aggressive: true,
            max_inst_growth: 2.0, // 200% growth limit when not aggressive
        }
    }
}
