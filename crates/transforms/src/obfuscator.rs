use crate::anti_hooking::{AntiHooking, AntiHookingConfig};
use crate::constant_encryption::{ConstantEncryption, ConstantEncryptionConfig};
use crate::{PassConfig, Transform, pass};
use serde::{Deserialize, Serialize};
use vigil_analysis::{Metrics, collect_metrics};
use vigil_core::Module;
use vigil_utils::errors::TransformError;

/// Configuration for the obfuscation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    /// Random seed for deterministic obfuscation
    pub seed: u64,
    /// Pass configuration for transform acceptance
    pub pass_config: PassConfig,
    /// Anti-tamper instrumentation, when enabled
    pub anti_hooking: Option<AntiHookingConfig>,
    /// Constant encryption, when enabled
    pub constant_encryption: Option<ConstantEncryptionConfig>,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            pass_config: PassConfig::default(),
            anti_hooking: Some(AntiHookingConfig::default()),
            constant_encryption: Some(ConstantEncryptionConfig::default()),
        }
    }
}

/// Result of the obfuscation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationReport {
    /// Target triple the module was transformed for
    pub target: String,
    /// Names of transforms that ran
    pub transforms_applied: Vec<String>,
    /// Metrics before any transform
    pub before: Metrics,
    /// Metrics after the accepted transforms
    pub after: Metrics,
    /// Seed used for the obfuscation
    pub seed_used: u64,
}

/// Main obfuscation pipeline: builds the transform list from the config and
/// runs it through the pass driver.
pub fn obfuscate_module(
    module: &mut Module,
    config: &ObfuscationConfig,
) -> Result<ObfuscationReport, TransformError> {
    let mut transforms: Vec<Box<dyn Transform>> = Vec::new();
    if let Some(ah) = &config.anti_hooking {
        transforms.push(Box::new(AntiHooking::new(ah.clone())));
    }
    if let Some(ce) = &config.constant_encryption {
        transforms.push(Box::new(ConstantEncryption::new(ce.clone())));
    }

    tracing::debug!(
        "starting obfuscation pipeline: target {}, seed {:#x}, {} transforms",
        module.target,
        config.seed,
        transforms.len()
    );

    let before = collect_metrics(module)?;
    pass::run(module, &transforms, &config.pass_config, config.seed)?;
    let after = collect_metrics(module)?;

    tracing::info!(
        "obfuscation finished: {} -> {} instructions, potency {:.2} -> {:.2}",
        before.inst_cnt,
        after.inst_cnt,
        before.potency,
        after.potency
    );

    Ok(ObfuscationReport {
        target: module.target.to_string(),
        transforms_applied: transforms.iter().map(|t| t.name().to_owned()).collect(),
        before,
        after,
        seed_used: config.seed,
    })
}
