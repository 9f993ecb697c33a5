use crate::{PassConfig, Transform};
use rand::{SeedableRng, rngs::StdRng};
use tracing::info;
use vigil_analysis::{collect_metrics, compare};
use vigil_core::Module;
use vigil_utils::errors::TransformError;

/// Trait for running a sequence of obfuscation transforms on a module.
pub trait Pass {
    fn run(
        &self,
        module: &mut Module,
        passes: &[Box<dyn Transform>],
        cfg: &PassConfig,
        seed: u64,
    ) -> Result<(), TransformError>;
}

/// Default implementation of the Pass trait.
///
/// Each transform runs against a snapshot; the snapshot is kept when the
/// potency delta clears the acceptance threshold (or unconditionally in
/// aggressive mode). A transform that errors leaves the module untouched.
#[derive(Debug)]
pub struct DefaultPass;

impl Pass for DefaultPass {
    fn run(
        &self,
        module: &mut Module,
        passes: &[Box<dyn Transform>],
        cfg: &PassConfig,
        seed: u64,
    ) -> Result<(), TransformError> {
        let mut rng = StdRng::seed_from_u64(seed);

        for pass in passes {
            let before = collect_metrics(module)?;
            let mut snapshot = module.clone();

            let mutated = pass.apply(&mut snapshot, &mut rng)?;
            if !mutated {
                continue;
            }

            let after = collect_metrics(&snapshot)?;
            let delta = compare(&before, &after);
            let grown = after.inst_cnt as f64
                > before.inst_cnt as f64 * (1.0 + f64::from(cfg.max_inst_growth));

            let keep = cfg.aggressive || (delta >= cfg.accept_threshold && !grown);
            info!(
                "{:>20} Δ{:+.2} {}",
                pass.name(),
                delta,
                if keep { "✓" } else { "×" }
            );

            if keep {
                *module = snapshot;
            }
        }
        Ok(())
    }
}

/// Convenience function to run the default pass.
pub fn run(
    module: &mut Module,
    passes: &[Box<dyn Transform>],
    cfg: &PassConfig,
    seed: u64,
) -> Result<(), TransformError> {
    DefaultPass.run(module, passes, cfg, seed)
}
