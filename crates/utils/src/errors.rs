use thiserror::Error;

/// Error type for structural violations of the program representation.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A terminator or phi names a block that does not exist in the function.
    #[error("function `{function}`: reference to nonexistent block {block}")]
    BadBlockRef {
        function: String,
        block: usize,
    },
    /// An operand names a value that does not exist.
    #[error("function `{function}`: instruction {inst} has a dangling operand")]
    BadValueRef {
        function: String,
        inst: usize,
    },
    /// The same instruction is listed in more than one block.
    #[error("function `{function}`: instruction {inst} appears in multiple blocks")]
    DuplicateInst {
        function: String,
        inst: usize,
    },
    /// The entry block starts with a phi node.
    #[error("function `{function}`: entry block contains a phi")]
    PhiInEntry { function: String },
    /// A global initializer references a missing global or function.
    #[error("global `{global}`: dangling initializer reference")]
    BadInitializer { global: String },
}

/// Error type for decoding Objective-C method-list metadata.
///
/// Malformed shapes are fatal: they indicate the ABI-variant detection
/// (opaque-pointer vs. typed-pointer-with-authentication) was wrong for this
/// module, which is an input-contract violation rather than a recoverable
/// condition.
#[derive(Debug, Error)]
pub enum ObjcError {
    #[error("method list `{global}` is malformed: {reason}")]
    MalformedMethodList {
        global: String,
        reason: &'static str,
    },
    #[error("method list `{global}` has no initializer")]
    MissingInitializer { global: String },
}

/// Error type for the recognized configuration surface.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The per-instruction obfuscation probability is a percentage; anything
    /// above 100 is rejected outright instead of being clamped.
    #[error("obfuscation probability must be within 0-100, got {0}")]
    ProbabilityOutOfRange(u32),
    /// The pass count must be at least one.
    #[error("obfuscation pass count must be at least 1")]
    ZeroPassCount,
}

/// Error type for metrics computation.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("module defines no functions with bodies")]
    EmptyModule,
    #[error("function `{0}` has no basic blocks")]
    NoBlocks(String),
}

/// Error type for transform operations.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("Objective-C metadata decoding failed: {0}")]
    Objc(#[from] ObjcError),
    #[error("metrics computation failed: {0}")]
    Metrics(#[from] MetricsError),
    #[error("representation verification failed: {0}")]
    Verify(#[from] VerifyError),
    #[error("{0}")]
    Generic(String),
}

/// Error type for the reference evaluator.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The program called `abort` (or another noreturn response primitive).
    #[error("execution aborted")]
    Aborted,
    /// An inline-asm trap sequence was reached.
    #[error("trap reached: {0}")]
    Trapped(String),
    /// An `unreachable` terminator was executed.
    #[error("unreachable code executed")]
    UnreachableReached,
    /// A call targeted an external function with no registered handler.
    #[error("no handler registered for external function `{0}`")]
    UnknownExternal(String),
    /// An indirect call resolved to an address that is not a function.
    #[error("indirect call to non-function address {0:#x}")]
    BadIndirectCall(u64),
    /// The step limit was exhausted; the function likely diverges.
    #[error("step limit of {0} exceeded")]
    StepLimit(usize),
    /// A phi had no incoming entry for the predecessor actually taken.
    #[error("phi has no incoming value for the taken predecessor")]
    PhiMismatch,
    /// A called function is a declaration with a body expected.
    #[error("call into declaration-only function `{0}`")]
    MissingBody(String),
}
