pub mod decoder;
pub mod ir;
pub mod objc;
pub mod target;

pub use ir::Module;
pub use target::Triple;
