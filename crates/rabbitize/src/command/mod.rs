pub mod executor;
pub mod extract;
pub mod parse;

pub use self::executor::{PointerState, StepCtx, dispatch};
pub use self::parse::Command;
