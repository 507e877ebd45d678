pub mod interpreter;
pub mod syscalls;
pub mod witness;

pub use interpreter::{ITypeInstruction, Instruction, JTypeInstruction, RTypeInstruction};
pub use witness::Env;

#[cfg(test)]
mod tests_helpers;
