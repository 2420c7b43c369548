use std::borrow::Cow;

use thiserror::Error;

use crate::compiler::CompileError;

mod call_frame;
pub mod instruction;
pub mod value;
pub mod vm;

pub use call_frame::CallFrame;
pub use vm::VM;

pub type Result<T> = std::result::Result<T, VMError>;

#[derive(Debug, Error)]
pub enum VMError {
    #[error("{0}")]
    CompileError(#[from] CompileError),

    #[error("{0}")]
    RuntimeError(Cow<'static, str>),

    #[error("Stack overflow.")]
    StackOverflow,

    #[error("Invalid instruction byte {0:#04x}.")]
    InvalidInstruction(u8),

    #[error("Instruction pointer ran past the end of the chunk.")]
    InstructionOverrun,

    #[error("Trying to access an empty stack.")]
    EmptyStack,

    #[error("Trying to access an empty list of call frames.")]
    NoCallFrame,

    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),
}
