//! Command argument transfer
//!
//! Inputs are written into controller memory before a command is armed and
//! outputs are read back once it completed successfully.

mod handler;

pub use handler::{
    ArgumentError, ArgumentHandler, ArgumentValue, CommandArguments, SymbolArgumentHandler,
};
