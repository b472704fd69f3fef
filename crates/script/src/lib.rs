//! Output script classification and disassembly.

pub mod opcodes;
pub mod standard;

pub use standard::{parse_script, ScriptError, ScriptInfo, ScriptKind};
