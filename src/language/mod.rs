//! Multi-language source parsing
//!
//! One generic tree-sitter extraction engine plus per-language query
//! catalogues, behind the open [`ParserRegistry`].

pub mod javascript;
pub mod parser;
pub mod python;
pub mod registry;
pub mod typescript;

pub use parser::{
    content_hash, CallRef, CreationRef, ExtractedClass, ExtractedFunction, ExtractedImport,
    ExtractedVariable, LanguageParser, ParseError, ParsedFile, VarUse, VarWrite,
};
pub use registry::ParserRegistry;
