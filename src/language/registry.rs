//! Parser registry
//!
//! Maps language identifiers and file extensions to parser instances. Ships
//! with Python, JavaScript, and TypeScript; additional languages register
//! through [`ParserRegistry::register`] as long as they satisfy the
//! [`LanguageParser`] contract.

use std::collections::HashMap;
use std::sync::Arc;

use super::parser::{LanguageParser, ParseError, TreeSitterParser};
use super::{javascript, python, typescript};

pub struct ParserRegistry {
    parsers: Vec<Arc<dyn LanguageParser>>,
    by_extension: HashMap<&'static str, usize>,
    by_language: HashMap<&'static str, usize>,
}

impl ParserRegistry {
    /// Registry with the built-in languages, each enforcing `max_file_size`.
    pub fn with_builtin_languages(max_file_size: u64) -> Result<Self, ParseError> {
        let mut registry = Self {
            parsers: Vec::new(),
            by_extension: HashMap::new(),
            by_language: HashMap::new(),
        };
        registry.register(Arc::new(TreeSitterParser::new(
            python::spec()?,
            max_file_size,
        )?));
        registry.register(Arc::new(TreeSitterParser::new(
            javascript::spec()?,
            max_file_size,
        )?));
        registry.register(Arc::new(TreeSitterParser::new(
            typescript::spec()?,
            max_file_size,
        )?));
        registry.register(Arc::new(TreeSitterParser::new(
            typescript::tsx_spec()?,
            max_file_size,
        )?));
        Ok(registry)
    }

    /// Register a parser; its extensions win over earlier registrations. The
    /// language name maps to the first parser claiming it.
    pub fn register(&mut self, parser: Arc<dyn LanguageParser>) {
        let index = self.parsers.len();
        for &ext in parser.extensions() {
            self.by_extension.insert(ext, index);
        }
        self.by_language.entry(parser.language()).or_insert(index);
        self.parsers.push(parser);
    }

    pub fn parser_for_extension(&self, extension: &str) -> Option<Arc<dyn LanguageParser>> {
        self.by_extension
            .get(extension)
            .map(|&i| Arc::clone(&self.parsers[i]))
    }

    pub fn parser_for_language(&self, language: &str) -> Option<Arc<dyn LanguageParser>> {
        self.by_language
            .get(language)
            .map(|&i| Arc::clone(&self.parsers[i]))
    }

    pub fn language_for_extension(&self, extension: &str) -> Option<&'static str> {
        self.by_extension
            .get(extension)
            .map(|&i| self.parsers[i].language())
    }

    pub fn supported_extensions(&self) -> Vec<&'static str> {
        let mut extensions: Vec<&'static str> = self.by_extension.keys().copied().collect();
        extensions.sort_unstable();
        extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::parser::ParsedFile;

    #[test]
    fn builtin_extensions_are_mapped() {
        let registry = ParserRegistry::with_builtin_languages(1_048_576).unwrap();
        assert_eq!(registry.language_for_extension("py"), Some("python"));
        assert_eq!(registry.language_for_extension("js"), Some("javascript"));
        assert_eq!(registry.language_for_extension("ts"), Some("typescript"));
        assert_eq!(registry.language_for_extension("tsx"), Some("typescript"));
        assert_eq!(registry.language_for_extension("rs"), None);
    }

    struct NullParser;

    impl LanguageParser for NullParser {
        fn language(&self) -> &'static str {
            "null"
        }
        fn extensions(&self) -> &'static [&'static str] {
            &["null"]
        }
        fn parse(&self, path: &str, source: &[u8]) -> Result<ParsedFile, ParseError> {
            Ok(ParsedFile {
                path: path.to_string(),
                language: "null",
                content_hash: super::super::parser::content_hash(source),
                size_bytes: source.len() as u64,
                ..ParsedFile::default()
            })
        }
    }

    #[test]
    fn registry_is_open_for_extension() {
        let mut registry = ParserRegistry::with_builtin_languages(1_048_576).unwrap();
        registry.register(Arc::new(NullParser));
        assert!(registry.parser_for_extension("null").is_some());
        assert!(registry.parser_for_language("null").is_some());
    }
}
