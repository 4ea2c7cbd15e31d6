//! Python language support
//!
//! Query catalogue for the Python grammar. Object creations carry no
//! dedicated syntax here; direct calls that resolve to a class become
//! creation edges during cross-file resolution.

use super::parser::{compile_query, LanguageSpec, ParseError, QuerySet};

const CLASSES: &str = r#"
(class_definition
  name: (identifier) @class.name
  superclasses: (argument_list (_) @class.superclass)?
) @class.def
"#;

const FUNCTIONS: &str = r#"
(function_definition
  name: (identifier) @function.name
  parameters: (parameters) @function.params
  return_type: (type)? @function.return_type
  body: (block) @function.body
) @function.def
"#;

const CALLS: &str = r#"
(call
  function: [
    (identifier) @call.name
    (attribute object: (identifier) @call.object attribute: (identifier) @call.method)
    (attribute attribute: (identifier) @call.method)
  ]
) @call.expr
"#;

const ASSIGNMENTS: &str = r#"
(assignment left: (identifier) @assign.target) @assign.expr
(augmented_assignment left: (identifier) @assign.target) @assign.aug
(assignment
  left: (attribute
    object: (identifier) @assign.self_object
    attribute: (identifier) @assign.attr_target)) @assign.expr
"#;

const IMPORTS: &str = r#"
(import_statement name: (dotted_name) @import.module)
(import_statement name: (aliased_import name: (dotted_name) @import.module))
(import_from_statement module_name: (dotted_name) @import.module)
(import_from_statement module_name: (relative_import) @import.module)
"#;

const IDENTIFIERS: &str = "(identifier) @ident";

const RAISES: &str = r#"
(raise_statement (identifier) @raise.type)
(raise_statement (call function: (identifier) @raise.type))
(raise_statement (call function: (attribute attribute: (identifier) @raise.type)))
"#;

const HANDLES: &str = r#"
(except_clause . (identifier) @handle.type)
(except_clause . (attribute attribute: (identifier) @handle.type))
(except_clause . (as_pattern . (identifier) @handle.type))
(except_clause . (as_pattern . (attribute attribute: (identifier) @handle.type)))
(except_clause . (tuple (identifier) @handle.type))
"#;

const DECORATORS: &str = r#"
(decorated_definition
  (decorator [
    (identifier) @decorator.name
    (attribute attribute: (identifier) @decorator.name)
    (call function: (identifier) @decorator.name)
    (call function: (attribute attribute: (identifier) @decorator.name))
  ])
  definition: (_) @decorator.target)
"#;

pub fn spec() -> Result<LanguageSpec, ParseError> {
    let grammar: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
    let queries = QuerySet {
        classes: compile_query("python", "classes", &grammar, CLASSES)?,
        functions: compile_query("python", "functions", &grammar, FUNCTIONS)?,
        calls: compile_query("python", "calls", &grammar, CALLS)?,
        assignments: compile_query("python", "assignments", &grammar, ASSIGNMENTS)?,
        imports: compile_query("python", "imports", &grammar, IMPORTS)?,
        identifiers: compile_query("python", "identifiers", &grammar, IDENTIFIERS)?,
        raises: Some(compile_query("python", "raises", &grammar, RAISES)?),
        handles: Some(compile_query("python", "handles", &grammar, HANDLES)?),
        creations: None,
        decorators: Some(compile_query("python", "decorators", &grammar, DECORATORS)?),
    };
    Ok(LanguageSpec {
        name: "python",
        extensions: &["py"],
        grammar,
        queries,
    })
}

#[cfg(test)]
mod tests {
    use super::super::parser::{LanguageParser, TreeSitterParser};
    use crate::graph::types::ScopeType;

    fn parser() -> TreeSitterParser {
        TreeSitterParser::new(super::spec().unwrap(), 1_048_576).unwrap()
    }

    const SAMPLE: &str = r#"
import os
from collections import OrderedDict

TIMEOUT = 30

class Repository(Base):
    retries = 3

    def __init__(self, url):
        self.url = url

    def fetch(self, ref):
        path = os.path.join(self.url, ref)
        validate(path)
        return path

def validate(path):
    if not path:
        raise ValueError("empty path")
    try:
        check(path)
    except OSError:
        pass
"#;

    #[test]
    fn extracts_classes_with_superclasses() {
        let parsed = parser().parse("repo.py", SAMPLE.as_bytes()).unwrap();
        assert_eq!(parsed.classes.len(), 1);
        let class = &parsed.classes[0];
        assert_eq!(class.name, "Repository");
        assert_eq!(class.superclasses, vec!["Base".to_string()]);
        // `retries` at class level and `self.url` in __init__ both land as
        // attributes.
        let attrs: Vec<&str> = class.attributes.iter().map(|a| a.name.as_str()).collect();
        assert!(attrs.contains(&"retries"));
        assert!(attrs.contains(&"url"));
    }

    #[test]
    fn methods_carry_class_name_and_free_functions_do_not() {
        let parsed = parser().parse("repo.py", SAMPLE.as_bytes()).unwrap();
        let fetch = parsed
            .functions
            .iter()
            .find(|f| f.name == "fetch")
            .unwrap();
        assert_eq!(fetch.class_name.as_deref(), Some("Repository"));
        let validate = parsed
            .functions
            .iter()
            .find(|f| f.name == "validate")
            .unwrap();
        assert!(validate.class_name.is_none());
    }

    #[test]
    fn captures_calls_with_base_objects() {
        let parsed = parser().parse("repo.py", SAMPLE.as_bytes()).unwrap();
        let fetch = parsed
            .functions
            .iter()
            .find(|f| f.name == "fetch")
            .unwrap();
        let join = fetch.calls.iter().find(|c| c.callee == "join").unwrap();
        assert_eq!(join.call_type, "method");
        let validate = fetch.calls.iter().find(|c| c.callee == "validate").unwrap();
        assert_eq!(validate.call_type, "direct");
        assert!(validate.base_object.is_none());
    }

    #[test]
    fn captures_exceptions_and_globals() {
        let parsed = parser().parse("repo.py", SAMPLE.as_bytes()).unwrap();
        let validate = parsed
            .functions
            .iter()
            .find(|f| f.name == "validate")
            .unwrap();
        assert_eq!(validate.raises, vec!["ValueError".to_string()]);
        assert_eq!(validate.handles, vec!["OSError".to_string()]);
        let globals: Vec<&str> = parsed.globals.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(globals, vec!["TIMEOUT"]);
        assert_eq!(parsed.globals[0].scope, ScopeType::GlobalVariable);
    }

    #[test]
    fn captures_imports() {
        let parsed = parser().parse("repo.py", SAMPLE.as_bytes()).unwrap();
        let modules: Vec<&str> = parsed.imports.iter().map(|i| i.module_path.as_str()).collect();
        assert!(modules.contains(&"os"));
        assert!(modules.contains(&"collections"));
    }

    #[test]
    fn locals_and_parameters_get_scopes() {
        let parsed = parser().parse("repo.py", SAMPLE.as_bytes()).unwrap();
        let fetch = parsed
            .functions
            .iter()
            .find(|f| f.name == "fetch")
            .unwrap();
        assert!(fetch
            .parameters
            .iter()
            .any(|p| p.name == "ref" && p.scope == ScopeType::Parameter));
        assert!(fetch
            .locals
            .iter()
            .any(|v| v.name == "path" && v.scope == ScopeType::LocalVariable));
        // `path` is read again on the call lines after its declaration.
        assert!(fetch.uses.iter().any(|u| u.name == "path"));
    }

    #[test]
    fn syntax_errors_are_recoverable() {
        let broken = "def ok():\n    return 1\n\ndef broken(:\n";
        let parsed = parser().parse("broken.py", broken.as_bytes()).unwrap();
        assert!(parsed
            .errors
            .iter()
            .any(|e| e == super::super::parser::SYNTAX_ERROR_NOTE));
        assert!(parsed.functions.iter().any(|f| f.name == "ok"));
    }

    #[test]
    fn oversize_files_yield_a_note_and_no_entities() {
        let small = TreeSitterParser::new(super::spec().unwrap(), 8).unwrap();
        let parsed = small.parse("big.py", SAMPLE.as_bytes()).unwrap();
        assert_eq!(parsed.errors, vec!["oversize".to_string()]);
        assert!(parsed.functions.is_empty());
        assert!(parsed.classes.is_empty());
        // The content hash is still computed for change detection.
        assert_eq!(parsed.content_hash.len(), 64);
    }

    #[test]
    fn decorators_attach_to_their_targets() {
        let source = "@cached\ndef slow():\n    pass\n";
        let parsed = parser().parse("d.py", source.as_bytes()).unwrap();
        let slow = parsed.functions.iter().find(|f| f.name == "slow").unwrap();
        assert_eq!(slow.decorators, vec!["cached".to_string()]);
    }
}
