//! JavaScript language support
//!
//! Covers function declarations, methods, arrow/function-expression
//! declarators, class syntax with heritage, and `new` expressions. There is
//! no typed catch in JavaScript, so handled-exception capture is disabled.

use super::parser::{compile_query, LanguageSpec, ParseError, QuerySet};

const CLASSES: &str = r#"
(class_declaration
  name: (identifier) @class.name
  (class_heritage [
    (identifier) @class.superclass
    (member_expression property: (property_identifier) @class.superclass)
  ])?
) @class.def
"#;

const FUNCTIONS: &str = r#"
(function_declaration
  name: (identifier) @function.name
  parameters: (formal_parameters) @function.params
  body: (statement_block) @function.body
) @function.def
(method_definition
  name: (property_identifier) @function.name
  parameters: (formal_parameters) @function.params
  body: (statement_block) @function.body
) @function.def
(variable_declarator
  name: (identifier) @function.name
  value: (arrow_function
    parameters: (formal_parameters) @function.params
    body: (_) @function.body)
) @function.def
(variable_declarator
  name: (identifier) @function.name
  value: (function_expression
    parameters: (formal_parameters) @function.params
    body: (statement_block) @function.body)
) @function.def
"#;

const CALLS: &str = r#"
(call_expression
  function: [
    (identifier) @call.name
    (member_expression object: (identifier) @call.object property: (property_identifier) @call.method)
    (member_expression property: (property_identifier) @call.method)
  ]
) @call.expr
"#;

const ASSIGNMENTS: &str = r#"
(variable_declarator name: (identifier) @assign.target) @assign.expr
(assignment_expression left: (identifier) @assign.target) @assign.expr
(augmented_assignment_expression left: (identifier) @assign.target) @assign.aug
(field_definition property: (property_identifier) @assign.target) @assign.expr
(assignment_expression
  left: (member_expression
    object: (this) @assign.self_object
    property: (property_identifier) @assign.attr_target)) @assign.expr
"#;

const IMPORTS: &str = r#"
(import_statement source: (string (string_fragment) @import.module))
"#;

const IDENTIFIERS: &str = "(identifier) @ident";

const RAISES: &str = r#"
(throw_statement (new_expression constructor: (identifier) @raise.type))
(throw_statement (identifier) @raise.type)
"#;

const CREATIONS: &str = r#"
(new_expression constructor: (identifier) @new.class) @new.expr
"#;

pub fn spec() -> Result<LanguageSpec, ParseError> {
    let grammar: tree_sitter::Language = tree_sitter_javascript::LANGUAGE.into();
    let queries = QuerySet {
        classes: compile_query("javascript", "classes", &grammar, CLASSES)?,
        functions: compile_query("javascript", "functions", &grammar, FUNCTIONS)?,
        calls: compile_query("javascript", "calls", &grammar, CALLS)?,
        assignments: compile_query("javascript", "assignments", &grammar, ASSIGNMENTS)?,
        imports: compile_query("javascript", "imports", &grammar, IMPORTS)?,
        identifiers: compile_query("javascript", "identifiers", &grammar, IDENTIFIERS)?,
        raises: Some(compile_query("javascript", "raises", &grammar, RAISES)?),
        handles: None,
        creations: Some(compile_query("javascript", "creations", &grammar, CREATIONS)?),
        decorators: None,
    };
    Ok(LanguageSpec {
        name: "javascript",
        extensions: &["js", "jsx", "mjs", "cjs"],
        grammar,
        queries,
    })
}

#[cfg(test)]
mod tests {
    use super::super::parser::{LanguageParser, TreeSitterParser};

    fn parser() -> TreeSitterParser {
        TreeSitterParser::new(super::spec().unwrap(), 1_048_576).unwrap()
    }

    const SAMPLE: &str = r#"
import { request } from './transport.js';

class Client extends Base {
  constructor(url) {
    this.url = url;
  }

  send(payload) {
    const body = serialize(payload);
    return request(this.url, body);
  }
}

const serialize = (payload) => JSON.stringify(payload);

function connect(url) {
  if (!url) {
    throw new ConnectionError("missing url");
  }
  return new Client(url);
}
"#;

    #[test]
    fn extracts_class_heritage_and_methods() {
        let parsed = parser().parse("client.js", SAMPLE.as_bytes()).unwrap();
        let class = parsed.classes.iter().find(|c| c.name == "Client").unwrap();
        assert_eq!(class.superclasses, vec!["Base".to_string()]);
        let send = parsed.functions.iter().find(|f| f.name == "send").unwrap();
        assert_eq!(send.class_name.as_deref(), Some("Client"));
        assert!(class.attributes.iter().any(|a| a.name == "url"));
    }

    #[test]
    fn arrow_declarators_become_functions_not_variables() {
        let parsed = parser().parse("client.js", SAMPLE.as_bytes()).unwrap();
        assert!(parsed.functions.iter().any(|f| f.name == "serialize"));
        assert!(!parsed.globals.iter().any(|g| g.name == "serialize"));
    }

    #[test]
    fn captures_throws_and_creations() {
        let parsed = parser().parse("client.js", SAMPLE.as_bytes()).unwrap();
        let connect = parsed.functions.iter().find(|f| f.name == "connect").unwrap();
        assert_eq!(connect.raises, vec!["ConnectionError".to_string()]);
        assert!(connect
            .creations
            .iter()
            .any(|c| c.class_name == "Client"));
        // The `new` expressions also show up in the raise path.
        let send = parsed.functions.iter().find(|f| f.name == "send").unwrap();
        assert!(send.calls.iter().any(|c| c.callee == "request"));
    }

    #[test]
    fn captures_module_imports() {
        let parsed = parser().parse("client.js", SAMPLE.as_bytes()).unwrap();
        assert_eq!(parsed.imports.len(), 1);
        assert_eq!(parsed.imports[0].module_path, "./transport.js");
    }
}
