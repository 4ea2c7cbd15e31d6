//! TypeScript language support
//!
//! Shares the JavaScript surface with typed additions: `type_identifier`
//! class names, `extends_clause` heritage, return-type annotations, and
//! `public_field_definition` class fields. TSX is served by the same query
//! catalogue over the TSX grammar.

use super::parser::{compile_query, LanguageSpec, ParseError, QuerySet};

const CLASSES: &str = r#"
(class_declaration
  name: (type_identifier) @class.name
  (class_heritage (extends_clause value: [
    (identifier) @class.superclass
    (member_expression property: (property_identifier) @class.superclass)
  ]))?
) @class.def
"#;

const FUNCTIONS: &str = r#"
(function_declaration
  name: (identifier) @function.name
  parameters: (formal_parameters) @function.params
  return_type: (type_annotation)? @function.return_type
  body: (statement_block) @function.body
) @function.def
(method_definition
  name: (property_identifier) @function.name
  parameters: (formal_parameters) @function.params
  return_type: (type_annotation)? @function.return_type
  body: (statement_block) @function.body
) @function.def
(variable_declarator
  name: (identifier) @function.name
  value: (arrow_function
    parameters: (formal_parameters) @function.params
    body: (_) @function.body)
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
(public_field_definition (property_identifier) @assign.target) @assign.expr
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

fn build(
    name: &'static str,
    extensions: &'static [&'static str],
    grammar: tree_sitter::Language,
) -> Result<LanguageSpec, ParseError> {
    let queries = QuerySet {
        classes: compile_query(name, "classes", &grammar, CLASSES)?,
        functions: compile_query(name, "functions", &grammar, FUNCTIONS)?,
        calls: compile_query(name, "calls", &grammar, CALLS)?,
        assignments: compile_query(name, "assignments", &grammar, ASSIGNMENTS)?,
        imports: compile_query(name, "imports", &grammar, IMPORTS)?,
        identifiers: compile_query(name, "identifiers", &grammar, IDENTIFIERS)?,
        raises: Some(compile_query(name, "raises", &grammar, RAISES)?),
        handles: None,
        creations: Some(compile_query(name, "creations", &grammar, CREATIONS)?),
        decorators: None,
    };
    Ok(LanguageSpec {
        name,
        extensions,
        grammar,
        queries,
    })
}

pub fn spec() -> Result<LanguageSpec, ParseError> {
    build(
        "typescript",
        &["ts"],
        tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
    )
}

pub fn tsx_spec() -> Result<LanguageSpec, ParseError> {
    build(
        "typescript",
        &["tsx"],
        tree_sitter_typescript::LANGUAGE_TSX.into(),
    )
}
