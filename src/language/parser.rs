//! Generic query-driven source extraction
//!
//! Each language contributes a grammar plus a catalogue of named tree-sitter
//! queries ([`QuerySet`]); one extraction loop turns their captures into the
//! entity and edge contributions of a single file. Language detail stays in
//! the query strings, never in the loop.
//!
//! Cross-file targets (calls, superclasses, object creations) are emitted as
//! names only; resolution against the project symbol index happens in the
//! graph builder.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;
use streaming_iterator::StreamingIterator;
use tree_sitter::{Language, Node, Query, QueryCursor, Tree};

use crate::graph::types::ScopeType;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to load grammar for {language}: {message}")]
    Grammar { language: String, message: String },

    #[error("query compilation failed for {language}/{query}: {message}")]
    QueryCompile {
        language: String,
        query: &'static str,
        message: String,
    },

    #[error("tree-sitter returned no tree for {path}")]
    NoTree { path: String },
}

/// Error note recorded on oversize files.
pub const OVERSIZE_NOTE: &str = "oversize";
/// Error note recorded when the tree contains syntax errors.
pub const SYNTAX_ERROR_NOTE: &str = "syntax_error";

/// A call site referencing its target by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRef {
    pub callee: String,
    pub base_object: Option<String>,
    /// `direct` or `method`.
    pub call_type: String,
    pub line: u32,
}

/// A read of a declared variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarUse {
    pub name: String,
    pub line: u32,
}

/// A write to an already-declared variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarWrite {
    pub name: String,
    pub line: u32,
    /// `assignment` or `augmented`.
    pub modification_type: String,
}

/// An explicit constructor invocation (`new X()` style languages).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationRef {
    pub class_name: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedVariable {
    pub name: String,
    pub line: u32,
    pub scope: ScopeType,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtractedFunction {
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: String,
    pub parameters_str: String,
    /// Set when the definition sits inside a class body.
    pub class_name: Option<String>,
    pub parameters: Vec<ExtractedVariable>,
    pub locals: Vec<ExtractedVariable>,
    pub decorators: Vec<String>,
    pub calls: Vec<CallRef>,
    pub creations: Vec<CreationRef>,
    pub raises: Vec<String>,
    pub handles: Vec<String>,
    pub uses: Vec<VarUse>,
    pub writes: Vec<VarWrite>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtractedClass {
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub superclasses: Vec<String>,
    pub decorators: Vec<String>,
    pub attributes: Vec<ExtractedVariable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImport {
    pub module_path: String,
    pub line: u32,
}

/// Node and edge contributions of a single file. Functions are flat; methods
/// carry their `class_name`.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub path: String,
    pub language: &'static str,
    pub content_hash: String,
    pub size_bytes: u64,
    pub classes: Vec<ExtractedClass>,
    pub functions: Vec<ExtractedFunction>,
    pub globals: Vec<ExtractedVariable>,
    pub imports: Vec<ExtractedImport>,
    pub errors: Vec<String>,
}

impl ParsedFile {
    /// Graph entities this file will contribute; drives batch flushing.
    pub fn entity_count(&self) -> usize {
        1 + self.classes.len()
            + self.imports.len()
            + self.globals.len()
            + self
                .functions
                .iter()
                .map(|f| 1 + f.parameters.len() + f.locals.len())
                .sum::<usize>()
    }
}

/// SHA-256 hex over the canonical bytes; the change detector's currency.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// The shared parser contract. The registry is open: any implementation of
/// this trait can be registered for additional languages.
pub trait LanguageParser: Send + Sync {
    fn language(&self) -> &'static str;

    fn extensions(&self) -> &'static [&'static str];

    /// Parse one file. Syntax errors are recoverable: the partial entity set
    /// is returned with notes in `errors`. A file with nothing recognizable
    /// still yields an empty `ParsedFile` so a `File` node exists.
    fn parse(&self, path: &str, source: &[u8]) -> Result<ParsedFile, ParseError>;
}

/// Query catalogue a language hands to the generic engine. `None` entries
/// disable the concern for that language.
pub struct QuerySet {
    pub classes: Query,
    pub functions: Query,
    pub calls: Query,
    pub assignments: Query,
    pub imports: Query,
    pub identifiers: Query,
    pub raises: Option<Query>,
    pub handles: Option<Query>,
    pub creations: Option<Query>,
    pub decorators: Option<Query>,
}

/// Everything the generic engine needs to know about a language.
pub struct LanguageSpec {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    pub grammar: Language,
    pub queries: QuerySet,
}

/// Compile one query source against a grammar, mapping failures to
/// [`ParseError::QueryCompile`].
pub fn compile_query(
    language_name: &'static str,
    query_name: &'static str,
    grammar: &Language,
    source: &str,
) -> Result<Query, ParseError> {
    Query::new(grammar, source).map_err(|e| ParseError::QueryCompile {
        language: language_name.to_string(),
        query: query_name,
        message: e.to_string(),
    })
}

/// Generic tree-sitter parser driving a [`LanguageSpec`].
pub struct TreeSitterParser {
    spec: LanguageSpec,
    max_file_size: u64,
    // tree_sitter::Parser is Send but not Sync.
    parser: Mutex<tree_sitter::Parser>,
}

impl TreeSitterParser {
    pub fn new(spec: LanguageSpec, max_file_size: u64) -> Result<Self, ParseError> {
        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&spec.grammar)
            .map_err(|e| ParseError::Grammar {
                language: spec.name.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            spec,
            max_file_size,
            parser: Mutex::new(parser),
        })
    }

    fn parse_tree(&self, source: &[u8], path: &str) -> Result<Tree, ParseError> {
        let mut parser = self.parser.lock().expect("parser mutex poisoned");
        parser.parse(source, None).ok_or_else(|| ParseError::NoTree {
            path: path.to_string(),
        })
    }
}

impl LanguageParser for TreeSitterParser {
    fn language(&self) -> &'static str {
        self.spec.name
    }

    fn extensions(&self) -> &'static [&'static str] {
        self.spec.extensions
    }

    fn parse(&self, path: &str, source: &[u8]) -> Result<ParsedFile, ParseError> {
        let mut parsed = ParsedFile {
            path: path.to_string(),
            language: self.spec.name,
            content_hash: content_hash(source),
            size_bytes: source.len() as u64,
            ..ParsedFile::default()
        };

        if source.len() as u64 > self.max_file_size {
            parsed.errors.push(OVERSIZE_NOTE.to_string());
            debug!(path, size = source.len(), "skipping oversize file");
            return Ok(parsed);
        }
        if source.is_empty() {
            return Ok(parsed);
        }

        let text = String::from_utf8_lossy(source).into_owned();
        let tree = self.parse_tree(text.as_bytes(), path)?;
        if tree.root_node().has_error() {
            parsed.errors.push(SYNTAX_ERROR_NOTE.to_string());
        }

        Extraction::new(&self.spec.queries, &text, &tree).run(&mut parsed);
        debug!(
            path,
            classes = parsed.classes.len(),
            functions = parsed.functions.len(),
            errors = parsed.errors.len(),
            "extracted file"
        );
        Ok(parsed)
    }
}

fn line_of(node: &Node) -> u32 {
    node.start_position().row as u32 + 1
}

fn end_line_of(node: &Node) -> u32 {
    node.end_position().row as u32 + 1
}

fn text_of(node: &Node, source: &str) -> String {
    node.utf8_text(source.as_bytes())
        .unwrap_or_default()
        .to_string()
}

/// Identifier leaves under a node; used to pull parameter names out of the
/// parameter list without per-language patterns.
fn identifier_leaves(node: &Node, source: &str) -> Vec<(String, u32)> {
    let mut out = Vec::new();
    let mut stack = vec![*node];
    while let Some(current) = stack.pop() {
        if matches!(
            current.kind(),
            "identifier" | "shorthand_property_identifier_pattern"
        ) {
            out.push((text_of(&current, source), line_of(&current)));
            continue;
        }
        // Default values and type annotations are not parameter names.
        if matches!(current.kind(), "default_parameter" | "typed_default_parameter") {
            if let Some(name) = current.child_by_field_name("name") {
                stack.push(name);
            }
            continue;
        }
        if current.kind() == "typed_parameter" {
            if let Some(first) = current.named_child(0) {
                stack.push(first);
            }
            continue;
        }
        if current.kind() == "assignment_pattern" {
            if let Some(left) = current.child_by_field_name("left") {
                stack.push(left);
            }
            continue;
        }
        for i in (0..current.named_child_count()).rev() {
            if let Some(child) = current.named_child(i) {
                stack.push(child);
            }
        }
    }
    out.reverse();
    out
}

struct RawClass {
    def_range: Range<usize>,
    class: ExtractedClass,
    index: usize,
}

struct RawFunction {
    def_range: Range<usize>,
    body_range: Option<Range<usize>>,
    function: ExtractedFunction,
    index: usize,
}

/// One extraction pass over a parsed tree.
struct Extraction<'a> {
    queries: &'a QuerySet,
    source: &'a str,
    tree: &'a Tree,
    classes: Vec<RawClass>,
    functions: Vec<RawFunction>,
}

impl<'a> Extraction<'a> {
    fn new(queries: &'a QuerySet, source: &'a str, tree: &'a Tree) -> Self {
        Self {
            queries,
            source,
            tree,
            classes: Vec::new(),
            functions: Vec::new(),
        }
    }

    fn run(mut self, parsed: &mut ParsedFile) {
        self.collect_classes();
        self.collect_functions();
        self.assign_methods_to_classes();
        self.collect_decorators();
        self.collect_calls();
        self.collect_creations();
        self.collect_exceptions();
        self.collect_assignments(parsed);
        self.collect_usages(parsed);
        self.collect_imports(parsed);

        self.functions.sort_by_key(|f| f.function.start_line);
        self.classes.sort_by_key(|c| c.class.start_line);
        parsed.functions = self.functions.into_iter().map(|f| f.function).collect();
        parsed.classes = self.classes.into_iter().map(|c| c.class).collect();
    }

    fn capture_index(query: &Query, name: &str) -> Option<u32> {
        query.capture_index_for_name(name)
    }

    /// Run `query` over the whole tree, handing each match's captures to
    /// `handle` as `(capture_name_index, node)` pairs.
    fn for_each_match<F>(&self, query: &Query, mut handle: F)
    where
        F: FnMut(&[(u32, Node<'a>)]),
    {
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(query, self.tree.root_node(), self.source.as_bytes());
        let mut scratch: Vec<(u32, Node<'a>)> = Vec::new();
        while let Some(m) = matches.next() {
            scratch.clear();
            for capture in m.captures {
                scratch.push((capture.index, capture.node));
            }
            handle(&scratch);
        }
    }

    fn collect_classes(&mut self) {
        let query = &self.queries.classes;
        let idx_def = Self::capture_index(query, "class.def");
        let idx_name = Self::capture_index(query, "class.name");
        let idx_super = Self::capture_index(query, "class.superclass");

        // A class with several superclasses produces one match per
        // superclass; entries are merged by definition node range.
        let mut by_range: HashMap<Range<usize>, (ExtractedClass, Range<usize>)> = HashMap::new();
        let mut order: Vec<Range<usize>> = Vec::new();
        self.for_each_match(query, |captures| {
            let def = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_def)
                .map(|(_, n)| *n);
            let name = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_name)
                .map(|(_, n)| text_of(n, self.source));
            let (Some(def), Some(name)) = (def, name) else {
                return;
            };
            let range = def.byte_range();
            let entry = by_range.entry(range.clone()).or_insert_with(|| {
                order.push(range.clone());
                (
                    ExtractedClass {
                        name,
                        start_line: line_of(&def),
                        end_line: end_line_of(&def),
                        ..ExtractedClass::default()
                    },
                    range.clone(),
                )
            });
            for (i, node) in captures {
                if Some(*i) == idx_super {
                    let superclass = text_of(node, self.source);
                    if !entry.0.superclasses.contains(&superclass) {
                        entry.0.superclasses.push(superclass);
                    }
                }
            }
        });

        for (index, range) in order.into_iter().enumerate() {
            if let Some((class, def_range)) = by_range.remove(&range) {
                self.classes.push(RawClass {
                    def_range,
                    class,
                    index,
                });
            }
        }
    }

    fn collect_functions(&mut self) {
        let query = &self.queries.functions;
        let idx_def = Self::capture_index(query, "function.def");
        let idx_name = Self::capture_index(query, "function.name");
        let idx_params = Self::capture_index(query, "function.params");
        let idx_ret = Self::capture_index(query, "function.return_type");
        let idx_body = Self::capture_index(query, "function.body");

        let mut seen: HashMap<Range<usize>, usize> = HashMap::new();
        let mut collected: Vec<RawFunction> = Vec::new();
        self.for_each_match(query, |captures| {
            let def = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_def)
                .map(|(_, n)| *n);
            let name = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_name)
                .map(|(_, n)| text_of(n, self.source));
            let (Some(def), Some(name)) = (def, name) else {
                return;
            };
            if seen.contains_key(&def.byte_range()) {
                return;
            }
            seen.insert(def.byte_range(), collected.len());

            let params_node = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_params)
                .map(|(_, n)| *n);
            let params_str = params_node
                .map(|n| text_of(&n, self.source))
                .unwrap_or_default();
            let return_type = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_ret)
                .map(|(_, n)| text_of(n, self.source));
            let body_range = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_body)
                .map(|(_, n)| n.byte_range());

            let signature = match &return_type {
                Some(ret) => format!("{params_str} -> {ret}"),
                None => params_str.clone(),
            };
            let parameters = params_node
                .map(|n| {
                    identifier_leaves(&n, self.source)
                        .into_iter()
                        .map(|(name, line)| ExtractedVariable {
                            name,
                            line,
                            scope: ScopeType::Parameter,
                        })
                        .collect()
                })
                .unwrap_or_default();

            collected.push(RawFunction {
                def_range: def.byte_range(),
                body_range,
                index: 0,
                function: ExtractedFunction {
                    name,
                    start_line: line_of(&def),
                    end_line: end_line_of(&def),
                    signature: signature.trim().to_string(),
                    parameters_str: params_str.trim().to_string(),
                    parameters,
                    ..ExtractedFunction::default()
                },
            });
        });
        for (i, mut raw) in collected.into_iter().enumerate() {
            raw.index = i;
            self.functions.push(raw);
        }
    }

    fn assign_methods_to_classes(&mut self) {
        let class_ranges: Vec<(Range<usize>, String)> = self
            .classes
            .iter()
            .map(|c| (c.def_range.clone(), c.class.name.clone()))
            .collect();
        for raw in &mut self.functions {
            if let Some(owner) = innermost_containing(&class_ranges, &raw.def_range) {
                raw.function.class_name = Some(owner.clone());
            }
        }
    }

    fn collect_decorators(&mut self) {
        let Some(query) = &self.queries.decorators else {
            return;
        };
        let idx_name = Self::capture_index(query, "decorator.name");
        let idx_target = Self::capture_index(query, "decorator.target");

        let mut targets: Vec<(Range<usize>, String)> = Vec::new();
        self.for_each_match(query, |captures| {
            let name = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_name)
                .map(|(_, n)| text_of(n, self.source));
            let target = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_target)
                .map(|(_, n)| n.byte_range());
            if let (Some(name), Some(target)) = (name, target) {
                targets.push((target, name));
            }
        });

        for (target_range, name) in targets {
            if let Some(raw) = self
                .functions
                .iter_mut()
                .find(|f| f.def_range == target_range)
            {
                if !raw.function.decorators.contains(&name) {
                    raw.function.decorators.push(name);
                }
                continue;
            }
            if let Some(raw) = self
                .classes
                .iter_mut()
                .find(|c| c.def_range == target_range)
            {
                if !raw.class.decorators.contains(&name) {
                    raw.class.decorators.push(name);
                }
            }
        }
    }

    /// Index of the innermost function whose definition contains `range`.
    fn owning_function(&self, range: &Range<usize>) -> Option<usize> {
        let ranges: Vec<(Range<usize>, usize)> = self
            .functions
            .iter()
            .map(|f| (f.def_range.clone(), f.index))
            .collect();
        innermost_containing(&ranges, range).copied()
    }

    fn collect_calls(&mut self) {
        let query = &self.queries.calls;
        let idx_expr = Self::capture_index(query, "call.expr");
        let idx_name = Self::capture_index(query, "call.name");
        let idx_object = Self::capture_index(query, "call.object");
        let idx_method = Self::capture_index(query, "call.method");

        // Alternations can match one call expression twice; keep the richer
        // capture (the one that bound a base object).
        let mut by_expr: HashMap<Range<usize>, CallRef> = HashMap::new();
        self.for_each_match(query, |captures| {
            let expr = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_expr)
                .map(|(_, n)| *n);
            let Some(expr) = expr else { return };
            let direct = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_name)
                .map(|(_, n)| text_of(n, self.source));
            let method = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_method)
                .map(|(_, n)| text_of(n, self.source));
            let object = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_object)
                .map(|(_, n)| text_of(n, self.source));

            let call = if let Some(method) = method {
                CallRef {
                    callee: method,
                    base_object: object,
                    call_type: "method".to_string(),
                    line: line_of(&expr),
                }
            } else if let Some(direct) = direct {
                CallRef {
                    callee: direct,
                    base_object: None,
                    call_type: "direct".to_string(),
                    line: line_of(&expr),
                }
            } else {
                return;
            };

            let slot = by_expr.entry(expr.byte_range()).or_insert_with(|| call.clone());
            if slot.base_object.is_none() && call.base_object.is_some() {
                *slot = call;
            }
        });

        for (range, call) in by_expr {
            if let Some(owner) = self.owning_function(&range) {
                self.functions[owner].function.calls.push(call);
            }
        }
        for raw in &mut self.functions {
            raw.function.calls.sort_by_key(|c| c.line);
        }
    }

    fn collect_creations(&mut self) {
        let Some(query) = &self.queries.creations else {
            return;
        };
        let idx_expr = Self::capture_index(query, "new.expr");
        let idx_class = Self::capture_index(query, "new.class");
        let mut found: Vec<(Range<usize>, CreationRef)> = Vec::new();
        self.for_each_match(query, |captures| {
            let expr = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_expr)
                .map(|(_, n)| *n);
            let class = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_class)
                .map(|(_, n)| text_of(n, self.source));
            if let (Some(expr), Some(class_name)) = (expr, class) {
                found.push((
                    expr.byte_range(),
                    CreationRef {
                        class_name,
                        line: line_of(&expr),
                    },
                ));
            }
        });
        for (range, creation) in found {
            if let Some(owner) = self.owning_function(&range) {
                self.functions[owner].function.creations.push(creation);
            }
        }
    }

    fn collect_exceptions(&mut self) {
        let mut raised: Vec<(Range<usize>, String)> = Vec::new();
        if let Some(query) = &self.queries.raises {
            let idx = Self::capture_index(query, "raise.type");
            self.for_each_match(query, |captures| {
                for (i, node) in captures {
                    if Some(*i) == idx {
                        raised.push((node.byte_range(), text_of(node, self.source)));
                    }
                }
            });
        }
        let mut handled: Vec<(Range<usize>, String)> = Vec::new();
        if let Some(query) = &self.queries.handles {
            let idx = Self::capture_index(query, "handle.type");
            self.for_each_match(query, |captures| {
                for (i, node) in captures {
                    if Some(*i) == idx {
                        handled.push((node.byte_range(), text_of(node, self.source)));
                    }
                }
            });
        }
        for (range, name) in raised {
            if let Some(owner) = self.owning_function(&range) {
                let raises = &mut self.functions[owner].function.raises;
                if !raises.contains(&name) {
                    raises.push(name);
                }
            }
        }
        for (range, name) in handled {
            if let Some(owner) = self.owning_function(&range) {
                let handles = &mut self.functions[owner].function.handles;
                if !handles.contains(&name) {
                    handles.push(name);
                }
            }
        }
    }

    fn collect_assignments(&mut self, parsed: &mut ParsedFile) {
        let query = &self.queries.assignments;
        let idx_target = Self::capture_index(query, "assign.target");
        let idx_aug = Self::capture_index(query, "assign.aug");
        let idx_self_obj = Self::capture_index(query, "assign.self_object");
        let idx_attr = Self::capture_index(query, "assign.attr_target");

        struct Assign {
            range: Range<usize>,
            name: String,
            line: u32,
            augmented: bool,
            self_attribute: bool,
        }
        let mut assigns: Vec<Assign> = Vec::new();
        self.for_each_match(query, |captures| {
            let augmented = captures.iter().any(|(i, _)| Some(*i) == idx_aug);
            // `self.x = ...` declares a class attribute when the receiver is
            // the instance binding.
            let self_obj = captures
                .iter()
                .find(|(i, _)| Some(*i) == idx_self_obj)
                .map(|(_, n)| text_of(n, self.source));
            if let Some(attr) = captures.iter().find(|(i, _)| Some(*i) == idx_attr) {
                if matches!(self_obj.as_deref(), Some("self") | Some("this")) {
                    assigns.push(Assign {
                        range: attr.1.byte_range(),
                        name: text_of(&attr.1, self.source),
                        line: line_of(&attr.1),
                        augmented,
                        self_attribute: true,
                    });
                }
                return;
            }
            let target = captures.iter().find(|(i, _)| Some(*i) == idx_target);
            if let Some((_, node)) = target {
                assigns.push(Assign {
                    range: node.byte_range(),
                    name: text_of(node, self.source),
                    line: line_of(node),
                    augmented,
                    self_attribute: false,
                });
            }
        });

        let class_ranges: Vec<(Range<usize>, usize)> = self
            .classes
            .iter()
            .map(|c| (c.def_range.clone(), c.index))
            .collect();
        let function_names: Vec<(String, u32)> = self
            .functions
            .iter()
            .map(|f| (f.function.name.clone(), f.function.start_line))
            .collect();

        for assign in assigns {
            // Arrow-function declarators are already function entities.
            if function_names
                .iter()
                .any(|(name, line)| *name == assign.name && *line == assign.line)
            {
                continue;
            }
            if assign.self_attribute {
                if let Some(owner) = self.owning_function(&assign.range) {
                    let class_name = self.functions[owner].function.class_name.clone();
                    if let Some(class_name) = class_name {
                        if let Some(class) = self
                            .classes
                            .iter_mut()
                            .find(|c| c.class.name == class_name)
                        {
                            push_variable(
                                &mut class.class.attributes,
                                assign.name,
                                assign.line,
                                ScopeType::ClassAttribute,
                            );
                        }
                    }
                }
                continue;
            }
            match self.owning_function(&assign.range) {
                Some(owner) => {
                    let function = &mut self.functions[owner].function;
                    let already_param =
                        function.parameters.iter().any(|p| p.name == assign.name);
                    let already_local = function.locals.iter().any(|v| v.name == assign.name);
                    if already_param || already_local {
                        function.writes.push(VarWrite {
                            name: assign.name,
                            line: assign.line,
                            modification_type: if assign.augmented {
                                "augmented".to_string()
                            } else {
                                "assignment".to_string()
                            },
                        });
                    } else {
                        function.locals.push(ExtractedVariable {
                            name: assign.name,
                            line: assign.line,
                            scope: ScopeType::LocalVariable,
                        });
                    }
                }
                None => {
                    if let Some(class_idx) = innermost_containing(&class_ranges, &assign.range) {
                        let class = &mut self.classes[*class_idx];
                        push_variable(
                            &mut class.class.attributes,
                            assign.name,
                            assign.line,
                            ScopeType::ClassAttribute,
                        );
                    } else {
                        push_variable(
                            &mut parsed.globals,
                            assign.name,
                            assign.line,
                            ScopeType::GlobalVariable,
                        );
                    }
                }
            }
        }
    }

    fn collect_usages(&mut self, parsed: &ParsedFile) {
        let query = &self.queries.identifiers;
        let idx = Self::capture_index(query, "ident");
        let global_names: Vec<&str> = parsed.globals.iter().map(|g| g.name.as_str()).collect();

        let mut idents: Vec<(Range<usize>, String, u32)> = Vec::new();
        self.for_each_match(query, |captures| {
            for (i, node) in captures {
                if Some(*i) == idx {
                    idents.push((
                        node.byte_range(),
                        text_of(node, self.source),
                        line_of(node),
                    ));
                }
            }
        });

        for (range, name, line) in idents {
            let Some(owner) = self.owning_function(&range) else {
                continue;
            };
            let function = &mut self.functions[owner].function;
            let declared = function.parameters.iter().any(|p| p.name == name)
                || function.locals.iter().any(|v| v.name == name)
                || global_names.contains(&name.as_str());
            if !declared {
                continue;
            }
            // Declaration and write sites are already recorded.
            let is_decl = function
                .locals
                .iter()
                .chain(function.parameters.iter())
                .any(|v| v.name == name && v.line == line);
            let is_write = function
                .writes
                .iter()
                .any(|w| w.name == name && w.line == line);
            if is_decl || is_write {
                continue;
            }
            if !function.uses.iter().any(|u| u.name == name && u.line == line) {
                function.uses.push(VarUse { name, line });
            }
        }
    }

    fn collect_imports(&mut self, parsed: &mut ParsedFile) {
        let query = &self.queries.imports;
        let idx = Self::capture_index(query, "import.module");
        let mut imports: Vec<ExtractedImport> = Vec::new();
        self.for_each_match(query, |captures| {
            for (i, node) in captures {
                if Some(*i) == idx {
                    let module_path = text_of(node, self.source);
                    if module_path.is_empty() {
                        continue;
                    }
                    let record = ExtractedImport {
                        module_path,
                        line: line_of(node),
                    };
                    if !imports.iter().any(|im| im.module_path == record.module_path) {
                        imports.push(record);
                    }
                }
            }
        });
        parsed.imports = imports;
    }
}

fn push_variable(
    into: &mut Vec<ExtractedVariable>,
    name: String,
    line: u32,
    scope: ScopeType,
) {
    if !into.iter().any(|v| v.name == name) {
        into.push(ExtractedVariable { name, line, scope });
    }
}

/// The innermost range in `ranges` that properly contains `target`, if any.
fn innermost_containing<'a, T>(
    ranges: &'a [(Range<usize>, T)],
    target: &Range<usize>,
) -> Option<&'a T> {
    ranges
        .iter()
        .filter(|(r, _)| r.start <= target.start && target.end <= r.end && *r != *target)
        .min_by_key(|(r, _)| r.end - r.start)
        .map(|(_, v)| v)
}
