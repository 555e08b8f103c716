//! Call Rewriter
//!
//! Walks one module, finds calls to tracked factories and turns each of them
//! into a hoisted registration plus a `$$clone` invocation. The server build
//! keeps the literal inside the registration; the client build keeps only the
//! id. Both builds mint ids in the same pre-order so a call site gets the same
//! id in either variant.

use oxc_ast::ast::{
    Argument, BindingPattern, CallExpression, Expression, Function, Program, VariableDeclarator,
};
use oxc_ast_visit::{walk, Visit};
use oxc_semantic::Scoping;
use oxc_span::{GetSpan, Span};
use oxc_syntax::scope::ScopeFlags;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::api::{ApiEntry, ImportDefinition, CLIENT_MODULE, SERVER_MODULE};
use crate::compile::{FunctionArtifact, Mode};
use crate::edits::{EditBuffer, LineIndex, Pieces};
use crate::error::{CompilerError, ERR_ROOT, ERR_SHAPE};
use crate::imports::BindingRegistration;
use crate::minter::IdMinter;
use crate::scope::{foreign_bindings, FunctionLiteral, UidGenerator};

// ═══════════════════════════════════════════════════════════════════════════════
// IMPORT INJECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Runtime helpers the rewritten module needs, grouped per source module in
/// order of first use.
#[derive(Default)]
struct ImportInjector {
    locals: HashMap<ImportDefinition, String>,
    order: Vec<ImportDefinition>,
}

impl ImportInjector {
    fn local_for(&mut self, definition: &ImportDefinition, uids: &mut UidGenerator) -> String {
        if let Some(local) = self.locals.get(definition) {
            return local.clone();
        }
        let local = uids.reserve(&definition.preferred_local());
        self.locals.insert(definition.clone(), local.clone());
        self.order.push(definition.clone());
        local
    }

    fn declarations(&self) -> Vec<String> {
        let mut modules: Vec<&str> = Vec::new();
        for definition in &self.order {
            if !modules.contains(&definition.source()) {
                modules.push(definition.source());
            }
        }

        modules
            .into_iter()
            .map(|module| {
                let mut default_local = None;
                let mut named = Vec::new();
                for definition in self.order.iter().filter(|d| d.source() == module) {
                    let local = &self.locals[definition];
                    match definition {
                        ImportDefinition::Default { .. } => default_local = Some(local.clone()),
                        ImportDefinition::Named { name, .. } if name == local => named.push(name.clone()),
                        ImportDefinition::Named { name, .. } => {
                            named.push(format!("{} as {}", name, local))
                        }
                    }
                }
                let mut clause = Vec::new();
                if let Some(local) = default_local {
                    clause.push(local);
                }
                if !named.is_empty() {
                    clause.push(format!("{{ {} }}", named.join(", ")));
                }
                format!("import {} from {:?};", clause.join(", "), module)
            })
            .collect()
    }
}

fn helper(name: &str, mode: Mode) -> ImportDefinition {
    let module = match mode {
        Mode::Server => SERVER_MODULE,
        Mode::Client => CLIENT_MODULE,
    };
    ImportDefinition::named(name, module)
}

/// Strips parentheses and TypeScript-only wrappers around an expression.
fn unwrap_expression<'b, 'a>(mut expr: &'b Expression<'a>) -> &'b Expression<'a> {
    loop {
        expr = match expr {
            Expression::ParenthesizedExpression(e) => &e.expression,
            Expression::TSAsExpression(e) => &e.expression,
            Expression::TSSatisfiesExpression(e) => &e.expression,
            Expression::TSNonNullExpression(e) => &e.expression,
            Expression::TSTypeAssertion(e) => &e.expression,
            _ => return expr,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXTRACTOR
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Extractor<'s> {
    file: &'s str,
    mode: Mode,
    strict: bool,
    scoping: &'s Scoping,
    registration: &'s BindingRegistration,
    minter: IdMinter,
    uids: UidGenerator,
    imports: ImportInjector,
    lines: LineIndex<'s>,
    pub edits: EditBuffer<'s>,
    /// Top-level statement currently being walked.
    root: Option<Span>,
    /// Enclosing function and variable names, innermost last.
    names: Vec<String>,
    /// Non-zero while walking code the current build drops. Tracked calls
    /// there still consume ids but produce no edits.
    discard_depth: u32,
    pub functions: Vec<FunctionArtifact>,
    pub diagnostics: Vec<CompilerError>,
}

impl<'s> Extractor<'s> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file: &'s str,
        source: &'s str,
        mode: Mode,
        strict: bool,
        scoping: &'s Scoping,
        registration: &'s BindingRegistration,
        minter: IdMinter,
        uids: UidGenerator,
    ) -> Self {
        Extractor {
            file,
            mode,
            strict,
            scoping,
            registration,
            minter,
            uids,
            imports: ImportInjector::default(),
            lines: LineIndex::new(source),
            edits: EditBuffer::new(source),
            root: None,
            names: Vec::new(),
            discard_depth: 0,
            functions: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Rewrites every top-level statement, then injects the helper imports.
    pub fn run(&mut self, program: &Program<'_>) {
        for stmt in &program.body {
            self.root = Some(stmt.span());
            self.visit_statement(stmt);
        }
        self.root = None;

        let declarations = self.imports.declarations();
        if declarations.is_empty() {
            return;
        }
        let at = program
            .directives
            .last()
            .map(|d| d.span.end)
            .or_else(|| program.hashbang.as_ref().map(|h| h.span.end))
            .unwrap_or(0);
        let header = if at == 0 {
            declarations.iter().map(|d| format!("{}\n", d)).collect::<String>()
        } else {
            declarations.iter().map(|d| format!("\n{}", d)).collect::<String>()
        };
        self.edits.header(at, Pieces::text(header));
    }

    fn resolve_callee(&self, callee: &Expression<'_>) -> Option<ApiEntry> {
        match unwrap_expression(callee) {
            Expression::Identifier(ident) => {
                let symbol = self.scoping.get_reference(ident.reference_id.get()?).symbol_id()?;
                self.registration.get(symbol).cloned()
            }
            Expression::StaticMemberExpression(member) => {
                let Expression::Identifier(object) = unwrap_expression(&member.object) else {
                    return None;
                };
                let symbol = self.scoping.get_reference(object.reference_id.get()?).symbol_id()?;
                self.registration
                    .get_member(symbol, member.property.name.as_str())
                    .cloned()
            }
            _ => None,
        }
    }

    fn mint(&mut self, entry: &ApiEntry) -> String {
        let id = self.minter.mint(self.names.last().map(|s| s.as_str()));
        self.functions.push(FunctionArtifact {
            id: id.clone(),
            kind: entry.kind,
            scoping: entry.scoping,
        });
        id
    }

    fn report(&mut self, code: &str, message: String, span: Span, hint: Option<String>) {
        let (line, column) = self.lines.position(span.start as usize);
        self.diagnostics.push(CompilerError::with_details(
            code,
            &message,
            self.file,
            line + 1,
            column + 1,
            None,
            hint.into_iter().collect(),
        ));
    }

    /// A tracked call with the wrong argument shape. Strict builds fail,
    /// lenient builds leave the call alone.
    fn reject_shape(&mut self, call: &CallExpression<'_>, entry: &ApiEntry, expected: &str) {
        let message = format!("{} expects {}", entry.name, expected);
        if self.strict {
            self.report(
                ERR_SHAPE,
                message,
                call.span,
                Some(format!("Pass an inline {} directly to {}.", expected, entry.name)),
            );
        } else {
            warn!(file = self.file, call = entry.name.as_str(), "{}, leaving call untouched", message);
        }
    }

    fn discarding<F: FnOnce(&mut Self)>(&mut self, f: F) {
        self.discard_depth += 1;
        f(self);
        self.discard_depth -= 1;
    }

    fn walk_arguments(&mut self, arguments: &[Argument<'_>]) {
        for argument in arguments {
            self.visit_argument(argument);
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Function extraction
    // ───────────────────────────────────────────────────────────────────────

    fn extract_function(&mut self, call: &CallExpression<'_>, entry: &ApiEntry) {
        let literal = match call
            .arguments
            .first()
            .and_then(|arg| arg.as_expression())
            .map(unwrap_expression)
        {
            Some(Expression::ArrowFunctionExpression(arrow)) => FunctionLiteral::Arrow(arrow),
            Some(Expression::FunctionExpression(func)) => FunctionLiteral::Function(func),
            _ => {
                self.reject_shape(call, entry, "a function literal");
                walk::walk_call_expression(self, call);
                return;
            }
        };

        let id = self.mint(entry);

        if self.discard_depth > 0 {
            self.walk_arguments(&call.arguments);
            return;
        }

        let Some(root) = self.root else {
            self.report(
                ERR_ROOT,
                format!("{} call has no enclosing top-level statement", entry.name),
                call.span,
                None,
            );
            return;
        };

        match self.mode {
            Mode::Server => self.visit_argument(&call.arguments[0]),
            Mode::Client => self.discarding(|this| this.visit_argument(&call.arguments[0])),
        }
        self.discarding(|this| this.walk_arguments(&call.arguments[1..]));

        let captured = if entry.scoping {
            Some(foreign_bindings(self.scoping, literal))
        } else {
            None
        };

        let register_local = self.uids.generate(entry.kind.as_str());
        let register_helper = self.imports.local_for(entry.import_for(self.mode), &mut self.uids);
        let clone_helper = self.imports.local_for(&helper("$$clone", self.mode), &mut self.uids);

        let mut registration = Pieces::text(format!(
            "const {} = {}({:?}",
            register_local, register_helper, id
        ));
        if self.mode == Mode::Server {
            if let Some(names) = captured.as_ref().filter(|names| !names.is_empty()) {
                self.insert_scope_prelude(literal, names);
            }
            let span = literal.span();
            registration.push_str(", ");
            registration.append(self.edits.render(span.start, span.end));
        }
        registration.push_str(");\n");
        self.edits.hoist(root.start, registration);

        let replacement = match &captured {
            Some(names) => format!("{}({}, () => [{}])", clone_helper, register_local, names.join(", ")),
            None => format!("{}({})", clone_helper, register_local),
        };
        self.edits
            .overwrite(call.span.start, call.span.end, Pieces::text(replacement));

        debug!(
            file = self.file,
            id = id.as_str(),
            kind = entry.kind.as_str(),
            captured = captured.as_ref().map_or(0, |names| names.len()),
            "extracted function"
        );
    }

    /// Makes the relocated literal read its captured values back from the
    /// per-call scope before anything else runs.
    fn insert_scope_prelude(&mut self, literal: FunctionLiteral<'_, '_>, names: &[String]) {
        let scope_helper = self
            .imports
            .local_for(&helper("$$scope", Mode::Server), &mut self.uids);
        let prelude = format!("const [{}] = {}();", names.join(", "), scope_helper);

        if let Some(expr) = literal.concise_body() {
            let mut body = Pieces::text(format!("{{ {} return ", prelude));
            body.append(self.edits.render(expr.start, expr.end));
            body.push_str("; }");
            self.edits.overwrite(expr.start, expr.end, body);
            return;
        }

        let Some(body) = literal.body() else {
            return;
        };
        match body.directives.last() {
            Some(directive) => self
                .edits
                .insert(directive.span.end, Pieces::text(format!("\n{}", prelude))),
            None => self
                .edits
                .insert(body.span.start + 1, Pieces::text(format!(" {}", prelude))),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Stable references
    // ───────────────────────────────────────────────────────────────────────

    fn extract_reference(&mut self, call: &CallExpression<'_>, entry: &ApiEntry) {
        let Some(value) = call.arguments.first().and_then(|arg| arg.as_expression()) else {
            self.reject_shape(call, entry, "a value");
            walk::walk_call_expression(self, call);
            return;
        };

        let id = self.mint(entry);
        if self.discard_depth > 0 {
            self.walk_arguments(&call.arguments);
            return;
        }

        self.visit_expression(value);
        self.discarding(|this| this.walk_arguments(&call.arguments[1..]));

        let reference_helper = self.imports.local_for(entry.import_for(self.mode), &mut self.uids);
        let span = value.span();
        let mut replacement = Pieces::text(format!("{}({:?}, ", reference_helper, id));
        replacement.append(self.edits.render(span.start, span.end));
        replacement.push_str(")");
        self.edits.overwrite(call.span.start, call.span.end, replacement);

        debug!(file = self.file, id = id.as_str(), "created stable reference");
    }
}

impl<'a, 's> Visit<'a> for Extractor<'s> {
    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        match self.resolve_callee(&call.callee) {
            Some(entry) if !entry.kind.takes_function() => self.extract_reference(call, &entry),
            Some(entry) => self.extract_function(call, &entry),
            None => walk::walk_call_expression(self, call),
        }
    }

    fn visit_variable_declarator(&mut self, decl: &VariableDeclarator<'a>) {
        if let BindingPattern::BindingIdentifier(id) = &decl.id {
            self.names.push(id.name.to_string());
            walk::walk_variable_declarator(self, decl);
            self.names.pop();
        } else {
            walk::walk_variable_declarator(self, decl);
        }
    }

    fn visit_function(&mut self, func: &Function<'a>, flags: ScopeFlags) {
        if let Some(id) = &func.id {
            self.names.push(id.name.to_string());
            walk::walk_function(self, func, flags);
            self.names.pop();
        } else {
            walk::walk_function(self, func, flags);
        }
    }
}
