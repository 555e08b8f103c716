//! Foreign-Binding Analyzer
//!
//! Computes the variables a function literal reads from enclosing,
//! non-top-level scopes. Those are the values the client has to capture and
//! the relocated server handler has to restore.

use oxc_ast::ast::{
    ArrowFunctionExpression, BindingIdentifier, Function, FunctionBody, IdentifierReference,
    Statement, TSInterfaceDeclaration, TSType, TSTypeAliasDeclaration,
};
use oxc_ast_visit::{walk, Visit};
use oxc_semantic::Scoping;
use oxc_span::{GetSpan, Span};
use oxc_syntax::scope::{ScopeFlags, ScopeId};
use oxc_syntax::symbol::SymbolId;
use std::collections::HashSet;

// ═══════════════════════════════════════════════════════════════════════════════
// FUNCTION LITERALS
// ═══════════════════════════════════════════════════════════════════════════════

/// The two literal shapes a tracked call accepts.
#[derive(Debug, Clone, Copy)]
pub enum FunctionLiteral<'b, 'a> {
    Arrow(&'b ArrowFunctionExpression<'a>),
    Function(&'b Function<'a>),
}

impl<'b, 'a> FunctionLiteral<'b, 'a> {
    pub fn span(&self) -> Span {
        match self {
            FunctionLiteral::Arrow(arrow) => arrow.span,
            FunctionLiteral::Function(func) => func.span,
        }
    }

    pub fn scope_id(&self) -> ScopeId {
        match self {
            FunctionLiteral::Arrow(arrow) => arrow.scope_id(),
            FunctionLiteral::Function(func) => func.scope_id(),
        }
    }

    pub fn body(&self) -> Option<&'b FunctionBody<'a>> {
        match self {
            FunctionLiteral::Arrow(arrow) => Some(&arrow.body),
            FunctionLiteral::Function(func) => func.body.as_deref(),
        }
    }

    /// Span of the expression of a concise arrow body (`x => x + 1`).
    pub fn concise_body(&self) -> Option<Span> {
        match self {
            FunctionLiteral::Arrow(arrow) if arrow.expression => {
                match arrow.body.statements.first() {
                    Some(Statement::ExpressionStatement(stmt)) => Some(stmt.expression.span()),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Symbol of a named function expression's own name.
    fn own_symbol(&self) -> Option<SymbolId> {
        match self {
            FunctionLiteral::Function(func) => func.id.as_ref().map(|id| id.symbol_id()),
            FunctionLiteral::Arrow(_) => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FOREIGN BINDINGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Names referenced inside `literal` whose declarations live outside it but
/// below the program root, in order of first occurrence.
pub fn foreign_bindings(scoping: &Scoping, literal: FunctionLiteral<'_, '_>) -> Vec<String> {
    let mut collector = ForeignBindingCollector {
        scoping,
        literal_scope: literal.scope_id(),
        own_symbol: literal.own_symbol(),
        type_depth: 0,
        seen: HashSet::new(),
        names: Vec::new(),
    };
    match literal {
        FunctionLiteral::Arrow(arrow) => collector.visit_arrow_function_expression(arrow),
        FunctionLiteral::Function(func) => collector.visit_function(func, ScopeFlags::Function),
    }
    collector.names
}

struct ForeignBindingCollector<'s> {
    scoping: &'s Scoping,
    literal_scope: ScopeId,
    own_symbol: Option<SymbolId>,
    /// Depth inside type-only subtrees; references there need no runtime value.
    type_depth: u32,
    seen: HashSet<String>,
    names: Vec<String>,
}

impl<'s> ForeignBindingCollector<'s> {
    fn is_foreign(&self, symbol: SymbolId) -> bool {
        if Some(symbol) == self.own_symbol {
            return false;
        }
        let declared_in = self.scoping.symbol_scope_id(symbol);
        if declared_in == self.scoping.root_scope_id() {
            // Top-level declarations are re-evaluated by the server module.
            return false;
        }
        !self
            .scoping
            .scope_ancestors(declared_in)
            .any(|scope| scope == self.literal_scope)
    }
}

impl<'a, 's> Visit<'a> for ForeignBindingCollector<'s> {
    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        if self.type_depth > 0 {
            return;
        }
        let Some(reference_id) = ident.reference_id.get() else {
            return;
        };
        // Unresolved references are globals.
        let Some(symbol) = self.scoping.get_reference(reference_id).symbol_id() else {
            return;
        };
        if self.is_foreign(symbol) {
            let name = ident.name.to_string();
            if self.seen.insert(name.clone()) {
                self.names.push(name);
            }
        }
    }

    fn visit_ts_type(&mut self, it: &TSType<'a>) {
        self.type_depth += 1;
        walk::walk_ts_type(self, it);
        self.type_depth -= 1;
    }

    fn visit_ts_interface_declaration(&mut self, decl: &TSInterfaceDeclaration<'a>) {
        self.type_depth += 1;
        walk::walk_ts_interface_declaration(self, decl);
        self.type_depth -= 1;
    }

    fn visit_ts_type_alias_declaration(&mut self, decl: &TSTypeAliasDeclaration<'a>) {
        self.type_depth += 1;
        walk::walk_ts_type_alias_declaration(self, decl);
        self.type_depth -= 1;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAME INVENTORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Every identifier name bound or referenced in a module. Generated locals
/// must avoid all of them.
#[derive(Default)]
pub struct NameCollector {
    pub names: HashSet<String>,
}

impl<'a> Visit<'a> for NameCollector {
    fn visit_binding_identifier(&mut self, ident: &BindingIdentifier<'a>) {
        self.names.insert(ident.name.to_string());
    }

    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        self.names.insert(ident.name.to_string());
    }
}

/// Hands out identifiers that collide with nothing in the module nor with
/// each other: `_fn`, `_fn2`, `_fn3`, ...
pub struct UidGenerator {
    taken: HashSet<String>,
}

impl UidGenerator {
    pub fn new(taken: HashSet<String>) -> Self {
        Self { taken }
    }

    /// `base` itself when free, otherwise `base2`, `base3`, ...
    pub fn reserve(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 2;
        while self.taken.contains(&candidate) {
            candidate = format!("{}{}", base, n);
            n += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }

    pub fn generate(&mut self, hint: &str) -> String {
        let cleaned: String = hint
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
            .collect();
        self.reserve(&format!("_{}", cleaned))
    }
}
