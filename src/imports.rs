//! Binding Classifier
//!
//! Maps the local bindings introduced by imports of tracked modules to their
//! API entries. Lookups go through symbol ids, so a local re-declaration that
//! shadows an imported name is never mistaken for the tracked function.

use oxc_ast::ast::{ImportDeclaration, ImportDeclarationSpecifier, ModuleExportName, Program, Statement};
use oxc_syntax::symbol::SymbolId;
use std::collections::HashMap;

use crate::api::{ApiEntry, ImportDefinition};

#[derive(Debug, Default)]
pub struct BindingRegistration {
    bindings: HashMap<SymbolId, ApiEntry>,
    namespaces: HashMap<SymbolId, Vec<ApiEntry>>,
}

impl BindingRegistration {
    /// Scans the import declarations of `program` against `table`.
    pub fn collect(program: &Program<'_>, table: &[ApiEntry]) -> Self {
        let mut registration = BindingRegistration::default();
        for stmt in &program.body {
            if let Statement::ImportDeclaration(decl) = stmt {
                registration.add_declaration(decl, table);
            }
        }
        registration
    }

    fn add_declaration(&mut self, decl: &ImportDeclaration<'_>, table: &[ApiEntry]) {
        if decl.import_kind.is_type() {
            return;
        }
        let module = decl.source.value.as_str();
        let Some(specifiers) = &decl.specifiers else {
            return;
        };
        for specifier in specifiers {
            match specifier {
                ImportDeclarationSpecifier::ImportSpecifier(spec) => {
                    if spec.import_kind.is_type() {
                        continue;
                    }
                    let imported = match &spec.imported {
                        ModuleExportName::IdentifierName(id) => id.name.to_string(),
                        ModuleExportName::StringLiteral(s) => s.value.to_string(),
                        _ => continue,
                    };
                    if let Some(entry) = table.iter().find(|entry| {
                        matches!(&entry.target, ImportDefinition::Named { name, source }
                            if name == &imported && source == module)
                    }) {
                        self.bindings.insert(spec.local.symbol_id(), entry.clone());
                    }
                }
                ImportDeclarationSpecifier::ImportDefaultSpecifier(spec) => {
                    if let Some(entry) = table.iter().find(|entry| {
                        matches!(&entry.target, ImportDefinition::Default { source } if source == module)
                    }) {
                        self.bindings.insert(spec.local.symbol_id(), entry.clone());
                    }
                }
                ImportDeclarationSpecifier::ImportNamespaceSpecifier(spec) => {
                    let exposed: Vec<ApiEntry> = table
                        .iter()
                        .filter(|entry| {
                            matches!(&entry.target, ImportDefinition::Named { source, .. } if source == module)
                        })
                        .cloned()
                        .collect();
                    if !exposed.is_empty() {
                        self.namespaces.insert(spec.local.symbol_id(), exposed);
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.namespaces.is_empty()
    }

    pub fn get(&self, symbol: SymbolId) -> Option<&ApiEntry> {
        self.bindings.get(&symbol)
    }

    /// Entry reached through `namespace.property`.
    pub fn get_member(&self, namespace: SymbolId, property: &str) -> Option<&ApiEntry> {
        self.namespaces.get(&namespace)?.iter().find(|entry| {
            matches!(&entry.target, ImportDefinition::Named { name, .. } if name == property)
        })
    }
}
