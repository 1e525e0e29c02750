use std::collections::HashMap;

use crate::compiler::CompileError;
use crate::heap::{BumpHeap, HeapOffset, PREFIX_TAG_BYTES};
use crate::structs::{SCALAR_BYTES, StructId, StructTable};
use crate::vm::ValueType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NamespaceId(pub usize);

#[derive(Clone, Debug, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub ty: ValueType,
    pub storage: HeapOffset,
}

/// One lexical scope. Symbols keep their declaration order.
#[derive(Debug, Default)]
pub struct Namespace {
    symbols: Vec<Symbol>,
    index: HashMap<String, usize>,
}

impl Namespace {
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.index.get(name).map(|&slot| &self.symbols[slot])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn insert(&mut self, symbol: Symbol) -> Result<(), CompileError> {
        if self.index.contains_key(&symbol.name) {
            return Err(CompileError::DuplicateSymbol {
                name: symbol.name,
                line: 0,
            });
        }
        self.index.insert(symbol.name.clone(), self.symbols.len());
        self.symbols.push(symbol);
        Ok(())
    }
}

/// All namespaces of one program plus the stack of currently open ones.
/// The global namespace sits at the bottom and is never popped.
#[derive(Debug)]
pub struct SymbolTable {
    namespaces: Vec<Namespace>,
    scope: Vec<NamespaceId>,
    functions: HashMap<String, NamespaceId>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub const GLOBAL: NamespaceId = NamespaceId(0);

    pub fn new() -> Self {
        Self {
            namespaces: vec![Namespace::default()],
            scope: vec![Self::GLOBAL],
            functions: HashMap::new(),
        }
    }

    pub fn namespace(&self, id: NamespaceId) -> Option<&Namespace> {
        self.namespaces.get(id.0)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.iter()
    }

    pub fn globals(&self) -> &Namespace {
        &self.namespaces[Self::GLOBAL.0]
    }

    pub fn create_namespace(&mut self) -> NamespaceId {
        self.namespaces.push(Namespace::default());
        NamespaceId(self.namespaces.len() - 1)
    }

    /// Namespace owned by a function, created on first request.
    pub fn function_namespace(&mut self, function: &str) -> NamespaceId {
        if let Some(id) = self.functions.get(function) {
            return *id;
        }
        let id = self.create_namespace();
        self.functions.insert(function.to_string(), id);
        id
    }

    pub fn enter_namespace(&mut self, id: NamespaceId) {
        self.scope.push(id);
    }

    pub fn leave_namespace(&mut self) -> Option<NamespaceId> {
        if self.scope.len() > 1 {
            self.scope.pop()
        } else {
            None
        }
    }

    pub fn current(&self) -> NamespaceId {
        self.scope.last().copied().unwrap_or(Self::GLOBAL)
    }

    /// Declares `name` in `ns`, allocating its storage. Struct-typed symbols
    /// also declare one `parent.field` symbol per field, recursively.
    pub fn declare(
        &mut self,
        ns: NamespaceId,
        name: &str,
        ty: ValueType,
        heap: &mut BumpHeap,
        structs: &StructTable,
    ) -> Result<Symbol, CompileError> {
        let namespace = self
            .namespaces
            .get_mut(ns.0)
            .ok_or_else(|| CompileError::UnknownSymbol {
                name: format!("namespace #{}", ns.0),
                line: 0,
            })?;
        if namespace.contains(name) {
            return Err(CompileError::DuplicateSymbol {
                name: name.to_string(),
                line: 0,
            });
        }

        let storage = match ty {
            ValueType::Struct(id) => {
                let layout = structs.get(id).ok_or_else(|| unknown_struct(id))?;
                let storage = heap.allocate(
                    layout.size_bytes,
                    structs.alignment().structs,
                    PREFIX_TAG_BYTES,
                );
                stamp_tag(heap, storage, id);
                storage
            }
            _ => heap.allocate(SCALAR_BYTES, SCALAR_BYTES, 0),
        };
        let symbol = Symbol {
            name: name.to_string(),
            ty,
            storage,
        };
        namespace.insert(symbol.clone())?;
        if let ValueType::Struct(id) = ty {
            unfold_fields(namespace, name, storage, id, heap, structs)?;
        }
        Ok(symbol)
    }

    /// Looks `name` up from the innermost open namespace outwards.
    pub fn resolve(&self, name: &str) -> Result<&Symbol, CompileError> {
        self.scope
            .iter()
            .rev()
            .find_map(|id| self.namespaces[id.0].get(name))
            .ok_or_else(|| CompileError::UnknownSymbol {
                name: name.to_string(),
                line: 0,
            })
    }

    pub fn lookup_in(&self, ns: NamespaceId, name: &str) -> Option<&Symbol> {
        self.namespaces.get(ns.0)?.get(name)
    }
}

fn unfold_fields(
    namespace: &mut Namespace,
    parent: &str,
    base: HeapOffset,
    id: StructId,
    heap: &mut BumpHeap,
    structs: &StructTable,
) -> Result<(), CompileError> {
    let layout = structs.get(id).ok_or_else(|| unknown_struct(id))?;
    for field in &layout.fields {
        let name = format!("{parent}.{}", field.name);
        let storage = base.add(field.offset);
        namespace.insert(Symbol {
            name: name.clone(),
            ty: field.ty,
            storage,
        })?;
        if let ValueType::Struct(sub) = field.ty {
            stamp_tag(heap, storage, sub);
            unfold_fields(namespace, &name, storage, sub, heap, structs)?;
        }
    }
    Ok(())
}

fn stamp_tag(heap: &mut BumpHeap, storage: HeapOffset, id: StructId) {
    let stamped = storage
        .prefix()
        .and_then(|prefix| heap.write_i32(prefix, id.tag()));
    debug_assert!(stamped.is_some(), "struct storage must carry a tag prefix");
}

fn unknown_struct(id: StructId) -> CompileError {
    CompileError::UnknownSymbol {
        name: format!("struct #{}", id.0),
        line: 0,
    }
}
