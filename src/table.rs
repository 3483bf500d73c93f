//! Tables of references and the element instances that initialize them.

use crate::sync::RwLock;
use wasmcore_environ::{RefType, TableType};

/// An engine-opaque reference stored in a table or global.
///
/// For `funcref` the value is whatever an engine uses to find a function;
/// for `externref` it is a handle chosen by the host.
pub type Reference = u64;

/// The null `funcref`.
pub const NULL_FUNCREF: Reference = u64::MAX;

/// The null `externref`.
pub const NULL_EXTERNREF: Reference = 0;

/// Returns the null reference for `ty`.
pub fn null_reference(ty: RefType) -> Reference {
    match ty {
        RefType::FuncRef => NULL_FUNCREF,
        RefType::ExternRef => NULL_EXTERNREF,
    }
}

/// A growable array of references of a single type.
#[derive(Debug)]
pub struct TableInstance {
    ty: TableType,
    elements: RwLock<Vec<Reference>>,
}

impl TableInstance {
    /// Creates a table of `ty.min` null references.
    pub fn new(ty: TableType) -> TableInstance {
        TableInstance {
            ty,
            elements: RwLock::new(vec![null_reference(ty.element); ty.min as usize]),
        }
    }

    pub fn element_type(&self) -> RefType {
        self.ty.element
    }

    /// The declared type, with the current size as the minimum.
    pub fn ty(&self) -> TableType {
        TableType::new(self.ty.element, self.size(), self.ty.max)
    }

    pub fn max(&self) -> Option<u32> {
        self.ty.max
    }

    pub fn size(&self) -> u32 {
        self.elements.read().len() as u32
    }

    pub fn get(&self, index: u32) -> Option<Reference> {
        self.elements.read().get(index as usize).copied()
    }

    pub fn set(&self, index: u32, value: Reference) -> bool {
        match self.elements.write().get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Grows the table by `delta` elements set to `init`, returning the
    /// previous size, or `None` past the maximum.
    pub fn grow(&self, delta: u32, init: Reference) -> Option<u32> {
        let mut elements = self.elements.write();
        let current = elements.len() as u32;
        let new_size = current.checked_add(delta)?;
        if new_size > self.ty.max.unwrap_or(u32::MAX) {
            return None;
        }
        elements.resize(new_size as usize, init);
        Some(current)
    }

    /// Sets `len` elements starting at `offset` to `value`.
    pub fn fill(&self, offset: u32, len: u32, value: Reference) -> bool {
        let mut elements = self.elements.write();
        let start = offset as usize;
        match start
            .checked_add(len as usize)
            .and_then(|end| elements.get_mut(start..end))
        {
            Some(slots) => {
                slots.fill(value);
                true
            }
            None => false,
        }
    }

    /// Copies `values` into the table at `offset`, or does nothing if they do
    /// not fit.
    pub fn initialize(&self, offset: u32, values: &[Reference]) -> bool {
        let mut elements = self.elements.write();
        let start = offset as usize;
        match start
            .checked_add(values.len())
            .and_then(|end| elements.get_mut(start..end))
        {
            Some(slots) => {
                slots.copy_from_slice(values);
                true
            }
            None => false,
        }
    }
}

/// The references of a passive element segment, kept until `elem.drop`.
#[derive(Debug)]
pub struct ElementInstance {
    ty: RefType,
    references: RwLock<Vec<Reference>>,
}

impl ElementInstance {
    pub fn new(ty: RefType, references: Vec<Reference>) -> ElementInstance {
        ElementInstance {
            ty,
            references: RwLock::new(references),
        }
    }

    /// An element instance with no references, standing in for segments
    /// that are not passive or have been dropped.
    pub fn empty(ty: RefType) -> ElementInstance {
        ElementInstance::new(ty, Vec::new())
    }

    pub fn element_type(&self) -> RefType {
        self.ty
    }

    pub fn references(&self) -> Vec<Reference> {
        self.references.read().clone()
    }

    pub fn len(&self) -> usize {
        self.references.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drop_references(&self) {
        *self.references.write() = Vec::new();
    }
}

/// An active element segment, resolved against the instance's tables, for an
/// engine to write into its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInitEntry {
    /// Index of the segment in the module's element section.
    pub segment_index: usize,
    pub table_index: u32,
    pub offset: u32,
    /// Function indices, with `None` for a null reference.
    pub function_indices: Vec<Option<u32>>,
}
