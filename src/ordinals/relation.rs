//! Per-parent-role ordinal spaces.

use std::mem::size_of;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::BuildError;
use crate::schema::Role;
use crate::types::{DocPosition, Ordinal};

/// Ordinal space of one relation: identifiers of documents in `parent_role`.
///
/// Identifiers enter the space either as the id of a parent-role document or
/// as the declared parent of a child document, whichever comes first.
/// Ordinals are dense and never removed; an identifier whose documents are
/// all gone keeps its ordinal with an empty child set.
#[derive(Clone, Debug)]
pub struct RelationOrdinals {
    parent_role: Role,
    by_identifier: FxHashMap<Arc<str>, Ordinal>,
    identifiers: Vec<Arc<str>>,
    children: Vec<Vec<DocPosition>>,
    parent_docs: Vec<Option<DocPosition>>,
}

impl RelationOrdinals {
    pub(crate) fn new(parent_role: Role) -> Self {
        Self {
            parent_role,
            by_identifier: FxHashMap::default(),
            identifiers: Vec::new(),
            children: Vec::new(),
            parent_docs: Vec::new(),
        }
    }

    /// Parent role owning this space.
    pub fn parent_role(&self) -> &Role {
        &self.parent_role
    }

    /// Ordinal assigned to `identifier`, if any.
    pub fn ordinal_of(&self, identifier: &str) -> Option<Ordinal> {
        self.by_identifier.get(identifier).copied()
    }

    /// Identifier behind `ordinal`.
    pub fn identifier(&self, ordinal: Ordinal) -> Option<&str> {
        self.identifiers.get(ordinal.index()).map(|id| id.as_ref())
    }

    /// Sorted child positions of `ordinal`.
    pub fn children(&self, ordinal: Ordinal) -> &[DocPosition] {
        self.children
            .get(ordinal.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Position of the parent-role document carrying `ordinal`'s identifier.
    ///
    /// `None` for identifiers only known through children (orphans).
    pub fn parent_document(&self, ordinal: Ordinal) -> Option<DocPosition> {
        self.parent_docs.get(ordinal.index()).copied().flatten()
    }

    /// Number of ordinals handed out in this generation.
    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    /// Returns true when no ordinal has been assigned.
    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// Ordinals with neither children nor a parent document.
    pub fn tombstoned(&self) -> usize {
        self.children
            .iter()
            .zip(&self.parent_docs)
            .filter(|(children, parent)| children.is_empty() && parent.is_none())
            .count()
    }

    /// Number of child links across all ordinals.
    pub fn link_count(&self) -> usize {
        self.children.iter().map(Vec::len).sum()
    }

    /// Iterates `(identifier, children)` for ordinals that have children.
    pub fn child_sets(&self) -> impl Iterator<Item = (&str, &[DocPosition])> {
        self.identifiers
            .iter()
            .zip(&self.children)
            .filter(|(_, children)| !children.is_empty())
            .map(|(id, children)| (id.as_ref(), children.as_slice()))
    }

    pub(crate) fn resolve_or_create(&mut self, identifier: &str) -> Result<Ordinal, BuildError> {
        if let Some(ordinal) = self.by_identifier.get(identifier) {
            return Ok(*ordinal);
        }
        if self.identifiers.len() >= u32::MAX as usize {
            return Err(BuildError::OrdinalSpaceExhausted {
                relation: self.parent_role.to_string(),
            });
        }
        let ordinal = Ordinal(self.identifiers.len() as u32);
        let shared: Arc<str> = Arc::from(identifier);
        self.by_identifier.insert(Arc::clone(&shared), ordinal);
        self.identifiers.push(shared);
        self.children.push(Vec::new());
        self.parent_docs.push(None);
        Ok(ordinal)
    }

    pub(crate) fn set_parent_document(&mut self, ordinal: Ordinal, position: DocPosition) {
        self.parent_docs[ordinal.index()] = Some(position);
    }

    pub(crate) fn clear_parent_document(&mut self, ordinal: Ordinal, position: DocPosition) {
        let slot = &mut self.parent_docs[ordinal.index()];
        if *slot == Some(position) {
            *slot = None;
        }
    }

    pub(crate) fn add_child(&mut self, ordinal: Ordinal, position: DocPosition) {
        let children = &mut self.children[ordinal.index()];
        match children.last() {
            None => children.push(position),
            Some(last) if *last < position => children.push(position),
            Some(_) => {
                if let Err(idx) = children.binary_search(&position) {
                    children.insert(idx, position);
                }
            }
        }
    }

    pub(crate) fn remove_child(&mut self, ordinal: Ordinal, position: DocPosition) {
        let children = &mut self.children[ordinal.index()];
        if let Ok(idx) = children.binary_search(&position) {
            children.remove(idx);
        }
    }

    pub(crate) fn estimated_bytes(&self) -> usize {
        let identifiers: usize = self
            .identifiers
            .iter()
            .map(|id| id.len() + 2 * size_of::<Arc<str>>() + size_of::<Ordinal>())
            .sum();
        let children: usize = self
            .children
            .iter()
            .map(|set| size_of::<Vec<DocPosition>>() + set.capacity() * size_of::<DocPosition>())
            .sum();
        identifiers + children + self.parent_docs.len() * size_of::<Option<DocPosition>>()
    }
}
