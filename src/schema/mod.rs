//! Validated relation graph among join roles.
//!
//! A [`RelationSchema`] is a forest: every role has at most one parent role
//! and any number of ordered child roles. Values are immutable; every
//! successful [`RelationSchema::define`] returns a new schema carrying the
//! next generation number, which downstream caches use for invalidation.

#![forbid(unsafe_code)]

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::SchemaError;
use crate::types::SchemaGeneration;

pub mod mapping;

pub use mapping::{ChildRoles, JoinFieldMapping};

/// Shared role name.
pub type Role = Arc<str>;

type ChildList = SmallVec<[Role; 2]>;

/// Immutable, validated parent/child role graph.
#[derive(Clone, Debug, Default)]
pub struct RelationSchema {
    generation: SchemaGeneration,
    roles: Vec<Role>,
    children: FxHashMap<Role, ChildList>,
    parents: FxHashMap<Role, Role>,
}

impl RelationSchema {
    /// Returns the empty schema at generation zero.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a schema from `(parent, children)` declarations in order.
    pub fn from_relations<I, P, C, S>(relations: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut schema = Self::empty();
        for (parent, children) in relations {
            schema = schema.define(parent.as_ref(), children)?;
        }
        Ok(schema)
    }

    /// Declares `role` as the parent of every role in `children`.
    ///
    /// Fails without modifying `self` if an edge would close a cycle or give a
    /// child a second parent role. Re-declaring an existing edge is a no-op
    /// apart from the generation bump.
    pub fn define<C, S>(&self, role: &str, children: C) -> Result<Self, SchemaError>
    where
        C: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        check_name(role)?;
        let mut next = self.clone();
        let parent = next.intern(role);
        next.children.entry(Arc::clone(&parent)).or_default();
        for child in children {
            let child = child.as_ref();
            check_name(child)?;
            if let Some(existing) = next.parents.get(child) {
                if existing.as_ref() != role {
                    return Err(SchemaError::MultipleParentRoles {
                        child: child.to_string(),
                        existing: existing.to_string(),
                        proposed: role.to_string(),
                    });
                }
                continue;
            }
            if child == role
                || next
                    .ancestors_of(role)
                    .any(|ancestor| ancestor.as_ref() == child)
            {
                return Err(SchemaError::CycleDetected {
                    parent: role.to_string(),
                    child: child.to_string(),
                });
            }
            let child = next.intern(child);
            next.parents.insert(Arc::clone(&child), Arc::clone(&parent));
            next.children
                .entry(Arc::clone(&parent))
                .or_default()
                .push(child);
        }
        next.generation = self.generation.next();
        Ok(next)
    }

    /// Returns a copy of this schema whose generation follows `previous`.
    ///
    /// Used when a freshly parsed schema replaces a live one so generations
    /// keep increasing across redefinitions.
    pub fn succeeding(mut self, previous: SchemaGeneration) -> Self {
        self.generation = SchemaGeneration(previous.0.max(self.generation.0)).next();
        self
    }

    /// Generation number of this schema value.
    pub fn generation(&self) -> SchemaGeneration {
        self.generation
    }

    /// Returns whether `role` is declared.
    pub fn validate_role(&self, role: &str) -> bool {
        self.children.contains_key(role) || self.parents.contains_key(role)
    }

    /// Returns the shared name of `role`, or `UnknownRole`.
    pub fn require_role(&self, role: &str) -> Result<&Role, SchemaError> {
        self.children
            .get_key_value(role)
            .map(|(known, _)| known)
            .or_else(|| self.parents.get_key_value(role).map(|(known, _)| known))
            .ok_or_else(|| SchemaError::UnknownRole {
                role: role.to_string(),
            })
    }

    /// Returns whether `role` has a parent role.
    pub fn is_child_role(&self, role: &str) -> bool {
        self.parents.contains_key(role)
    }

    /// Returns whether `role` has at least one child role.
    pub fn is_parent_role(&self, role: &str) -> bool {
        self.children.get(role).is_some_and(|list| !list.is_empty())
    }

    /// Parent role of `role`, if it is a child role.
    pub fn parent_role_of(&self, role: &str) -> Option<&Role> {
        self.parents.get(role)
    }

    /// Ordered child roles of `role`; empty when it has none.
    pub fn child_roles_of(&self, role: &str) -> &[Role] {
        self.children.get(role).map(|list| list.as_slice()).unwrap_or(&[])
    }

    /// Walks from the parent role of `role` up to the root of its tree.
    pub fn ancestors_of<'a>(&'a self, role: &str) -> Ancestors<'a> {
        Ancestors {
            schema: self,
            next: self.parents.get(role),
        }
    }

    /// Number of ancestors of `role` (zero for roots and unknown roles).
    pub fn depth_of(&self, role: &str) -> usize {
        self.ancestors_of(role).count()
    }

    /// All roles in declaration order.
    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.iter()
    }

    /// Parent roles with their ordered child roles, in declaration order.
    pub fn relations(&self) -> impl Iterator<Item = (&Role, &[Role])> {
        self.roles.iter().filter_map(move |role| {
            self.children
                .get(role)
                .filter(|list| !list.is_empty())
                .map(|list| (role, list.as_slice()))
        })
    }

    /// Returns true when no role is declared.
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    fn intern(&mut self, role: &str) -> Role {
        if let Some(existing) = self.roles.iter().find(|known| known.as_ref() == role) {
            return Arc::clone(existing);
        }
        let role: Role = Arc::from(role);
        self.roles.push(Arc::clone(&role));
        role
    }
}

/// Iterator returned by [`RelationSchema::ancestors_of`].
pub struct Ancestors<'a> {
    schema: &'a RelationSchema,
    next: Option<&'a Role>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Role;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.schema.parents.get(current.as_ref());
        Some(current)
    }
}

fn check_name(role: &str) -> Result<(), SchemaError> {
    if role.trim().is_empty() {
        return Err(SchemaError::InvalidRoleName);
    }
    Ok(())
}
