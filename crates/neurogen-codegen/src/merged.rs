// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Merged groups: compile-time equivalence classes of user groups,
//! emitted as a single kernel body parameterised by per-member fields.
//!
//! Groups whose per-pass digests are equal land in one
//! [`MergedGroup`]; the first member (lowest stable index) is the
//! archetype whose code shape is emitted verbatim. Parameters whose
//! values agree across members stay compile-time constants; the rest
//! become runtime fields.

use crate::{CodegenError, Result};
use neurogen_model::{
    CurrentSourceId, CustomConnectivityUpdateId, CustomUpdateId, CustomUpdateWuId, HashDigest,
    NeuronGroupId, ParamValues, SynapseGroupId,
};
use neurogen_types::ResolvedType;

/// A reference to any group kind, as the runtime keys its array map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupRef {
    Neuron(NeuronGroupId),
    Synapse(SynapseGroupId),
    CurrentSource(CurrentSourceId),
    CustomUpdate(CustomUpdateId),
    CustomUpdateWu(CustomUpdateWuId),
    CustomConnectivityUpdate(CustomConnectivityUpdateId),
}

/// Per-member value of a merged-group field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldInit {
    /// Resolved by the runtime through its (group, variable) array map
    Array { group: GroupRef, var: String },
    U32(u32),
    F64(f64),
}

/// One field of a merged group's parameter structure
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: ResolvedType,
    /// One value per member, in member order
    pub values: Vec<FieldInit>,
}

/// An ordered, stably-sorted aggregate of groups with equal structural
/// digest
pub struct MergedGroup<'m, I: Copy, G> {
    index: usize,
    ids: Vec<I>,
    groups: Vec<&'m G>,
    fields: Vec<Field>,
}

impl<'m, I: Copy, G> MergedGroup<'m, I, G> {
    pub fn new(index: usize, members: Vec<(I, &'m G)>) -> Self {
        let (ids, groups) = members.into_iter().unzip();
        Self {
            index,
            ids,
            groups,
            fields: Vec::new(),
        }
    }

    /// Position of this merged group within its pass
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The representative whose code shape is emitted verbatim
    pub fn archetype(&self) -> &'m G {
        self.groups[0]
    }

    pub fn archetype_id(&self) -> I {
        self.ids[0]
    }

    pub fn groups(&self) -> &[&'m G] {
        &self.groups
    }

    pub fn ids(&self) -> &[I] {
        &self.ids
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Register a field, keeping names unique. Re-adding a field with
    /// the same name and type is a no-op; a type clash is an error.
    pub fn add_field(&mut self, field: Field) -> Result<()> {
        if let Some(existing) = self.fields.iter().find(|f| f.name == field.name) {
            if existing.ty == field.ty {
                return Ok(());
            }
            return Err(CodegenError::DuplicateField(field.name));
        }
        self.fields.push(field);
        Ok(())
    }

    pub(crate) fn add_fields(&mut self, fields: Vec<Field>) -> Result<()> {
        for field in fields {
            self.add_field(field)?;
        }
        Ok(())
    }
}

/// Partition members by digest, preserving first-occurrence order so
/// merged-group indices are stable across runs
pub fn partition_by_digest<'m, I: Copy, G>(
    members: impl Iterator<Item = (I, &'m G)>,
    digest: impl Fn(I, &'m G) -> HashDigest,
) -> Vec<MergedGroup<'m, I, G>> {
    let mut keys: Vec<HashDigest> = Vec::new();
    let mut partitions: Vec<Vec<(I, &'m G)>> = Vec::new();
    for (id, group) in members {
        let key = digest(id, group);
        match keys.iter().position(|k| *k == key) {
            Some(i) => partitions[i].push((id, group)),
            None => {
                keys.push(key);
                partitions.push(vec![(id, group)]);
            }
        }
    }
    partitions
        .into_iter()
        .enumerate()
        .map(|(index, members)| MergedGroup::new(index, members))
        .collect()
}

/// Is a parameter's value heterogeneous across a merged group's
/// members? The accessor pulls the relevant parameter map from a
/// member; one predicate serves every parameter kind.
pub fn is_param_heterogeneous<G: ?Sized>(
    groups: &[&G],
    name: &str,
    access: impl Fn(&G) -> &ParamValues,
) -> bool {
    let first = access(groups[0]).get(name);
    groups
        .iter()
        .skip(1)
        .any(|g| access(g).get(name) != first)
}

// Re-exported merged-model aggregate lives beside the emitters
pub use crate::generator::MergedModel;

#[cfg(test)]
mod tests {
    use super::*;
    use neurogen_model::HashBuilder;
    use neurogen_types::NumericType;

    struct TestGroup {
        shape: u32,
        params: ParamValues,
    }

    fn group(shape: u32, a: f64) -> TestGroup {
        let mut params = ParamValues::new();
        params.insert("a".into(), a);
        TestGroup { shape, params }
    }

    fn digest_of(g: &TestGroup) -> HashDigest {
        let mut h = HashBuilder::new("test");
        h.update_u32(g.shape);
        h.finalise()
    }

    #[test]
    fn test_partition_preserves_order() {
        let groups = [group(1, 0.0), group(2, 0.0), group(1, 0.0)];
        let merged = partition_by_digest(
            groups.iter().enumerate().map(|(i, g)| (i, g)),
            |_, g| digest_of(g),
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].ids(), &[0, 2]);
        assert_eq!(merged[1].ids(), &[1]);
        assert_eq!(merged[0].archetype_id(), 0);
    }

    #[test]
    fn test_param_heterogeneity() {
        let groups = [group(1, 0.02), group(1, 0.02), group(1, 0.03)];
        let refs: Vec<&TestGroup> = groups.iter().collect();
        assert!(is_param_heterogeneous(&refs, "a", |g| &g.params));
        let homogeneous: Vec<&TestGroup> = groups[..2].iter().collect();
        assert!(!is_param_heterogeneous(&homogeneous, "a", |g| &g.params));
    }

    #[test]
    fn test_field_uniqueness() {
        let groups = [group(1, 0.0)];
        let mut merged = MergedGroup::new(0, groups.iter().enumerate().map(|(i, g)| (i, g)).collect());
        let field = Field {
            name: "aValue".into(),
            ty: ResolvedType::numeric(NumericType::Float),
            values: vec![FieldInit::F64(0.0)],
        };
        merged.add_field(field.clone()).unwrap();
        // Same name, same type: idempotent
        merged.add_field(field).unwrap();
        assert_eq!(merged.fields().len(), 1);
        // Same name, clashing type: error
        let clash = Field {
            name: "aValue".into(),
            ty: ResolvedType::numeric(NumericType::Uint32),
            values: vec![FieldInit::U32(0)],
        };
        assert!(merged.add_field(clash).is_err());
    }
}
