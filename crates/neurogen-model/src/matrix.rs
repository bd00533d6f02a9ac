// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Synaptic matrix representations and kernel parallelism axes.

/// How connectivity is represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynapseMatrixConnectivity {
    Dense,
    Sparse,
    Bitmask,
    /// Connectivity regenerated on the fly from the build code
    Procedural,
    /// Diagonal-structured connectivity over a kernel
    Toeplitz,
}

/// How weights are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynapseMatrixWeight {
    /// One shared value per variable, taken from constant initialisers
    Global,
    /// One value per synapse
    Individual,
    /// Weights live in a shared kernel indexed by relative position
    Kernel,
    /// Weights regenerated on the fly from the initialiser code
    Procedural,
}

/// Combined matrix type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SynapseMatrixType {
    pub connectivity: SynapseMatrixConnectivity,
    pub weight: SynapseMatrixWeight,
}

impl SynapseMatrixType {
    pub const DENSE_GLOBALG: Self = Self::new(
        SynapseMatrixConnectivity::Dense,
        SynapseMatrixWeight::Global,
    );
    pub const DENSE_INDIVIDUALG: Self = Self::new(
        SynapseMatrixConnectivity::Dense,
        SynapseMatrixWeight::Individual,
    );
    pub const DENSE_PROCEDURALG: Self = Self::new(
        SynapseMatrixConnectivity::Dense,
        SynapseMatrixWeight::Procedural,
    );
    pub const SPARSE_GLOBALG: Self = Self::new(
        SynapseMatrixConnectivity::Sparse,
        SynapseMatrixWeight::Global,
    );
    pub const SPARSE_INDIVIDUALG: Self = Self::new(
        SynapseMatrixConnectivity::Sparse,
        SynapseMatrixWeight::Individual,
    );
    pub const BITMASK_GLOBALG: Self = Self::new(
        SynapseMatrixConnectivity::Bitmask,
        SynapseMatrixWeight::Global,
    );
    pub const PROCEDURAL_GLOBALG: Self = Self::new(
        SynapseMatrixConnectivity::Procedural,
        SynapseMatrixWeight::Global,
    );
    pub const PROCEDURAL_PROCEDURALG: Self = Self::new(
        SynapseMatrixConnectivity::Procedural,
        SynapseMatrixWeight::Procedural,
    );
    pub const PROCEDURAL_KERNELG: Self = Self::new(
        SynapseMatrixConnectivity::Procedural,
        SynapseMatrixWeight::Kernel,
    );
    pub const SPARSE_KERNELG: Self = Self::new(
        SynapseMatrixConnectivity::Sparse,
        SynapseMatrixWeight::Kernel,
    );
    pub const TOEPLITZ_KERNELG: Self = Self::new(
        SynapseMatrixConnectivity::Toeplitz,
        SynapseMatrixWeight::Kernel,
    );

    pub const fn new(
        connectivity: SynapseMatrixConnectivity,
        weight: SynapseMatrixWeight,
    ) -> Self {
        Self {
            connectivity,
            weight,
        }
    }

    pub fn is_dense(self) -> bool {
        self.connectivity == SynapseMatrixConnectivity::Dense
    }

    pub fn is_sparse(self) -> bool {
        self.connectivity == SynapseMatrixConnectivity::Sparse
    }

    pub fn is_bitmask(self) -> bool {
        self.connectivity == SynapseMatrixConnectivity::Bitmask
    }

    pub fn is_procedural(self) -> bool {
        self.connectivity == SynapseMatrixConnectivity::Procedural
    }

    pub fn is_toeplitz(self) -> bool {
        self.connectivity == SynapseMatrixConnectivity::Toeplitz
    }

    pub fn has_individual_weights(self) -> bool {
        self.weight == SynapseMatrixWeight::Individual
    }

    pub fn has_kernel_weights(self) -> bool {
        self.weight == SynapseMatrixWeight::Kernel
    }

    pub fn has_procedural_weights(self) -> bool {
        self.weight == SynapseMatrixWeight::Procedural
    }

    pub(crate) fn hash_tag(self) -> u32 {
        let c = match self.connectivity {
            SynapseMatrixConnectivity::Dense => 0,
            SynapseMatrixConnectivity::Sparse => 1,
            SynapseMatrixConnectivity::Bitmask => 2,
            SynapseMatrixConnectivity::Procedural => 3,
            SynapseMatrixConnectivity::Toeplitz => 4,
        };
        let w = match self.weight {
            SynapseMatrixWeight::Global => 0,
            SynapseMatrixWeight::Individual => 1,
            SynapseMatrixWeight::Kernel => 2,
            SynapseMatrixWeight::Procedural => 3,
        };
        (c << 8) | w
    }
}

/// Axis of parallelism across a synapse kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpanType {
    /// One thread per target neuron, iterating the incoming spike buffer
    #[default]
    Postsynaptic,
    /// One thread per source neuron, iterating its row of targets
    Presynaptic,
}

impl SpanType {
    pub(crate) fn hash_tag(self) -> u32 {
        match self {
            SpanType::Postsynaptic => 0,
            SpanType::Presynaptic => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_type_queries() {
        assert!(SynapseMatrixType::DENSE_INDIVIDUALG.is_dense());
        assert!(SynapseMatrixType::DENSE_INDIVIDUALG.has_individual_weights());
        assert!(SynapseMatrixType::SPARSE_GLOBALG.is_sparse());
        assert!(SynapseMatrixType::TOEPLITZ_KERNELG.has_kernel_weights());
        assert!(SynapseMatrixType::PROCEDURAL_PROCEDURALG.has_procedural_weights());
    }

    #[test]
    fn test_hash_tags_distinct() {
        let types = [
            SynapseMatrixType::DENSE_GLOBALG,
            SynapseMatrixType::DENSE_INDIVIDUALG,
            SynapseMatrixType::SPARSE_INDIVIDUALG,
            SynapseMatrixType::BITMASK_GLOBALG,
            SynapseMatrixType::PROCEDURAL_PROCEDURALG,
            SynapseMatrixType::TOEPLITZ_KERNELG,
        ];
        let tags: std::collections::BTreeSet<u32> =
            types.iter().map(|t| t.hash_tag()).collect();
        assert_eq!(tags.len(), types.len());
    }
}
