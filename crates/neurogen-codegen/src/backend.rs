// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The backend contract.
//!
//! Everything device-specific the emitters and the runtime need: an
//! array factory, the spellings of atomics / thread indices / memory
//! prefixes, RNG plumbing and capability queries. Concrete device
//! backends live outside this crate; [`crate::ReferenceBackend`]
//! implements the contract for a single-threaded host target.

use crate::code_stream::CodeStream;
use crate::preferences::Preferences;
use neurogen_model::{SynapseGroup, VarLocation};
use neurogen_types::NumericType;
use thiserror::Error;

/// Kernels a backend launches per timestep or per initialisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    NeuronUpdate,
    PresynapticUpdate,
    PostsynapticUpdate,
    SynapseDynamicsUpdate,
    Initialize,
    InitializeSparse,
    NeuronSpikeQueueUpdate,
    NeuronPrevSpikeTimeUpdate,
    SynapseDendriticDelayUpdate,
    CustomUpdate,
    CustomTransposeUpdate,
}

impl Kernel {
    pub fn name(self) -> &'static str {
        match self {
            Kernel::NeuronUpdate => "updateNeuronsKernel",
            Kernel::PresynapticUpdate => "updatePresynapticKernel",
            Kernel::PostsynapticUpdate => "updatePostsynapticKernel",
            Kernel::SynapseDynamicsUpdate => "updateSynapseDynamicsKernel",
            Kernel::Initialize => "initializeKernel",
            Kernel::InitializeSparse => "initializeSparseKernel",
            Kernel::NeuronSpikeQueueUpdate => "neuronSpikeQueueUpdateKernel",
            Kernel::NeuronPrevSpikeTimeUpdate => "neuronPrevSpikeTimeUpdateKernel",
            Kernel::SynapseDendriticDelayUpdate => "synapseDendriticDelayUpdateKernel",
            Kernel::CustomUpdate => "customUpdateKernel",
            Kernel::CustomTransposeUpdate => "customTransposeUpdateKernel",
        }
    }
}

/// What atomic operation is required
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOperation {
    Add,
    Or,
}

/// What memory space the atomic operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicMemSpace {
    Global,
    Shared,
}

/// Errors surfaced by concrete backends (device OOM, launch failure).
/// Propagated verbatim; the simulation cannot continue.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("out of device memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("operation unsupported by backend: {0}")]
    Unsupported(String),

    #[error("backend error: {0}")]
    Other(String),
}

/// Handle to a typed, sized buffer created by a backend
pub trait Array {
    fn element_type(&self) -> NumericType;
    fn count(&self) -> usize;
    fn location(&self) -> VarLocation;

    /// Re-allocate to a new element count (extra-global parameters)
    fn allocate(&mut self, count: usize) -> Result<(), BackendError>;

    /// Release backing storage; further access is a usage error
    fn free(&mut self);

    /// Copy host contents to the device
    fn push(&mut self) -> Result<(), BackendError>;

    /// Copy device contents back to the host
    fn pull(&mut self) -> Result<(), BackendError>;

    /// Host-side view; empty when the array is device-only
    fn host_bytes(&self) -> &[u8];

    fn host_bytes_mut(&mut self) -> &mut [u8];
}

/// The full backend contract consumed by the emitters and runtime
pub trait Backend {
    // ---- arrays -----------------------------------------------------

    fn create_array(
        &self,
        element_type: NumericType,
        count: usize,
        location: VarLocation,
    ) -> Result<Box<dyn Array>, BackendError>;

    /// Rounded-up row length used to size synaptic matrices
    fn synaptic_matrix_row_stride(&self, group: &SynapseGroup, num_trg_neurons: u32) -> usize;

    // ---- source dialect ---------------------------------------------

    /// Prefix for pointers into device global memory
    fn pointer_prefix(&self) -> &'static str;

    /// Prefix declaring block-shared memory
    fn shared_prefix(&self) -> &'static str;

    /// Expression for the calling thread's index on an axis
    fn thread_id(&self, axis: u32) -> String;

    /// Expression for the calling block's index on an axis
    fn block_id(&self, axis: u32) -> String;

    /// Name of the count-leading-zeros intrinsic
    fn clz(&self) -> &'static str;

    /// Identifier of the atomic of the requested flavour
    fn atomic(
        &self,
        element_type: NumericType,
        op: AtomicOperation,
        space: AtomicMemSpace,
    ) -> String;

    /// Emit a block-wide barrier
    fn gen_shared_mem_barrier(&self, stream: &mut CodeStream);

    // ---- RNG plumbing ------------------------------------------------

    /// Initialise a population RNG stream from seed and sequence
    fn gen_population_rng_init(
        &self,
        stream: &mut CodeStream,
        rng: &str,
        seed: &str,
        sequence: &str,
    );

    /// Bind a usable `rng` name over a population RNG element; returns
    /// the expression model code should use
    fn gen_population_rng_preamble(&self, stream: &mut CodeStream, rng: &str) -> String;

    /// Write local RNG state back, where the backend requires it
    fn gen_population_rng_postamble(&self, stream: &mut CodeStream, rng: &str);

    /// Copy the global RNG and skip it ahead per-sequence; returns the
    /// expression model code should use
    fn gen_global_rng_skip_ahead(&self, stream: &mut CodeStream, sequence: &str) -> String;

    // ---- capabilities -------------------------------------------------

    /// Does postsynaptic learning need the column-major remap?
    fn is_postsynaptic_remap_required(&self) -> bool;

    /// Does this backend keep per-neuron RNG state?
    fn is_population_rng_required(&self) -> bool;

    /// Must `scalar` constants live in device memory?
    fn is_device_scalar_required(&self) -> bool;

    /// On some devices shared-memory atomics are slower than global
    /// ones and should be avoided
    fn are_shared_mem_atomics_slow(&self) -> bool;

    fn preferences(&self) -> &Preferences;
}
