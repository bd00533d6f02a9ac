// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reference backend: single-threaded host target.
//!
//! Implements the backend contract without any device, which keeps the
//! emitters and runtime honest about what they actually require. Thread
//! and block indices collapse to zero, atomics to plain helper
//! functions, and arrays to host buffers.

use crate::backend::{
    Array, AtomicMemSpace, AtomicOperation, Backend, BackendError, Kernel,
};
use crate::code_stream::CodeStream;
use crate::preferences::Preferences;
use neurogen_model::{SynapseGroup, VarLocation};
use neurogen_types::NumericType;

/// Host-memory array handle
pub struct HostArray {
    element_type: NumericType,
    location: VarLocation,
    data: Vec<u8>,
}

impl HostArray {
    fn new(element_type: NumericType, count: usize, location: VarLocation) -> Self {
        Self {
            element_type,
            location,
            data: vec![0u8; count * element_type.size()],
        }
    }
}

impl Array for HostArray {
    fn element_type(&self) -> NumericType {
        self.element_type
    }

    fn count(&self) -> usize {
        self.data.len() / self.element_type.size()
    }

    fn location(&self) -> VarLocation {
        self.location
    }

    fn allocate(&mut self, count: usize) -> Result<(), BackendError> {
        self.data = vec![0u8; count * self.element_type.size()];
        Ok(())
    }

    fn free(&mut self) {
        self.data = Vec::new();
    }

    fn push(&mut self) -> Result<(), BackendError> {
        // Host and device are the same memory
        Ok(())
    }

    fn pull(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn host_bytes(&self) -> &[u8] {
        &self.data
    }

    fn host_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Single-threaded host backend
#[derive(Default)]
pub struct ReferenceBackend {
    preferences: Preferences,
}

impl ReferenceBackend {
    pub fn new(preferences: Preferences) -> Self {
        Self { preferences }
    }

    pub fn block_size(&self, kernel: Kernel) -> u32 {
        self.preferences.block_sizes.get(kernel)
    }
}

impl Backend for ReferenceBackend {
    fn create_array(
        &self,
        element_type: NumericType,
        count: usize,
        location: VarLocation,
    ) -> Result<Box<dyn Array>, BackendError> {
        Ok(Box::new(HostArray::new(element_type, count, location)))
    }

    fn synaptic_matrix_row_stride(&self, group: &SynapseGroup, num_trg_neurons: u32) -> usize {
        if group.matrix_type().is_sparse() || group.matrix_type().is_toeplitz() {
            group.max_connections() as usize
        } else {
            num_trg_neurons as usize
        }
    }

    fn pointer_prefix(&self) -> &'static str {
        ""
    }

    fn shared_prefix(&self) -> &'static str {
        ""
    }

    fn thread_id(&self, _axis: u32) -> String {
        "0".to_string()
    }

    fn block_id(&self, _axis: u32) -> String {
        "0".to_string()
    }

    fn clz(&self) -> &'static str {
        "hostClz"
    }

    fn atomic(
        &self,
        element_type: NumericType,
        op: AtomicOperation,
        _space: AtomicMemSpace,
    ) -> String {
        // Single-threaded, so the "atomics" are plain helpers
        match (op, element_type.is_integral()) {
            (AtomicOperation::Add, false) => "hostAtomicAddFloat".to_string(),
            (AtomicOperation::Add, true) => "hostAtomicAddUint".to_string(),
            (AtomicOperation::Or, _) => "hostAtomicOr".to_string(),
        }
    }

    fn gen_shared_mem_barrier(&self, _stream: &mut CodeStream) {
        // One thread, nothing to synchronise
    }

    fn gen_population_rng_init(
        &self,
        stream: &mut CodeStream,
        rng: &str,
        seed: &str,
        sequence: &str,
    ) {
        stream.line(format!("hostRngInit(&{}, {}, {});", rng, seed, sequence));
    }

    fn gen_population_rng_preamble(&self, _stream: &mut CodeStream, rng: &str) -> String {
        format!("&{}", rng)
    }

    fn gen_population_rng_postamble(&self, _stream: &mut CodeStream, _rng: &str) {}

    fn gen_global_rng_skip_ahead(&self, stream: &mut CodeStream, sequence: &str) -> String {
        stream.line(format!(
            "HostRng initRng = hostRngSkipAhead(&globalRng, {});",
            sequence
        ));
        "&initRng".to_string()
    }

    fn is_postsynaptic_remap_required(&self) -> bool {
        false
    }

    fn is_population_rng_required(&self) -> bool {
        false
    }

    fn is_device_scalar_required(&self) -> bool {
        false
    }

    fn are_shared_mem_atomics_slow(&self) -> bool {
        false
    }

    fn preferences(&self) -> &Preferences {
        &self.preferences
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_array_round_trip() {
        let backend = ReferenceBackend::default();
        let mut array = backend
            .create_array(NumericType::Float, 16, VarLocation::HostDevice)
            .unwrap();
        assert_eq!(array.count(), 16);
        assert_eq!(array.host_bytes().len(), 64);
        array.host_bytes_mut()[0] = 0x3f;
        array.push().unwrap();
        array.pull().unwrap();
        assert_eq!(array.host_bytes()[0], 0x3f);
    }

    #[test]
    fn test_array_reallocate() {
        let backend = ReferenceBackend::default();
        let mut array = backend
            .create_array(NumericType::Uint32, 4, VarLocation::HostDevice)
            .unwrap();
        array.allocate(32).unwrap();
        assert_eq!(array.count(), 32);
    }
}
