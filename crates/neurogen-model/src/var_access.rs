// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Variable access modes, access dimensions and memory locations.

/// How model code may access a state variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VarAccess {
    /// Readable and writable, duplicated across batches
    #[default]
    ReadWrite,
    /// Read-only, shared across batches
    ReadOnly,
    /// Read-only but duplicated across batches
    ReadOnlyDuplicate,
    /// Read-only, shared across neurons within a batch
    ReadOnlySharedNeuron,
}

/// Read/write capability, independent of duplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarAccessMode {
    ReadWrite,
    ReadOnly,
}

/// Which axes a variable spans; drives array sizing and index
/// generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarAccessDim {
    /// One value per element (neuron / synapse)
    pub element: bool,
    /// Duplicated across the batch dimension
    pub batch: bool,
}

impl VarAccess {
    pub fn mode(self) -> VarAccessMode {
        match self {
            VarAccess::ReadWrite => VarAccessMode::ReadWrite,
            _ => VarAccessMode::ReadOnly,
        }
    }

    pub fn dims(self) -> VarAccessDim {
        match self {
            VarAccess::ReadWrite | VarAccess::ReadOnlyDuplicate => VarAccessDim {
                element: true,
                batch: true,
            },
            VarAccess::ReadOnly => VarAccessDim {
                element: true,
                batch: false,
            },
            VarAccess::ReadOnlySharedNeuron => VarAccessDim {
                element: false,
                batch: true,
            },
        }
    }

    pub(crate) fn hash_tag(self) -> u32 {
        match self {
            VarAccess::ReadWrite => 0,
            VarAccess::ReadOnly => 1,
            VarAccess::ReadOnlyDuplicate => 2,
            VarAccess::ReadOnlySharedNeuron => 3,
        }
    }
}

/// Where an array lives relative to the host/device boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VarLocation {
    HostOnly,
    DeviceOnly,
    #[default]
    HostDevice,
    HostDeviceZeroCopy,
}

impl VarLocation {
    pub fn has_host(self) -> bool {
        !matches!(self, VarLocation::DeviceOnly)
    }

    pub fn has_device(self) -> bool {
        !matches!(self, VarLocation::HostOnly)
    }

    pub fn is_zero_copy(self) -> bool {
        matches!(self, VarLocation::HostDeviceZeroCopy)
    }

    pub(crate) fn hash_tag(self) -> u32 {
        match self {
            VarLocation::HostOnly => 0,
            VarLocation::DeviceOnly => 1,
            VarLocation::HostDevice => 2,
            VarLocation::HostDeviceZeroCopy => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_spans_batch_and_element() {
        let dims = VarAccess::ReadWrite.dims();
        assert!(dims.element && dims.batch);
    }

    #[test]
    fn test_read_only_shared_across_batches() {
        let dims = VarAccess::ReadOnly.dims();
        assert!(dims.element && !dims.batch);
        assert_eq!(VarAccess::ReadOnly.mode(), VarAccessMode::ReadOnly);
    }

    #[test]
    fn test_zero_copy_location() {
        assert!(VarLocation::HostDeviceZeroCopy.is_zero_copy());
        assert!(VarLocation::HostDeviceZeroCopy.has_host());
        assert!(!VarLocation::HostOnly.has_device());
    }
}
