//! Error types for the mirroring control plane.
//!
//! Every component (codec, allocator, flow controller, SR-IOV programmer)
//! reports failures through [`TaasError`]. All errors implement
//! `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for control-plane operations.
pub type TaasResult<T> = Result<T, TaasError>;

/// Errors that can occur while programming mirror state.
#[derive(Debug, Error)]
pub enum TaasError {
    /// A VLAN range token is neither an integer nor `a-b`.
    #[error("Malformed VLAN range token '{token}'")]
    MalformedRange {
        /// The offending token.
        token: String,
    },

    /// No taas_id is free in the configured range.
    #[error("VLAN tag pool exhausted (range {start}..{end})")]
    PoolExhausted {
        /// First taas_id of the pool.
        start: u16,
        /// One past the last taas_id of the pool.
        end: u16,
    },

    /// The pool store refused an assignment because another allocator won.
    #[error("taas_id {taas_id} already assigned by a concurrent allocation")]
    AllocationConflict {
        /// The contested taas_id.
        taas_id: u16,
    },

    /// A port has no PCI slot in its binding profile.
    #[error("PCI slot for port {port_id} (MAC {mac}) not found")]
    PciSlotNotFound {
        /// The port identifier.
        port_id: String,
        /// The port MAC address.
        mac: String,
    },

    /// A PCI address could not be resolved to a VF or PF device.
    #[error("PCI device {pci_addr} not found")]
    PciDeviceNotFound {
        /// The PCI address.
        pci_addr: String,
    },

    /// The virtual interface for a port is not attached to the switch.
    #[error("Port {port_id} not found on the switch")]
    PortNotFound {
        /// The port identifier.
        port_id: String,
    },

    /// Source and collection VFs belong to different physical functions.
    #[error("Cannot mirror across physical functions: source PF {source_pf}, collection PF {collection_pf}")]
    MismatchedPhysicalFunction {
        /// PF device of the source VF.
        source_pf: String,
        /// PF device of the collection VF.
        collection_pf: String,
    },

    /// A switch-control primitive failed.
    #[error("Switch control failure: {operation}: {message}")]
    SwitchControlFailure {
        /// The primitive that failed (e.g., "add-flow").
        operation: String,
        /// Error message.
        message: String,
    },

    /// The NIC mirror command failed.
    #[error("SR-IOV NIC control failure: {operation}: {message}")]
    NicControlFailure {
        /// Description of the mirror command.
        operation: String,
        /// Error message.
        message: String,
    },

    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// An intent message is missing data the backend needs.
    #[error("Invalid intent: {message}")]
    InvalidIntent {
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl TaasError {
    /// Creates a malformed range error.
    pub fn malformed_range(token: impl Into<String>) -> Self {
        Self::MalformedRange {
            token: token.into(),
        }
    }

    /// Creates a port not found error.
    pub fn port_not_found(port_id: impl Into<String>) -> Self {
        Self::PortNotFound {
            port_id: port_id.into(),
        }
    }

    /// Creates a PCI slot not found error.
    pub fn pci_slot_not_found(port_id: impl Into<String>, mac: impl Into<String>) -> Self {
        Self::PciSlotNotFound {
            port_id: port_id.into(),
            mac: mac.into(),
        }
    }

    /// Creates a PCI device not found error.
    pub fn pci_device_not_found(pci_addr: impl Into<String>) -> Self {
        Self::PciDeviceNotFound {
            pci_addr: pci_addr.into(),
        }
    }

    /// Wraps a failure of a switch-control primitive.
    pub fn switch_control(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::SwitchControlFailure {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Wraps a failure of the NIC mirror command.
    pub fn nic_control(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::NicControlFailure {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid intent error.
    pub fn invalid_intent(message: impl Into<String>) -> Self {
        Self::InvalidIntent {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaasError::AllocationConflict { .. } | TaasError::ShellExec { .. }
        )
    }

    /// Returns true if a delete path may treat this error as success.
    ///
    /// Port deletion can race ahead of tap-service deletion, so a vanished
    /// port is not a failure when tearing state down.
    pub fn is_benign_on_delete(&self) -> bool {
        matches!(self, TaasError::PortNotFound { .. })
    }

    /// Returns true if the intent should be rejected rather than reported
    /// as a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, TaasError::MismatchedPhysicalFunction { .. })
    }
}
