//! Fatal fault taxonomy shared by the whole workspace.
//!
//! The engine has no recoverable error path: every invariant violation is a
//! caller or programmer defect, and the response is a diagnostic abort, never
//! silent continuation into undefined behavior. All failures funnel through
//! [`die`], which panics with the fault's class and message; under
//! `panic = "abort"` deployments that terminates the process, and in tests it
//! stays assertable with `#[should_panic]`.

use thiserror::Error;

/// Broad class of a [`HeapFault`], mirrored in the panic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// The caller asked for something unrepresentable or forbidden by config.
    Configuration,
    /// Engine bookkeeping and reality disagree; memory can no longer be trusted.
    Corruption,
    /// The OS or the configured footprint refused to yield more memory.
    Exhaustion,
}

/// Every way the engine can fatally fail.
#[derive(Debug, Error)]
pub enum HeapFault {
    #[error("zero-size allocation request")]
    ZeroSizeRequest,
    #[error("alignment {align} is not a nonzero power of two")]
    UnusableAlignment { align: usize },
    #[error("request of {requested} bytes exceeds the block-size ceiling of {ceiling} bytes")]
    OversizeRequest { requested: usize, ceiling: usize },
    #[error("reservation would pass the configured maximum footprint of {max_footprint} bytes")]
    FootprintCeiling { max_footprint: usize },
    #[error("initial footprint {initial} exceeds the maximum footprint {max}")]
    FootprintOrder { initial: usize, max: usize },

    #[error("header at {addr:#x} does not reference a live block record")]
    HeaderMismatch { addr: usize },
    #[error("double release of the block at {addr:#x}")]
    DoubleRelease { addr: usize },
    #[error("resize of the free block at {addr:#x}")]
    ResizeOfFreeBlock { addr: usize },
    #[error("blocks at {left:#x} and {right:#x} are not address-contiguous")]
    Discontiguity { left: usize, right: usize },
    #[error("no tree entry for a key required to exist")]
    MissingTreeKey,
    #[error("tree descent stack exhausted")]
    TraversalOverflow,
    #[error("free-list bucket index {bucket} out of range")]
    BucketOverflow { bucket: u32 },
    #[error("metadata arena index space exhausted")]
    SlotSpaceExhausted,

    #[error("operating system refused a request of {bytes} bytes")]
    OsRefused { bytes: usize },
    #[error("no fitting free block for {size} bytes even after growth")]
    NoFit { size: usize },
}

impl HeapFault {
    /// The taxonomy class this fault belongs to.
    #[must_use]
    pub fn class(&self) -> FaultClass {
        match self {
            Self::ZeroSizeRequest
            | Self::UnusableAlignment { .. }
            | Self::OversizeRequest { .. }
            | Self::FootprintCeiling { .. }
            | Self::FootprintOrder { .. } => FaultClass::Configuration,
            Self::HeaderMismatch { .. }
            | Self::DoubleRelease { .. }
            | Self::ResizeOfFreeBlock { .. }
            | Self::Discontiguity { .. }
            | Self::MissingTreeKey
            | Self::TraversalOverflow
            | Self::BucketOverflow { .. }
            | Self::SlotSpaceExhausted => FaultClass::Corruption,
            Self::OsRefused { .. } | Self::NoFit { .. } => FaultClass::Exhaustion,
        }
    }
}

/// Terminate on an unrecoverable fault. Never returns.
#[cold]
#[inline(never)]
pub fn die(fault: HeapFault) -> ! {
    panic!("fatal heap fault [{:?}]: {fault}", fault.class());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classes() {
        assert_eq!(FaultClass::Configuration, HeapFault::ZeroSizeRequest.class());
        assert_eq!(
            FaultClass::Configuration,
            HeapFault::UnusableAlignment { align: 3 }.class()
        );
        assert_eq!(
            FaultClass::Corruption,
            HeapFault::DoubleRelease { addr: 0x1000 }.class()
        );
        assert_eq!(FaultClass::Corruption, HeapFault::MissingTreeKey.class());
        assert_eq!(
            FaultClass::Exhaustion,
            HeapFault::OsRefused { bytes: 4096 }.class()
        );
    }

    #[test]
    fn test_fault_messages_name_the_address() {
        let msg = HeapFault::DoubleRelease { addr: 0xdead_beef }.to_string();
        assert!(msg.contains("0xdeadbeef"), "unexpected message: {msg}");
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Exhaustion]")]
    fn test_die_carries_class_and_message() {
        die(HeapFault::OsRefused { bytes: 1 });
    }
}
