use crate::block::BlockError;
use thiserror::Error;

/// Error type for page-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// The thread has no mapping at this address
    #[error("address is not mapped by this thread")]
    NotMapped,
    /// The mapping is backed by a resident frame, nothing to read in
    #[error("page is already resident")]
    AlreadyResident,
    /// The page table could not take the faulting mapping back
    #[error("page table refused the mapping")]
    InstallFailed,
    /// The swap device failed; the image stays in its slot
    #[error("swap device error: {0}")]
    Block(#[from] BlockError),
}
