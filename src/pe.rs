//! PE enumeration.
//!
//! The PMI-style job runtimes (pmi2/pmix) are external collaborators; the
//! in-tree `none` runtime is a single-PE world with a no-op barrier.

use crate::config::PeRuntimeKind;
use crate::error::{FamError, FamResult};

#[derive(Clone, Copy, Debug)]
pub(crate) struct PeInfo {
    pub pe_id: u64,
    pub num_pes: u64,
}

pub(crate) fn initialize(kind: PeRuntimeKind) -> FamResult<PeInfo> {
    match kind {
        PeRuntimeKind::None => Ok(PeInfo {
            pe_id: 0,
            num_pes: 1,
        }),
        PeRuntimeKind::Pmi2 | PeRuntimeKind::Pmix => Err(FamError::unimpl(
            "PMI job runtimes are not available in this build",
        )),
    }
}

pub(crate) fn barrier(_pe: &PeInfo) {
    // Single-PE world; nothing to synchronize with.
}
