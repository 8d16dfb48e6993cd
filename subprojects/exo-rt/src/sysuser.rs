//! Identity of the user running the process.

use exo_svc::process::{self, Uid};

/// User ids captured at process init.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SysUser {
    pub real_uid: Uid,
    pub effective_uid: Uid,
}

impl SysUser {
    pub fn capture() -> Self {
        Self {
            real_uid: process::real_uid(),
            effective_uid: process::effective_uid(),
        }
    }

    /// Returns `true` if the process runs with another user's privileges.
    pub fn is_setuid(&self) -> bool {
        self.real_uid != self.effective_uid
    }
}
