//! Privilege checks for the destructive surfaces.

use crate::error::{VigilError, VigilResult};

/// Refuse to run without root.
///
/// Stopping services, unmounting, closing mappings, and editing fstab all
/// require it; failing at startup beats failing halfway through a wipe.
pub fn ensure_root() -> VigilResult<()> {
    if running_as_root() {
        Ok(())
    } else {
        Err(VigilError::Privilege(
            "vigil must run as root to manage mounts, services, and key material; \
             run it via its systemd unit"
                .into(),
        ))
    }
}

#[cfg(unix)]
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    true
}
