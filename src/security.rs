//! Process-level guards for the subindex binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to run as root. The database and staging files should belong
/// to the invoking user, not to uid 0.
pub fn ensure_unprivileged(process: &str) -> Result<()> {
    reject_root(Uid::effective(), process)
}

fn reject_root(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} refuses to run as root; use a regular user account");
    }
    Ok(())
}
