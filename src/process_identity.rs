//! OS-identity switch used when the dispatcher spawns a supervisor: the
//! supervisor (and every worker it owns) runs under the submitter's
//! operating-system identity, not the dispatcher's.

use anyhow::{anyhow, Result};

/// Target OS identity a spawned supervisor should assume.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// Abstracted so tests can exercise dispatcher/supervisor logic without
/// actually calling into `setuid`/`setgid`, which requires root and is
/// irreversible within a process.
pub trait IdentitySwitcher: Send + Sync {
    fn assume(&self, identity: Identity) -> Result<()>;
}

#[cfg(target_os = "linux")]
pub struct UnixIdentitySwitcher;

#[cfg(target_os = "linux")]
impl IdentitySwitcher for UnixIdentitySwitcher {
    fn assume(&self, identity: Identity) -> Result<()> {
        // Order matters: dropping uid first would remove the privilege
        // needed to change gid afterward.
        let gid_result = unsafe { libc::setgid(identity.gid) };
        if gid_result != 0 {
            return Err(anyhow!(
                "setgid({}) failed: {}",
                identity.gid,
                std::io::Error::last_os_error()
            ));
        }
        let uid_result = unsafe { libc::setuid(identity.uid) };
        if uid_result != 0 {
            return Err(anyhow!(
                "setuid({}) failed: {}",
                identity.uid,
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }
}

/// Test/non-Linux double: records the requested identity without
/// touching process credentials.
pub struct NoopIdentitySwitcher {
    pub last_assumed: std::sync::Mutex<Option<Identity>>,
}

impl NoopIdentitySwitcher {
    pub fn new() -> Self {
        Self {
            last_assumed: std::sync::Mutex::new(None),
        }
    }
}

impl Default for NoopIdentitySwitcher {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySwitcher for NoopIdentitySwitcher {
    fn assume(&self, identity: Identity) -> Result<()> {
        *self.last_assumed.lock().expect("lock poisoned") = Some(identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_switcher_records_requested_identity() {
        let switcher = NoopIdentitySwitcher::new();
        switcher.assume(Identity { uid: 1000, gid: 1000 }).unwrap();
        let recorded = switcher.last_assumed.lock().unwrap();
        assert_eq!(recorded.unwrap().uid, 1000);
    }
}
