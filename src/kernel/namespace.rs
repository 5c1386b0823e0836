//! Namespace set entered by the sandboxed child
//! Mount, PID, UTS and IPC namespaces are always new; network is optional.
use crate::config::types::{Result, SandboxError};

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sched::CloneFlags;
use std::ffi::CString;

/// Namespaces created by `clone` for the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceSet {
    /// Enable network namespace isolation
    network: bool,
}

impl NamespaceSet {
    pub fn new(network: bool) -> Self {
        Self { network }
    }

    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC;
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }

    /// Get enabled namespaces as names
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = vec!["mount", "pid", "uts", "ipc"];
        if self.network {
            names.push("network");
        }
        names
    }
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Hostname and NIS domain name set inside the UTS namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtsIdentity {
    hostname: CString,
    domainname: CString,
}

impl UtsIdentity {
    pub fn new(hostname: &str, domainname: &str) -> Result<Self> {
        let to_c = |value: &str, what: &str| {
            CString::new(value)
                .map_err(|_| SandboxError::Config(format!("{} contains NUL byte", what)))
        };
        Ok(Self {
            hostname: to_c(hostname, "hostname")?,
            domainname: to_c(domainname, "domain name")?,
        })
    }

    /// Child side, inside the new UTS namespace.
    pub fn apply(&self) -> nix::Result<()> {
        // SAFETY: both strings are NUL-terminated and outlive the calls.
        let ret = unsafe {
            libc::sethostname(self.hostname.as_ptr(), self.hostname.as_bytes().len())
        };
        Errno::result(ret)?;
        let ret = unsafe {
            libc::setdomainname(self.domainname.as_ptr(), self.domainname.as_bytes().len())
        };
        Errno::result(ret).map(drop)
    }
}

/// Make every mount in the new namespace private so nothing done inside
/// propagates back to the host.
///
/// Child side, first thing after entering the mount namespace.
pub fn harden_mount_propagation() -> nix::Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_namespaces_always_present() {
        let flags = NamespaceSet::new(false).clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn network_namespace_is_optional() {
        let set = NamespaceSet::new(true);
        assert!(set.clone_flags().contains(CloneFlags::CLONE_NEWNET));
        assert!(set.names().contains(&"network"));
    }

    #[test]
    fn uts_identity_rejects_nul() {
        assert!(UtsIdentity::new("box", "box").is_ok());
        assert!(UtsIdentity::new("bo\0x", "box").is_err());
    }
}
