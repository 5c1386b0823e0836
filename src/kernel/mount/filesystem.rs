/// Child-side assembly of the sandbox root
///
/// Everything is converted to C strings in the parent by [`PreparedRoot::prepare`];
/// the child only issues syscalls, in this order:
///
/// 1. private tmpfs over the root directory
/// 2. plan entries (binds, tmpfs, then proc)
/// 3. masked paths
/// 4. `pivot_root`, detach and remove the old root
/// 5. remount `/` read-only, enter the working directory
use crate::config::types::{Result, SandboxError};
use crate::kernel::mount::plan::{MountKind, MountPlan};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{stat, Mode, SFlag};
use nix::unistd::{chdir, close, mkdir, pivot_root};
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const OLD_ROOT_NAME: &str = ".old_root";
const OLD_ROOT: &str = "/.old_root";

/// One mount ready to be issued by the child.
#[derive(Debug)]
struct PreparedMount {
    source: CString,
    target: CString,
    fstype: Option<CString>,
    flags: MsFlags,
    data: Option<CString>,
    /// Second pass needed to make a bind read-only
    remount_readonly: bool,
    /// Directories to create, outermost first
    dirs: Vec<CString>,
    /// Create the target as an empty file rather than a directory
    target_is_file: bool,
}

/// A mount plan, masks and working directory resolved against a root.
#[derive(Debug)]
pub struct PreparedRoot {
    root: CString,
    old_root: CString,
    mounts: Vec<PreparedMount>,
    masks: Vec<CString>,
    work_dir: CString,
}

impl PreparedRoot {
    pub fn prepare(
        root: &Path,
        plan: &MountPlan,
        masks: &[PathBuf],
        work_dir: &Path,
    ) -> Result<Self> {
        let mut mounts = Vec::with_capacity(plan.entries().len());

        for entry in plan.entries() {
            let target = root.join(&entry.destination);
            let (fstype, flags) = match entry.kind {
                MountKind::Bind => (None, MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_NOSUID),
                MountKind::Tmpfs => {
                    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
                    if entry.readonly {
                        flags |= MsFlags::MS_RDONLY;
                    }
                    (Some(cstring("tmpfs")?), flags)
                }
                MountKind::Proc => {
                    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
                    if entry.readonly {
                        flags |= MsFlags::MS_RDONLY;
                    }
                    (Some(cstring("proc")?), flags)
                }
            };

            let target_is_file = entry.kind == MountKind::Bind && !entry.source.is_dir();
            let dir_chain = if target_is_file {
                target.parent().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf())
            } else {
                target.clone()
            };

            mounts.push(PreparedMount {
                source: path_cstring(&entry.source)?,
                target: path_cstring(&target)?,
                fstype,
                flags,
                data: entry.options.as_deref().map(cstring).transpose()?,
                remount_readonly: entry.kind == MountKind::Bind && entry.readonly,
                dirs: ancestors_within(root, &dir_chain)?,
                target_is_file,
            });
            log::debug!(
                "Prepared {:?} mount {} -> {} (readonly={})",
                entry.kind,
                entry.source.display(),
                target.display(),
                entry.readonly
            );
        }

        let masks = masks
            .iter()
            .map(|mask| path_cstring(&root.join(strip_root(mask))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root: path_cstring(root)?,
            old_root: path_cstring(&root.join(OLD_ROOT_NAME))?,
            mounts,
            masks,
            work_dir: path_cstring(work_dir)?,
        })
    }

    /// Build the root and pivot into it. Child side.
    pub fn enter(&self) -> nix::Result<()> {
        mount(
            Some("tmpfs"),
            self.root.as_c_str(),
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=755"),
        )?;

        for m in &self.mounts {
            self.apply_mount(m)?;
        }

        for mask in &self.masks {
            mask_path(mask)?;
        }

        self.pivot()?;
        chdir(self.work_dir.as_c_str())
    }

    fn apply_mount(&self, m: &PreparedMount) -> nix::Result<()> {
        for dir in &m.dirs {
            make_dir(dir)?;
        }
        if m.target_is_file {
            make_file(&m.target)?;
        }

        mount(
            Some(m.source.as_c_str()),
            m.target.as_c_str(),
            m.fstype.as_deref(),
            m.flags,
            m.data.as_deref(),
        )?;

        if m.remount_readonly {
            mount(
                None::<&CStr>,
                m.target.as_c_str(),
                None::<&CStr>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID,
                None::<&CStr>,
            )?;
        }
        Ok(())
    }

    fn pivot(&self) -> nix::Result<()> {
        make_dir(&self.old_root)?;
        pivot_root(self.root.as_c_str(), self.old_root.as_c_str())?;
        chdir("/")?;
        umount2(OLD_ROOT, MntFlags::MNT_DETACH)?;
        nix::unistd::unlinkat(None, OLD_ROOT, nix::unistd::UnlinkatFlags::RemoveDir)?;
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV,
            None::<&str>,
        )
    }
}

/// Hide `path`: an empty read-only tmpfs over directories, `/dev/null` over
/// anything else. Absent paths are left alone.
fn mask_path(path: &CStr) -> nix::Result<()> {
    let st = match stat(path) {
        Ok(st) => st,
        Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => return Ok(()),
        Err(e) => return Err(e),
    };

    if SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits()) == SFlag::S_IFDIR {
        mount(
            Some("tmpfs"),
            path,
            Some("tmpfs"),
            MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
    } else {
        mount(Some("/dev/null"), path, None::<&str>, MsFlags::MS_BIND, None::<&str>)
    }
}

fn make_dir(path: &CStr) -> nix::Result<()> {
    match mkdir(path, Mode::from_bits_truncate(0o755)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(e),
    }
}

fn make_file(path: &CStr) -> nix::Result<()> {
    let fd = open(
        path,
        OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o644),
    )?;
    close(fd)
}

/// Every directory from just below `root` down to `dir`, outermost first.
fn ancestors_within(root: &Path, dir: &Path) -> Result<Vec<CString>> {
    let mut chain: Vec<&Path> = dir
        .ancestors()
        .take_while(|p| p.starts_with(root) && *p != root)
        .collect();
    chain.reverse();
    chain.into_iter().map(path_cstring).collect()
}

fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

fn cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| SandboxError::Mount(format!("'{}' contains NUL byte", value)))
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SandboxError::Mount(format!("path {} contains NUL byte", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mount::plan::MountPlanBuilder;

    #[test]
    fn ancestors_stop_at_root() {
        let chain = ancestors_within(Path::new("/r"), Path::new("/r/usr/lib/x")).unwrap();
        let chain: Vec<_> = chain.iter().map(|c| c.to_str().unwrap().to_string()).collect();
        assert_eq!(chain, vec!["/r/usr", "/r/usr/lib", "/r/usr/lib/x"]);
    }

    #[test]
    fn file_binds_create_parent_dirs_only() {
        let plan = MountPlanBuilder::new()
            .with_binds(["/dev/null"], false)
            .with_binds(["/tmp"], true)
            .build()
            .unwrap();
        let prepared =
            PreparedRoot::prepare(Path::new("/r"), &plan, &[], Path::new("/work")).unwrap();

        let null = &prepared.mounts[0];
        assert!(null.target_is_file);
        assert!(!null.remount_readonly);
        assert_eq!(null.dirs, vec![CString::new("/r/dev").unwrap()]);

        let tmp = &prepared.mounts[1];
        assert!(!tmp.target_is_file);
        assert!(tmp.remount_readonly);
        assert_eq!(tmp.dirs, vec![CString::new("/r/tmp").unwrap()]);
    }

    #[test]
    fn masks_resolve_inside_root() {
        let prepared = PreparedRoot::prepare(
            Path::new("/r"),
            &MountPlan::default(),
            &[PathBuf::from("/proc/kcore")],
            Path::new("/work"),
        )
        .unwrap();
        assert_eq!(prepared.masks, vec![CString::new("/r/proc/kcore").unwrap()]);
        assert_eq!(prepared.old_root, CString::new("/r/.old_root").unwrap());
    }

    #[test]
    fn proc_mount_is_readonly_unless_requested() {
        let plan = MountPlanBuilder::new().with_proc().build().unwrap();
        let prepared = PreparedRoot::prepare(Path::new("/r"), &plan, &[], Path::new("/")).unwrap();
        assert!(prepared.mounts[0].flags.contains(MsFlags::MS_RDONLY));

        let plan = MountPlanBuilder::new().with_proc_rw().build().unwrap();
        let prepared = PreparedRoot::prepare(Path::new("/r"), &plan, &[], Path::new("/")).unwrap();
        assert!(!prepared.mounts[0].flags.contains(MsFlags::MS_RDONLY));
    }
}
