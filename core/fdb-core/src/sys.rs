//! Thin libc wrappers: advisory file locks and process identity.

use crate::error::{FdbError, FdbResult};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive `flock` held for the lifetime of the value.
///
/// Locks are advisory and cooperative: they serialise appenders to one log
/// file or index file across processes. Readers never take them.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Blocks until an exclusive lock on `path` is held. The file is
    /// created when missing.
    pub fn exclusive(path: &Path) -> FdbResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let fd = file.as_raw_fd();
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if rc != 0 {
                return Err(FdbError::Io {
                    source: std::io::Error::last_os_error(),
                });
            }
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Like `exclusive`, but returns `None` instead of waiting.
    pub fn try_exclusive(path: &Path) -> FdbResult<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let fd = file.as_raw_fd();
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Ok(None);
                }
                return Err(FdbError::Io { source: err });
            }
        }

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle opened in append mode, usable while the lock is held.
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let fd = self.file.as_raw_fd();
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }
    }
}

// ════════════════════════════════════════════
// Process identity
// ════════════════════════════════════════════

/// Real user id of this process.
#[cfg(unix)]
pub fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
pub fn current_uid() -> u32 {
    0
}

/// Host name, truncated to what `gethostname` returns.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            return String::from_utf8_lossy(&buf[..len]).into_owned();
        }
    }
    "localhost".to_string()
}

/// Login name for a uid, falling back to the number.
pub fn user_name(uid: u32) -> String {
    #[cfg(unix)]
    {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; 1024];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == 0 && !result.is_null() && !pwd.pw_name.is_null() {
            let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
            return name.to_string_lossy().into_owned();
        }
    }
    uid.to_string()
}

/// Owner uid of a path.
#[cfg(unix)]
pub fn owner_uid(path: &Path) -> FdbResult<u32> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(path)?.uid())
}

#[cfg(not(unix))]
pub fn owner_uid(path: &Path) -> FdbResult<u32> {
    std::fs::metadata(path)?;
    Ok(0)
}

/// Unique name component: host, pid and a random suffix.
pub fn unique_suffix() -> String {
    format!(
        "{}.{}.{:016x}",
        hostname(),
        std::process::id(),
        rand::random::<u64>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_excludes_second_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("toc");
        let held = FileLock::exclusive(&path).unwrap();
        assert!(path.exists());
        // flock locks belong to the open file description, so a second open
        // in the same process conflicts too
        assert!(FileLock::try_exclusive(&path).unwrap().is_none());
        drop(held);
        assert!(FileLock::try_exclusive(&path).unwrap().is_some());
    }

    #[test]
    fn identity_helpers() {
        assert!(!hostname().is_empty());
        assert!(!user_name(current_uid()).is_empty());
        let a = unique_suffix();
        let b = unique_suffix();
        assert_ne!(a, b);
        assert!(a.contains(&std::process::id().to_string()));
    }

    #[test]
    fn owner_of_fresh_dir_is_us() {
        let dir = tempdir().unwrap();
        assert_eq!(owner_uid(dir.path()).unwrap(), current_uid());
    }
}
