//! Per-peer lockfile, preventing two feeder processes from sharing a Tape.
//!
//! Protocol (create-temp-then-hardlink-then-check-nlink, not `flock` — this
//! is meant to survive NFS the way the original implementation's protocol
//! was designed to, the same tradeoff the teacher makes explicitly for its
//! own advisory file locking): write our pid into a uniquely-named temp
//! file, hard-link it onto the target lock path, then check the temp file's
//! link count reads back as 2. A link count of 1 means someone else won the
//! race and we back off; a stale lock (pid no longer alive) is cleared and
//! retried once.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct Lockfile {
    path: PathBuf,
    peer: String,
}

impl Lockfile {
    /// Attempts to acquire the lock at `dir/<peer>.lock`. On success the
    /// lockfile now contains our pid and the handle's `Drop` releases it.
    pub fn acquire(dir: &Path, peer: &str) -> Result<Self> {
        let path = dir.join(format!("{peer}.lock"));
        let pid = std::process::id();

        if let Some(existing_pid) = read_lock_pid(&path) {
            if pid_alive(existing_pid) {
                return Err(Error::Locked {
                    peer: peer.to_string(),
                    pid: existing_pid,
                });
            }
            // stale: owner is gone, clear it and retry once.
            let _ = fs::remove_file(&path);
        }

        let tmp_path = dir.join(format!(".{peer}.lock.{pid}"));
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            write!(tmp, "{pid}\n")?;
            tmp.sync_all()?;
        }

        let link_result = fs::hard_link(&tmp_path, &path);
        let nlink = fs::metadata(&tmp_path).map(|m| m.nlink()).unwrap_or(1);
        let _ = fs::remove_file(&tmp_path);

        match link_result {
            Ok(()) if nlink >= 2 => Ok(Self {
                path,
                peer: peer.to_string(),
            }),
            _ => {
                let holder = read_lock_pid(&path).unwrap_or(-1);
                Err(Error::Locked {
                    peer: peer.to_string(),
                    pid: holder,
                })
            }
        }
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if let Some(pid) = read_lock_pid(&self.path) {
            if pid == std::process::id() as i32 {
                let _ = fs::remove_file(&self.path);
                tracing::debug!(peer = %self.peer, "released lockfile");
            }
        }
    }
}

fn read_lock_pid(path: &Path) -> Option<i32> {
    let mut contents = String::new();
    fs::File::open(path)
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;
    contents.trim().parse().ok()
}

fn pid_alive(pid: i32) -> bool {
    // kill(pid, 0) checks for existence/permission without sending a signal.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = Lockfile::acquire(dir.path(), "peerA").unwrap();
        assert!(Lockfile::acquire(dir.path(), "peerA").is_err());
        drop(lock);
        assert!(Lockfile::acquire(dir.path(), "peerA").is_ok());
    }

    #[test]
    fn stale_lock_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerB.lock");
        // a pid almost certainly not alive
        fs::write(&path, "999999999\n").unwrap();
        assert!(Lockfile::acquire(dir.path(), "peerB").is_ok());
    }
}
