use anyhow::Context as _;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Exclusive, non-blocking advisory lock on `<state_dir>/<entry>.lock`.
///
/// The lock lives as long as the guard; the kernel drops it if the process dies, so a stale
/// file never wedges later cycles. The holder's pid is written into the file for operators.
#[derive(Debug)]
pub struct CycleGuard {
    _lock: Flock<File>,
    path: PathBuf,
}

impl CycleGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
pub enum Acquire {
    Acquired(CycleGuard),
    /// Someone else is mid-cycle. `holder` is their pid if it could be read.
    Held { holder: Option<u32> },
}

pub fn lock_path(state_dir: &Path, entry: &str) -> PathBuf {
    state_dir.join(format!("{entry}.lock"))
}

pub fn try_acquire(state_dir: &Path, entry: &str) -> anyhow::Result<Acquire> {
    fs::create_dir_all(state_dir).with_context(|| format!("create state dir {}", state_dir.display()))?;
    let path = lock_path(state_dir, entry);
    // No truncate here: the current holder's pid must survive a losing open.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(mut lock) => {
            lock.set_len(0)?;
            lock.seek(SeekFrom::Start(0))?;
            writeln!(lock, "{}", std::process::id())?;
            lock.flush()?;
            Ok(Acquire::Acquired(CycleGuard { _lock: lock, path }))
        }
        Err((_, Errno::EWOULDBLOCK)) => Ok(Acquire::Held {
            holder: read_holder(&path),
        }),
        Err((_, errno)) => Err(anyhow::anyhow!("flock {} failed: {errno}", path.display())),
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_sees_holder_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let first = match try_acquire(dir.path(), "health").unwrap() {
            Acquire::Acquired(g) => g,
            Acquire::Held { .. } => panic!("fresh lock should be free"),
        };
        assert!(first.path().ends_with("health.lock"));

        match try_acquire(dir.path(), "health").unwrap() {
            Acquire::Held { holder } => assert_eq!(holder, Some(std::process::id())),
            Acquire::Acquired(_) => panic!("lock must be exclusive"),
        }

        // Independent entry points do not contend.
        assert!(matches!(try_acquire(dir.path(), "maintenance").unwrap(), Acquire::Acquired(_)));

        drop(first);
        assert!(matches!(try_acquire(dir.path(), "health").unwrap(), Acquire::Acquired(_)));
    }
}
