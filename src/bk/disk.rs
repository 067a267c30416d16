use crate::bk::model::DiskUsageSample;
use anyhow::Context as _;
use chrono::Local;
use std::path::Path;

pub trait DiskProbe: Send + Sync {
    fn sample(&self, path: &Path) -> anyhow::Result<DiskUsageSample>;
}

/// `statvfs(2)` on the filesystem holding `path`, computed the way `df` reports it.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    fn sample(&self, path: &Path) -> anyhow::Result<DiskUsageSample> {
        let st = nix::sys::statvfs::statvfs(path).with_context(|| format!("statvfs {}", path.display()))?;
        let frsize = st.fragment_size() as u64;
        let total = st.blocks() as u64 * frsize;
        let free_root = st.blocks_free() as u64 * frsize;
        let avail = st.blocks_available() as u64 * frsize;
        Ok(usage_sample(total, free_root, avail))
    }
}

/// Used percent excludes root-reserved blocks from the denominator, like `df`.
pub fn usage_sample(total: u64, free_root: u64, avail: u64) -> DiskUsageSample {
    let used = total.saturating_sub(free_root);
    let denom = used + avail;
    let used_percent = if denom == 0 {
        0.0
    } else {
        used as f64 * 100.0 / denom as f64
    };
    DiskUsageSample {
        timestamp: Local::now(),
        used_percent,
        free_bytes: avail,
        total_bytes: total,
    }
}

pub fn fmt_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit + 1 < UNITS.len() {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n}B")
    } else {
        format!("{v:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns scripted usage percents in order, repeating the last one.
    #[derive(Debug)]
    pub struct ScriptedDisk {
        percents: Mutex<VecDeque<f64>>,
        last: Mutex<f64>,
        pub fail: bool,
    }

    impl ScriptedDisk {
        pub fn new(percents: &[f64]) -> Self {
            Self {
                percents: Mutex::new(percents.iter().copied().collect()),
                last: Mutex::new(percents.last().copied().unwrap_or(0.0)),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(&[])
            }
        }
    }

    impl DiskProbe for ScriptedDisk {
        fn sample(&self, _path: &Path) -> anyhow::Result<DiskUsageSample> {
            anyhow::ensure!(!self.fail, "statvfs: permission denied");
            let mut last = self.last.lock().unwrap();
            if let Some(p) = self.percents.lock().unwrap().pop_front() {
                *last = p;
            }
            let total = 100 * 1024 * 1024 * 1024_u64;
            Ok(DiskUsageSample {
                timestamp: Local::now(),
                used_percent: *last,
                free_bytes: (total as f64 * (100.0 - *last) / 100.0) as u64,
                total_bytes: total,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_ignores_reserved_blocks() {
        // 100 total, 10 free for root of which 5 usable: used 90 / (90 + 5)
        let s = usage_sample(100, 10, 5);
        assert!((s.used_percent - 94.736).abs() < 0.01);
        assert_eq!(s.free_bytes, 5);
        assert_eq!(usage_sample(0, 0, 0).used_percent, 0.0);
    }

    #[test]
    fn samples_a_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let s = StatvfsProbe.sample(dir.path()).unwrap();
        assert!(s.total_bytes > 0);
        assert!((0.0..=100.0).contains(&s.used_percent));
    }

    #[test]
    fn human_sizes() {
        assert_eq!(fmt_bytes(512), "512B");
        assert_eq!(fmt_bytes(1536), "1.5KiB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024 * 1024), "3.0GiB");
    }
}
