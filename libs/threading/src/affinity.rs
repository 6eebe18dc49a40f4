//! CPU topology ranking and thread binding.
//!
//! Cores are sorted by `cpuinfo_max_freq` in descending order; when two
//! cores report the same frequency the micro-architecture class from
//! `/proc/cpuinfo` breaks the tie (big.LITTLE parts often share a
//! frequency ceiling). The resulting order drives three binding policies:
//! pin to the fastest tier, pin to the middle tier (leaving the fastest
//! cores for other processes), or leave scheduling to the OS.

use std::fs;

use tracing::{debug, warn};

/// ARM micro-architecture classes, ordered weakest to strongest so the
/// enum's derived ordering doubles as the tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum MicroArch {
    Unknown,
    CortexA5,
    CortexA7,
    CortexA8,
    CortexA9,
    CortexA12,
    CortexA15,
    CortexA17,
    CortexA32,
    CortexA34,
    CortexA35,
    CortexA53,
    CortexA55,
    CortexA57,
    CortexA65,
    CortexA72,
    CortexA73,
    CortexA75,
    CortexA76,
    CortexA77,
    CortexA78,
    CortexX1,
}

/// Map the `/proc/cpuinfo` "CPU part" field to a micro-architecture class.
fn arch_for_part(part: u32) -> MicroArch {
    use MicroArch::*;
    match part {
        // Qualcomm Kryo rebrands of ARM reference cores
        0x800 => CortexA73,
        0x801 => CortexA53,
        0x802 => CortexA75,
        0x803 => CortexA55,
        0x804 => CortexA76,
        0x805 => CortexA55,
        0xC05 => CortexA5,
        0xC07 => CortexA7,
        0xC08 => CortexA8,
        0xC09 => CortexA9,
        0xC0C | 0xC0D => CortexA12,
        0xC0E => CortexA17,
        0xC0F => CortexA15,
        0xD01 => CortexA32,
        0xD02 => CortexA34,
        0xD03 => CortexA53,
        0xD04 => CortexA35,
        0xD05 => CortexA55,
        0xD06 => CortexA65,
        0xD07 => CortexA57,
        0xD08 => CortexA72,
        0xD09 => CortexA73,
        0xD0A => CortexA75,
        0xD0B => CortexA76,
        0xD0D => CortexA77,
        0xD0E => CortexA76,
        0xD40 => CortexA76,
        0xD41 => CortexA78,
        0xD43 => CortexA65,
        0xD44 => CortexX1,
        _ => Unknown,
    }
}

/// One logical CPU's ranking inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub core_id: usize,
    /// kHz from sysfs, -1 when unreadable.
    pub max_freq: i64,
    pub arch: MicroArch,
}

/// Thread-to-core binding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindPolicy {
    /// Pin workers to the fastest cores.
    #[default]
    Higher,
    /// Pin workers past the fastest tier, leaving it free.
    Middle,
    /// No pinning, OS scheduler decides.
    NoBind,
}

/// Sorted core ranking plus the size of the fastest tier.
#[derive(Debug, Clone)]
pub struct CoreAffinity {
    sorted_ids: Vec<usize>,
    higher_num: usize,
}

impl CoreAffinity {
    /// Probe the host. Always succeeds; unreadable sysfs/cpuinfo entries
    /// degrade to an unranked ordering.
    pub fn detect() -> Self {
        let core_num = num_cpus::get();
        let archs = read_cpu_parts(core_num);
        let cores = (0..core_num)
            .map(|core_id| CpuInfo {
                core_id,
                max_freq: read_max_frequency(core_id),
                arch: archs.get(core_id).copied().unwrap_or(MicroArch::Unknown),
            })
            .collect();
        Self::from_cores(cores)
    }

    /// Rank an explicit core list (test seam).
    pub fn from_cores(mut cores: Vec<CpuInfo>) -> Self {
        // Descending by frequency, micro-arch class breaks ties.
        cores.sort_by(|a, b| {
            b.max_freq
                .cmp(&a.max_freq)
                .then_with(|| b.arch.cmp(&a.arch))
                .then_with(|| a.core_id.cmp(&b.core_id))
        });
        let top_freq = cores.first().map(|c| c.max_freq).unwrap_or(-1);
        let higher_num = cores.iter().filter(|c| c.max_freq == top_freq).count();
        for info in &cores {
            debug!(core = info.core_id, freq = info.max_freq, arch = ?info.arch, "ranked core");
        }
        Self {
            sorted_ids: cores.into_iter().map(|c| c.core_id).collect(),
            higher_num,
        }
    }

    pub fn core_count(&self) -> usize {
        self.sorted_ids.len()
    }

    /// Number of cores in the fastest frequency tier.
    pub fn higher_tier_len(&self) -> usize {
        self.higher_num
    }

    /// One core id per worker according to `policy`; `None` for
    /// [`BindPolicy::NoBind`] or an empty topology.
    pub fn plan(&self, workers: usize, policy: BindPolicy) -> Option<Vec<usize>> {
        if self.sorted_ids.is_empty() {
            return None;
        }
        let n = self.sorted_ids.len();
        match policy {
            BindPolicy::NoBind => None,
            BindPolicy::Higher => Some((0..workers).map(|i| self.sorted_ids[i % n]).collect()),
            BindPolicy::Middle => Some(
                (0..workers)
                    .map(|i| self.sorted_ids[(i + self.higher_num) % n])
                    .collect(),
            ),
        }
    }
}

fn read_max_frequency(core_id: usize) -> i64 {
    let candidates = [
        format!("/sys/devices/system/cpu/cpufreq/stats/cpu{core_id}/time_in_state"),
        format!("/sys/devices/system/cpu/cpu{core_id}/cpufreq/stats/time_in_state"),
        format!("/sys/devices/system/cpu/cpu{core_id}/cpufreq/cpuinfo_max_freq"),
    ];
    for path in &candidates {
        if let Ok(contents) = fs::read_to_string(path) {
            let max = contents
                .split_whitespace()
                .filter_map(|tok| tok.parse::<i64>().ok())
                .max();
            if let Some(freq) = max {
                return freq;
            }
        }
    }
    -1
}

fn read_cpu_parts(core_num: usize) -> Vec<MicroArch> {
    let mut archs = Vec::with_capacity(core_num);
    let Ok(contents) = fs::read_to_string("/proc/cpuinfo") else {
        return vec![MicroArch::Unknown; core_num];
    };
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("CPU part") {
            let part = value
                .trim_start_matches([':', ' ', '\t'])
                .trim()
                .trim_start_matches("0x");
            match u32::from_str_radix(part, 16) {
                Ok(part) => archs.push(arch_for_part(part)),
                Err(_) => archs.push(MicroArch::Unknown),
            }
        }
    }
    // x86 hosts have no "CPU part" lines at all.
    archs.resize(core_num, MicroArch::Unknown);
    archs
}

/// Pin the calling thread to `core_id`. Returns false (after a warning)
/// when the OS refuses; callers continue unbound.
pub fn bind_current_thread(core_id: usize) -> bool {
    #[cfg(target_os = "linux")]
    {
        let ok = unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core_id, &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
        };
        if ok {
            debug!(core = core_id, "bound worker thread");
        } else {
            warn!(core = core_id, "core binding failed, continuing unbound");
        }
        ok
    }
    #[cfg(not(target_os = "linux"))]
    {
        warn!(core = core_id, "core binding unsupported on this platform");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(core_id: usize, max_freq: i64, arch: MicroArch) -> CpuInfo {
        CpuInfo { core_id, max_freq, arch }
    }

    #[test]
    fn test_sort_descending_by_frequency() {
        let affinity = CoreAffinity::from_cores(vec![
            cpu(0, 1_800_000, MicroArch::CortexA55),
            cpu(1, 2_600_000, MicroArch::CortexA76),
            cpu(2, 2_600_000, MicroArch::CortexA76),
            cpu(3, 1_800_000, MicroArch::CortexA55),
        ]);
        assert_eq!(affinity.plan(4, BindPolicy::Higher).unwrap(), vec![1, 2, 0, 3]);
        assert_eq!(affinity.higher_tier_len(), 2);
    }

    #[test]
    fn test_arch_breaks_frequency_ties() {
        let affinity = CoreAffinity::from_cores(vec![
            cpu(0, 2_000_000, MicroArch::CortexA53),
            cpu(1, 2_000_000, MicroArch::CortexA76),
        ]);
        assert_eq!(affinity.plan(2, BindPolicy::Higher).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_middle_policy_skips_fastest_tier() {
        let affinity = CoreAffinity::from_cores(vec![
            cpu(0, 2_600_000, MicroArch::CortexA76),
            cpu(1, 2_600_000, MicroArch::CortexA76),
            cpu(2, 1_800_000, MicroArch::CortexA55),
            cpu(3, 1_800_000, MicroArch::CortexA55),
        ]);
        // Middle tier starts after the two fast cores and wraps.
        assert_eq!(
            affinity.plan(4, BindPolicy::Middle).unwrap(),
            vec![2, 3, 0, 1]
        );
    }

    #[test]
    fn test_no_bind_has_no_plan() {
        let affinity = CoreAffinity::from_cores(vec![cpu(0, 1, MicroArch::Unknown)]);
        assert!(affinity.plan(4, BindPolicy::NoBind).is_none());
    }

    #[test]
    fn test_more_workers_than_cores_wraps() {
        let affinity = CoreAffinity::from_cores(vec![
            cpu(0, 2, MicroArch::Unknown),
            cpu(1, 1, MicroArch::Unknown),
        ]);
        assert_eq!(
            affinity.plan(5, BindPolicy::Higher).unwrap(),
            vec![0, 1, 0, 1, 0]
        );
    }

    #[test]
    fn test_known_cpu_parts() {
        assert_eq!(arch_for_part(0xD03), MicroArch::CortexA53);
        assert_eq!(arch_for_part(0xD44), MicroArch::CortexX1);
        assert_eq!(arch_for_part(0xFFF), MicroArch::Unknown);
    }

    #[test]
    fn test_detect_does_not_panic() {
        let affinity = CoreAffinity::detect();
        assert!(affinity.core_count() > 0);
    }
}
