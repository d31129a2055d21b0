//! Host memory sampling.

/// A point-in-time memory reading in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub total_mb: u64,
    pub used_mb: u64,
}

/// Source of host memory readings.
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> MemoryReading;
}

/// Samples the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemorySampler for SystemMemory {
    fn sample(&self) -> MemoryReading {
        let (total, available) = get_memory_info();
        MemoryReading {
            total_mb: total / BYTES_PER_MB,
            used_mb: total.saturating_sub(available) / BYTES_PER_MB,
        }
    }
}

/// Fixed reading, for tests and hosts where sampling is unwanted.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub MemoryReading);

impl FixedMemory {
    pub fn new(total_mb: u64, used_mb: u64) -> Self {
        Self(MemoryReading { total_mb, used_mb })
    }
}

impl MemorySampler for FixedMemory {
    fn sample(&self) -> MemoryReading {
        self.0
    }
}

const BYTES_PER_MB: u64 = 1024 * 1024;
const FALLBACK_TOTAL: u64 = 16 * 1024 * BYTES_PER_MB;
const FALLBACK_AVAILABLE: u64 = 8 * 1024 * BYTES_PER_MB;

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let (total, available) = parse_meminfo(&meminfo);
        if total > 0 {
            return (total, available.min(total));
        }
    }

    sysconf_memory_info().unwrap_or((FALLBACK_TOTAL, FALLBACK_AVAILABLE))
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    sysconf_memory_info().unwrap_or((FALLBACK_TOTAL, FALLBACK_AVAILABLE))
}

#[cfg(unix)]
fn sysconf_memory_info() -> Option<(u64, u64)> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

    if page_size <= 0 || total_pages <= 0 {
        return None;
    }

    let total = page_size as u64 * total_pages as u64;

    #[cfg(target_os = "linux")]
    let available = {
        let avail_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
        if avail_pages > 0 {
            page_size as u64 * avail_pages as u64
        } else {
            total
        }
    };

    // No portable free-page count; assume half in use.
    #[cfg(not(target_os = "linux"))]
    let available = total / 2;

    Some((total, available))
}

#[cfg(not(unix))]
fn sysconf_memory_info() -> Option<(u64, u64)> {
    None
}

/// Parse `/proc/meminfo` into `(total, available)` bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total: u64 = 0;
    let mut available: u64 = 0;
    let mut free: u64 = 0;
    let mut buffers: u64 = 0;
    let mut cached: u64 = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(raw)) = (parts.next(), parts.next()) else {
            continue;
        };
        const KB_TO_BYTES: u64 = 1024;
        let value = raw.parse::<u64>().unwrap_or(0) * KB_TO_BYTES;
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}
