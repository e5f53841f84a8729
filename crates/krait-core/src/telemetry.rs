//! Process-wide telemetry counters
//!
//! A fixed array of additive counters recording guest behaviors worth
//! knowing about at scale (split locks, AVX use, CAS tearing). Flushed
//! once at shutdown to `<data-dir>/Telemetry/<application>.telem`,
//! keeping one `.1` backup of the previous run.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use once_cell::sync::Lazy;

/// Counter kinds. `NAMES` parallels this enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryType {
    SplitLocks64B = 0,
    SplitAtomics16B,
    VexInstructions,
    EvexInstructions,
    CasTear16,
    CasTear32,
    CasTear64,
    CasTear128,
}

pub const TYPE_COUNT: usize = 8;

static NAMES: [&str; TYPE_COUNT] = [
    "64byte Split Locks",
    "16byte Split atomics",
    "VEX instructions (AVX)",
    "EVEX instructions (AVX512)",
    "16bit CAS Tear",
    "32bit CAS Tear",
    "64bit CAS Tear",
    "128bit CAS Tear",
];

static VALUES: Lazy<[AtomicU64; TYPE_COUNT]> =
    Lazy::new(|| std::array::from_fn(|_| AtomicU64::new(0)));

static DISABLED: AtomicBool = AtomicBool::new(false);

/// Turn the whole subsystem into a no-op.
pub fn disable() {
    DISABLED.store(true, Ordering::Relaxed);
}

/// Bump a counter. Counters only ever grow.
pub fn increment(kind: TelemetryType, amount: u64) {
    if DISABLED.load(Ordering::Relaxed) {
        return;
    }
    VALUES[kind as usize].fetch_add(amount, Ordering::Relaxed);
}

pub fn value(kind: TelemetryType) -> u64 {
    VALUES[kind as usize].load(Ordering::Relaxed)
}

pub fn name(kind: TelemetryType) -> &'static str {
    NAMES[kind as usize]
}

/// Ensure the output directory exists. Failure is logged, not fatal;
/// shutdown will simply fail to write.
pub fn initialize(data_dir: &Path) {
    if DISABLED.load(Ordering::Relaxed) {
        return;
    }
    let dir = data_dir.join("Telemetry");
    if let Err(err) = fs::create_dir_all(&dir) {
        log::info!("couldn't create telemetry folder {}: {}", dir.display(), err);
    }
}

/// Write `<application>.telem`, retaining one backup of a prior file.
pub fn shutdown(data_dir: &Path, application: &str) -> io::Result<()> {
    if DISABLED.load(Ordering::Relaxed) {
        return Ok(());
    }
    let path = data_dir.join("Telemetry").join(format!("{}.telem", application));
    if path.exists() {
        let mut backup = path.clone().into_os_string();
        backup.push(".1");
        fs::copy(&path, backup)?;
    }

    let mut file = fs::File::create(&path)?;
    for (name, value) in NAMES.iter().zip(VALUES.iter()) {
        writeln!(file, "{}: {}", name, value.load(Ordering::Relaxed))?;
    }
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotonic() {
        let before = value(TelemetryType::CasTear32);
        increment(TelemetryType::CasTear32, 1);
        increment(TelemetryType::CasTear32, 2);
        let after = value(TelemetryType::CasTear32);
        assert!(after >= before + 3);
    }

    #[test]
    fn test_names_parallel_kinds() {
        assert_eq!(name(TelemetryType::SplitLocks64B), "64byte Split Locks");
        assert_eq!(name(TelemetryType::CasTear128), "128bit CAS Tear");
        assert_eq!(NAMES.len(), TYPE_COUNT);
    }

    #[test]
    fn test_shutdown_writes_file_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        initialize(dir.path());
        increment(TelemetryType::SplitLocks64B, 1);

        shutdown(dir.path(), "guestapp").unwrap();
        let telem = dir.path().join("Telemetry").join("guestapp.telem");
        let text = std::fs::read_to_string(&telem).unwrap();
        assert!(text.lines().count() == TYPE_COUNT);
        assert!(text.starts_with("64byte Split Locks: "));
        assert!(text.ends_with('\n'));

        // A second shutdown preserves the previous file as `.1`.
        shutdown(dir.path(), "guestapp").unwrap();
        let backup = dir.path().join("Telemetry").join("guestapp.telem.1");
        assert!(backup.exists());
    }
}
