//! perf-style JIT symbol export
//!
//! When enabled, every installed translation gets one line in
//! `/tmp/perf-<pid>.map` so host-side profilers can attribute samples to
//! guest code. Lines are flushed per write; the handle lives for the
//! compiler thread's lifetime and is closed on drop.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Append-only writer for the perf map file.
pub struct JitSymbols {
    file: Option<File>,
}

impl JitSymbols {
    /// Open the conventional `/tmp/perf-<pid>.map`. A failed open is
    /// logged and symbol export silently disabled.
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            return JitSymbols { file: None };
        }
        let path = format!("/tmp/perf-{}.map", std::process::id());
        Self::with_path(Path::new(&path))
    }

    /// Open an explicit path (tests, alternate conventions).
    pub fn with_path(path: &Path) -> Self {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => JitSymbols { file: Some(file) },
            Err(err) => {
                log::warn!("couldn't open perf map {}: {}", path.display(), err);
                JitSymbols { file: None }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Register a translation of guest code at `guest_rip`.
    pub fn register(&mut self, host_addr: u64, guest_rip: u64, host_len: u32) {
        if let Some(file) = &mut self.file {
            let line = format!("{:x} {:x} JIT_0x{:x}\n", host_addr, host_len, guest_rip);
            if let Err(err) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                log::warn!("perf map write failed: {}", err);
            }
        }
    }

    /// Register a host region under a runtime-provided name
    /// (dispatcher stubs, trampolines).
    pub fn register_named(&mut self, host_addr: u64, host_len: u32, name: &str) {
        if let Some(file) = &mut self.file {
            let line = format!("{:x} {:x} {}\n", host_addr, host_len, name);
            if let Err(err) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                log::warn!("perf map write failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_writer_is_inert() {
        let mut symbols = JitSymbols::new(false);
        assert!(!symbols.is_enabled());
        symbols.register(0x1000, 0x40_0000, 64);
    }

    #[test]
    fn test_lines_match_perf_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf-test.map");
        let mut symbols = JitSymbols::with_path(&path);
        assert!(symbols.is_enabled());

        symbols.register(0xFFFF_8000, 0x40_1000, 128);
        symbols.register_named(0xFFFF_9000, 256, "Dispatcher");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ffff8000 80 JIT_0x401000");
        assert_eq!(lines[1], "ffff9000 100 Dispatcher");
    }

    #[test]
    fn test_appends_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf-append.map");
        {
            let mut symbols = JitSymbols::with_path(&path);
            symbols.register(0x1000, 0x1, 16);
        }
        {
            let mut symbols = JitSymbols::with_path(&path);
            symbols.register(0x2000, 0x2, 16);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
