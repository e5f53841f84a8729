//! Translator configuration

/// Tunables for the translation core.
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    /// Guest virtual address space ceiling. The page directory reserves
    /// 8 bytes per 4 KiB guest page, so 64 GiB costs a 128 MiB
    /// reservation (default: 64 GiB).
    pub virtual_mem_size: u64,
    /// L1 hint table bytes; 16 bytes per bucket, must keep the bucket
    /// count a power of two (default: 64 KiB = 4096 buckets).
    pub l1_size: usize,
    /// Block store bytes; each touched guest page consumes a 32 KiB
    /// region, one host-pointer slot per guest byte (default: 128 MiB).
    pub code_size: usize,
    /// Reserved for ahead-of-time IR loading in the surrounding runtime.
    pub aotir_load: bool,
    /// Disable the telemetry counters and their shutdown flush.
    pub disable_telemetry: bool,
    /// Emit `/tmp/perf-<pid>.map` lines for installed translations.
    pub enable_perf_map: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        TranslatorConfig {
            virtual_mem_size: 64 * 1024 * 1024 * 1024,
            l1_size: 64 * 1024,
            code_size: 128 * 1024 * 1024,
            aotir_load: false,
            disable_telemetry: false,
            enable_perf_map: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TranslatorConfig::default();
        assert_eq!(config.virtual_mem_size, 64 << 30);
        assert_eq!(config.code_size, 128 << 20);
        assert!(config.l1_size.is_power_of_two());
        assert!(!config.aotir_load);
    }
}
