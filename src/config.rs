//! Process-level configuration read from the environment.
//!
//! - `BRGEMM_MAX_ISA=avx2|avx512|amx` caps the detected host capabilities.
//! - `BRGEMM_JIT_DUMP=<dir>` writes every generated stream to
//!   `<dir>/brgemm_<hash>.bin` plus an Intel-syntax listing next to it.

use std::path::PathBuf;

use crate::dispatch::IsaLevel;

pub const ENV_MAX_ISA: &str = "BRGEMM_MAX_ISA";
pub const ENV_JIT_DUMP: &str = "BRGEMM_JIT_DUMP";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelConfig {
    pub max_isa: Option<IsaLevel>,
    pub dump_dir: Option<PathBuf>,
}

impl KernelConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_isa = lookup(ENV_MAX_ISA).and_then(|v| {
            let level = IsaLevel::parse(&v);
            if level.is_none() {
                log::warn!("{ENV_MAX_ISA}={v:?} not recognized, ignoring");
            }
            level
        });
        let dump_dir = lookup(ENV_JIT_DUMP)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        KernelConfig { max_isa, dump_dir }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_environment() {
        let cfg = KernelConfig::from_lookup(|_| None);
        assert_eq!(cfg, KernelConfig::default());
    }

    #[test]
    fn test_reads_both_keys() {
        let cfg = KernelConfig::from_lookup(|k| match k {
            ENV_MAX_ISA => Some("avx2".into()),
            ENV_JIT_DUMP => Some("/tmp/jit".into()),
            _ => None,
        });
        assert_eq!(cfg.max_isa, Some(IsaLevel::Avx2));
        assert_eq!(cfg.dump_dir, Some(PathBuf::from("/tmp/jit")));
    }

    #[test]
    fn test_bad_level_is_ignored() {
        let cfg = KernelConfig::from_lookup(|k| (k == ENV_MAX_ISA).then(|| "sse9".to_string()));
        assert_eq!(cfg.max_isa, None);
    }
}
