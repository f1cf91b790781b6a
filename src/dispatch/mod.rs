//! Host capability profile, detected once per process.

pub mod device_profile;

pub use device_profile::{request_tile_permission, ComputeEngine, IsaCaps, IsaLevel};

use std::sync::OnceLock;

use crate::config::KernelConfig;

static CONFIG: OnceLock<KernelConfig> = OnceLock::new();
static HOST_CAPS: OnceLock<IsaCaps> = OnceLock::new();

/// Environment configuration (read once, cached for process lifetime).
pub fn kernel_config() -> &'static KernelConfig {
    CONFIG.get_or_init(KernelConfig::from_env)
}

/// Host capabilities after applying `BRGEMM_MAX_ISA`.
pub fn host_caps() -> IsaCaps {
    *HOST_CAPS.get_or_init(|| {
        let detected = IsaCaps::detect();
        match kernel_config().max_isa {
            Some(level) if detected.level().map_or(false, |l| l > level) => {
                log::warn!(
                    "capping detected ISA {:?} to {:?}",
                    detected.level(),
                    level
                );
                detected.capped(level)
            }
            _ => detected,
        }
    })
}

/// Best engine the host can run.
pub fn host_engine() -> Option<ComputeEngine> {
    match host_caps().level()? {
        IsaLevel::Amx => Some(ComputeEngine::Amx),
        IsaLevel::Avx512 => Some(ComputeEngine::Avx512),
        IsaLevel::Avx2 => Some(ComputeEngine::Avx2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_caps_stable() {
        assert_eq!(host_caps(), host_caps());
        if let Some(engine) = host_engine() {
            assert!(host_caps().supports_engine(engine));
        }
    }
}
