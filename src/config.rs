//! System configuration
//!
//! The parameter descriptor consumed at construction plus the nested
//! component tunables. Everything is plain serde-serializable data;
//! a changed map parameter means rebuilding the system.

use serde::{Deserialize, Serialize};

use crate::fusion::MapState;
use crate::tracker::{IcpConfig, RelocConfig};

/// Camera and depth-stream parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SysDesc {
    pub cols: usize,
    pub rows: usize,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    /// Depth beyond this range is discarded during preprocessing
    pub depth_cutoff: f32,
    /// Raw depth units per metre
    pub depth_scale: f32,
}

impl Default for SysDesc {
    fn default() -> Self {
        Self {
            cols: 640,
            rows: 480,
            fx: 525.0,
            fy: 525.0,
            cx: 319.5,
            cy: 239.5,
            depth_cutoff: 3.0,
            depth_scale: 1000.0,
        }
    }
}

/// Aggregated component configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub map: MapState,
    pub icp: IcpConfig,
    pub reloc: RelocConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let desc = SysDesc::default();
        assert_eq!(desc.cols, 640);
        let config = SystemConfig::default();
        assert!(config.map.validate().is_ok());
        assert!(desc.depth_cutoff <= config.map.depth_max_fusion);
    }
}
