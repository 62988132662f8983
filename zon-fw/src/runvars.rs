use crate::helpers::ToMapName;
use anyhow::anyhow;
use aya::{
    maps::{Array, MapData},
    Ebpf,
};
use log::LevelFilter;
use zon_fw_common::{
    maps,
    runvars::{FUSED_VERSION_IDX, LOG_LEVEL_IDX, NR_MODULES_IDX},
    VERSION,
};

/// Runtime variables read by the parser.
pub struct RunVars<'a> {
    rvmap: Array<&'a mut MapData, u64>,
}

impl ToMapName for RunVars<'_> {
    fn map_name() -> &'static str {
        maps::RUNVAR
    }
}

impl<'a> RunVars<'a> {
    pub fn new(ebpf: &'a mut Ebpf) -> Result<Self, anyhow::Error> {
        let map = ebpf
            .map_mut(RunVars::map_name())
            .ok_or(anyhow!("Can't find map {}", RunVars::map_name()))?;
        let rvmap: Array<_, u64> = Array::try_from(map)?;
        Ok(Self { rvmap })
    }

    pub fn set(&mut self, rv_idx: u32, value: u64) -> bool {
        match self.rvmap.set(rv_idx, value, 0) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to set {} to {}, {}", rv_idx, value, e);
                false
            }
        }
    }

    pub fn get(&self, rv_idx: u32, def_val: u64) -> u64 {
        match self.rvmap.get(&rv_idx, 0) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to get {}, {}", rv_idx, e);
                def_val
            }
        }
    }

    pub fn set_defaults(&mut self) {
        self.set(FUSED_VERSION_IDX, VERSION as u64);
        self.set_logging_level(log::max_level());
    }

    fn set_logging_level(&mut self, level: LevelFilter) {
        if !self.set(LOG_LEVEL_IDX, level as u64) {
            log::warn!("Failed to set log level to {}", level);
        }
    }

    /// Publishes the number of modules currently in the pipeline.
    pub fn set_nr_modules(&mut self, count: usize) -> bool {
        self.set(NR_MODULES_IDX, count as u64)
    }

    pub fn version(&self) -> u64 {
        self.get(FUSED_VERSION_IDX, 0)
    }
}
