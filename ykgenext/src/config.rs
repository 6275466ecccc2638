//! Configuration of the generating extension builder.

use crate::worklist::OFFSET;
use std::{env, error::Error};

/// Configure how a generating extension is built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GenExtConfig {
    /// How far above the highest original pc the first specialized pc lies.
    offset: usize,
    /// If false, no specialization is performed: every reachable instruction gets only its
    /// generic body.
    enabled: bool,
}

impl Default for GenExtConfig {
    fn default() -> Self {
        Self {
            offset: OFFSET,
            enabled: true,
        }
    }
}

impl GenExtConfig {
    /// Create a configuration from the environment. `YKD_GENEXT_OFFSET=<n>` overrides the
    /// specialized pc offset; `YKD_GENEXT=0` disables specialization.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut c = Self::default();
        if let Ok(x) = env::var("YKD_GENEXT_OFFSET") {
            let offset = x
                .parse::<usize>()
                .map_err(|e| format!("Invalid YKD_GENEXT_OFFSET value '{x}': {e}"))?;
            if offset == 0 {
                return Err("YKD_GENEXT_OFFSET must be greater than 0".into());
            }
            c.offset = offset;
        }
        match env::var("YKD_GENEXT").as_deref() {
            Ok("0") => c.enabled = false,
            Ok("1") | Err(_) => (),
            Ok(x) => return Err(format!("Invalid YKD_GENEXT value '{x}': must be 0 or 1").into()),
        }
        Ok(c)
    }

    /// Change this configuration's specialized pc offset.
    ///
    /// # Panics
    ///
    /// If `offset` is zero: specialized pcs would then collide with the highest original pc.
    pub fn offset(mut self, offset: usize) -> Self {
        assert!(offset > 0);
        self.offset = offset;
        self
    }

    /// Enable or disable specialization.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn get_offset(&self) -> usize {
        self.offset
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
