use crate::error::{StoreError, StoreResult};
use std::path::PathBuf;

/// Store construction parameters. Callers load their own config files; this
/// struct is the already-resolved form.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of fixed-size sectors in the RAM pool.
    pub pool_sectors: usize,
    /// Root of the spool directory tree. `None` disables disk spooling,
    /// journaling and emergency flush (constrained-platform profile).
    pub disk_root: Option<PathBuf>,
    /// Pool-usage ratio at which migration starts.
    pub migrate_threshold: f32,
    /// Pool-usage ratio at which migration stops. Hysteresis against
    /// thrashing: must be below `migrate_threshold`.
    pub stop_threshold: f32,
    /// Sectors per migration file for TSD chains.
    pub tsd_migrate_batch: usize,
    /// Sectors per migration file for EVT chains.
    pub evt_migrate_batch: usize,
    /// Free-space floor on the spool filesystem. Migration is skipped while
    /// free bytes are below this.
    pub keep_free_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool_sectors: 512,
            disk_root: None,
            migrate_threshold: 0.80,
            stop_threshold: 0.70,
            tsd_migrate_batch: 6,
            evt_migrate_batch: 3,
            keep_free_bytes: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub(crate) fn validate(&self) -> StoreResult<()> {
        if self.pool_sectors < 2 {
            return Err(StoreError::InvalidParameter);
        }
        if !(0.0..=1.0).contains(&self.migrate_threshold)
            || !(0.0..=1.0).contains(&self.stop_threshold)
            || self.stop_threshold >= self.migrate_threshold
        {
            return Err(StoreError::InvalidParameter);
        }
        if self.tsd_migrate_batch == 0 || self.evt_migrate_batch == 0 {
            return Err(StoreError::InvalidParameter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_hysteresis() {
        let config = StoreConfig {
            migrate_threshold: 0.5,
            stop_threshold: 0.9,
            ..StoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidParameter)
        ));
    }

    #[test]
    fn rejects_degenerate_pool() {
        let config = StoreConfig {
            pool_sectors: 1,
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
