//! Config manager - runtime-tunable trading settings
//!
//! Settings can be changed from the API while the auto trader runs; readers
//! always get a consistent copy.

use crate::config::{ConfigError, TradingSettings};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

/// Partial update from the UI. Missing fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub profit_target: Option<f64>,
    pub cycle_duration_secs: Option<u64>,
    pub min_price_difference: Option<f64>,
    pub max_concurrent_trades: Option<usize>,
    pub stop_loss: Option<f64>,
    pub position_fraction: Option<f64>,
}

pub struct ConfigManager {
    settings: RwLock<TradingSettings>,
}

impl ConfigManager {
    pub fn new(settings: TradingSettings) -> Self {
        info!(
            "Trading settings: profit target {:.1}x, stop loss {:.1}%, max {} concurrent trades, cycle {}s",
            settings.profit_target,
            settings.stop_loss * 100.0,
            settings.max_concurrent_trades,
            settings.cycle_duration_secs
        );
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Apply a partial update. Returns true if anything changed.
    ///
    /// The update is checked as a whole; on error nothing is applied.
    pub fn update_settings(&self, update: SettingsUpdate) -> Result<bool, ConfigError> {
        let mut settings = self.settings.write();
        let mut next = settings.clone();

        if let Some(target) = update.profit_target {
            next.profit_target = target;
        }
        if let Some(secs) = update.cycle_duration_secs {
            next.cycle_duration_secs = secs.max(1);
        }
        if let Some(diff) = update.min_price_difference {
            next.min_price_difference = diff;
        }
        if let Some(max) = update.max_concurrent_trades {
            next.max_concurrent_trades = max;
        }
        if let Some(stop) = update.stop_loss {
            next.stop_loss = stop;
        }
        if let Some(fraction) = update.position_fraction {
            next.position_fraction = fraction;
        }
        if let Err(e) = next.validate() {
            warn!("Rejected settings update: {}", e);
            return Err(e);
        }

        if next == *settings {
            return Ok(false);
        }
        info!(
            "Updated trading settings: profit target {:.2}x, stop loss {:.2}%, max {} trades, min diff {:.4}%, cycle {}s",
            next.profit_target,
            next.stop_loss * 100.0,
            next.max_concurrent_trades,
            next.min_price_difference * 100.0,
            next.cycle_duration_secs
        );
        *settings = next;
        Ok(true)
    }

    pub fn settings(&self) -> TradingSettings {
        self.settings.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_update() {
        let manager = ConfigManager::new(TradingSettings::default());
        let changed = manager
            .update_settings(SettingsUpdate {
                stop_loss: Some(0.08),
                max_concurrent_trades: Some(5),
                ..Default::default()
            })
            .unwrap();
        assert!(changed);
        let settings = manager.settings();
        assert_eq!(settings.stop_loss, 0.08);
        assert_eq!(settings.max_concurrent_trades, 5);
        assert_eq!(settings.profit_target, 2.0);
    }

    #[test]
    fn test_no_op_update() {
        let manager = ConfigManager::new(TradingSettings::default());
        assert!(!manager.update_settings(SettingsUpdate::default()).unwrap());
        assert!(!manager
            .update_settings(SettingsUpdate {
                profit_target: Some(2.0),
                ..Default::default()
            })
            .unwrap());
    }

    #[test]
    fn test_cycle_duration_floor() {
        let manager = ConfigManager::new(TradingSettings::default());
        manager
            .update_settings(SettingsUpdate {
                cycle_duration_secs: Some(0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(manager.settings().cycle_duration_secs, 1);
    }

    #[test]
    fn test_invalid_update_leaves_settings_untouched() {
        let manager = ConfigManager::new(TradingSettings::default());
        for update in [
            SettingsUpdate {
                profit_target: Some(0.0),
                ..Default::default()
            },
            SettingsUpdate {
                profit_target: Some(-1.0),
                ..Default::default()
            },
            SettingsUpdate {
                min_price_difference: Some(0.0),
                ..Default::default()
            },
            SettingsUpdate {
                max_concurrent_trades: Some(0),
                ..Default::default()
            },
            SettingsUpdate {
                stop_loss: Some(3.0),
                ..Default::default()
            },
        ] {
            assert!(manager.update_settings(update).is_err());
        }

        // A valid field alongside an invalid one is not applied either
        let result = manager.update_settings(SettingsUpdate {
            max_concurrent_trades: Some(5),
            profit_target: Some(0.0),
            ..Default::default()
        });
        assert!(result.is_err());
        assert_eq!(manager.settings(), TradingSettings::default());
    }
}
