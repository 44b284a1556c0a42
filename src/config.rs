use std::ops::RangeInclusive;

use clap::Args;

use crate::error::{CareError, CareResult};

pub const DEFAULT_LOG_FILTER: &str = "fhr_care=info,sqlx=warn";

/// Runtime settings, each readable from a flag or the environment.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "FHR_MAX_CONNECTIONS", default_value_t = 5, global = true)]
    pub max_connections: u32,

    /// Lowest physiologically plausible BPM sample
    #[arg(long, env = "FHR_BPM_MIN", default_value_t = 50, global = true)]
    pub bpm_min: i32,

    /// Highest physiologically plausible BPM sample
    #[arg(long, env = "FHR_BPM_MAX", default_value_t = 300, global = true)]
    pub bpm_max: i32,

    /// Attempts per transaction before a serialization conflict is surfaced
    #[arg(long, env = "FHR_TX_ATTEMPTS", default_value_t = 3, global = true)]
    pub tx_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            bpm_min: 50,
            bpm_max: 300,
            tx_attempts: 3,
        }
    }
}

impl Settings {
    pub fn bpm_bounds(&self) -> CareResult<RangeInclusive<i32>> {
        if self.bpm_min >= self.bpm_max {
            return Err(CareError::invalid(format!(
                "bpm bounds must satisfy min < max (got {}..={})",
                self.bpm_min, self.bpm_max
            )));
        }
        Ok(self.bpm_min..=self.bpm_max)
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| {
                anyhow::anyhow!("DATABASE_URL must be set to a production Postgres instance")
            })
    }
}
