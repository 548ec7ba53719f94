//! Ingest limits: per-tenant series cardinality and per-series timestamp order.

use crate::error::DbError;
use crate::labels::{Fingerprint, Labels};
use crate::types::Timestamp;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Tenant used when the caller does not name one.
pub const DEFAULT_TENANT: &str = "anonymous";

/// Admission check run once per profile, over every series it would write, before
/// anything is written. A rejected profile leaves the limiter's state unchanged.
pub trait Limiter: std::fmt::Debug + Send + Sync {
    fn allow_profile(
        &self,
        tenant: &str,
        series: &[(Labels, Fingerprint)],
        timestamp: Timestamp,
    ) -> Result<(), DbError>;
}

/// Accepts everything.
#[derive(Debug, Default)]
pub struct NoLimits;

impl Limiter for NoLimits {
    fn allow_profile(&self, _: &str, _: &[(Labels, Fingerprint)], _: Timestamp) -> Result<(), DbError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Hard limit on distinct series per tenant (`None` = unlimited).
    pub max_series_per_tenant: Option<u64>,
    /// Reject profiles older than the newest one already accepted for their series.
    pub reject_out_of_order: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_series_per_tenant: None,
            reject_out_of_order: false,
        }
    }
}

/// Tracks the series of each tenant and the newest timestamp of each series.
#[derive(Debug)]
pub struct SeriesLimiter {
    cfg: LimitsConfig,
    /// tenant -> fingerprint -> newest accepted timestamp
    tenants: RwLock<FxHashMap<String, FxHashMap<Fingerprint, Timestamp>>>,
}

impl SeriesLimiter {
    pub fn new(cfg: LimitsConfig) -> Self {
        Self {
            cfg,
            tenants: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn series_count(&self, tenant: &str) -> Result<u64, DbError> {
        Ok(self
            .tenants
            .read()?
            .get(tenant)
            .map_or(0, |s| s.len() as u64))
    }
}

impl Limiter for SeriesLimiter {
    fn allow_profile(
        &self,
        tenant: &str,
        series: &[(Labels, Fingerprint)],
        timestamp: Timestamp,
    ) -> Result<(), DbError> {
        let mut tenants = self.tenants.write()?;
        let known = tenants.entry(tenant.to_string()).or_default();

        // check every series first, commit only when all pass
        let mut new_series: Vec<Fingerprint> = Vec::new();
        for (_, fingerprint) in series {
            match known.get(fingerprint) {
                Some(&last) => {
                    if self.cfg.reject_out_of_order && timestamp < last {
                        return Err(DbError::OutOfOrder {
                            fingerprint: *fingerprint,
                            timestamp,
                            last,
                        });
                    }
                }
                None if !new_series.contains(fingerprint) => new_series.push(*fingerprint),
                None => {}
            }
        }
        if let Some(limit) = self.cfg.max_series_per_tenant {
            if known.len() as u64 + new_series.len() as u64 > limit {
                return Err(DbError::SeriesLimitExceeded {
                    current: known.len() as u64,
                    limit,
                    tenant: tenant.to_string(),
                });
            }
        }

        for (_, fingerprint) in series {
            let last = known.entry(*fingerprint).or_insert(timestamp);
            *last = (*last).max(timestamp);
        }
        Ok(())
    }
}
