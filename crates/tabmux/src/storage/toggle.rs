use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use super::encrypted::{Conversion, EncryptableStore};

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("tier {tier} still partially converted after {attempts} attempts: {reason}")]
    PartialConversion {
        tier: String,
        attempts: u32,
        reason: String,
    },
}

/// Converts every persistence tier between plaintext and sealed form.
///
/// A tier that fails partway is rerun from its first key; conversion skips
/// entries already in the target form, so reruns converge.
pub struct StorageToggle {
    tiers: Vec<Arc<EncryptableStore>>,
    max_attempts: u32,
}

impl StorageToggle {
    pub fn new(tiers: Vec<Arc<EncryptableStore>>, max_attempts: u32) -> Self {
        Self {
            tiers,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn tiers(&self) -> &[Arc<EncryptableStore>] {
        &self.tiers
    }

    /// Switches the write path of every tier, then converts existing entries.
    ///
    /// On failure every tier gets its previous write mode back.
    pub async fn apply(&self, enabling: bool) -> Result<(), ConversionError> {
        let previous: Vec<bool> = self.tiers.iter().map(|tier| tier.is_encrypting()).collect();
        for tier in &self.tiers {
            tier.set_encrypting(enabling);
        }
        let conversion = if enabling {
            Conversion::SealAll
        } else {
            Conversion::OpenAll
        };
        let result = self.run(conversion).await;
        if result.is_err() {
            for (tier, encrypting) in self.tiers.iter().zip(previous) {
                tier.set_encrypting(encrypting);
            }
        }
        result
    }

    /// Reseals every tier under the currently installed key.
    pub async fn reencrypt(&self) -> Result<(), ConversionError> {
        self.run(Conversion::SealAll).await
    }

    async fn run(&self, conversion: Conversion) -> Result<(), ConversionError> {
        let results = join_all(
            self.tiers
                .iter()
                .map(|tier| self.convert_tier(tier, conversion)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        info!(target: "tabmux.storage", ?conversion, tiers = self.tiers.len(), "storage toggle complete");
        Ok(())
    }

    async fn convert_tier(
        &self,
        tier: &EncryptableStore,
        conversion: Conversion,
    ) -> Result<usize, ConversionError> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match tier.convert(conversion).await {
                Ok(converted) => return Ok(converted),
                Err(error) => {
                    warn!(
                        target: "tabmux.storage",
                        tier = tier.name(),
                        attempt,
                        max_attempts = self.max_attempts,
                        %error,
                        "storage conversion pass failed"
                    );
                    last_error = error.to_string();
                }
            }
        }
        Err(ConversionError::PartialConversion {
            tier: tier.name().to_string(),
            attempts: self.max_attempts,
            reason: last_error,
        })
    }
}
