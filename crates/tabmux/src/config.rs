use std::time::Duration;

use thiserror::Error;

/// Inactivity timeouts offered for automatic locking, in minutes.
pub const AUTO_LOCK_CHOICES: [u64; 5] = [1, 5, 10, 15, 30];

#[derive(Debug, Error)]
#[error("auto-lock timeout must be one of 1, 5, 10, 15 or 30 minutes, got {0}")]
pub struct InvalidAutoLock(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoLock {
    #[default]
    Disabled,
    After(Duration),
}

impl AutoLock {
    pub fn minutes(minutes: u64) -> Result<Self, InvalidAutoLock> {
        if AUTO_LOCK_CHOICES.contains(&minutes) {
            Ok(Self::After(Duration::from_secs(minutes * 60)))
        } else {
            Err(InvalidAutoLock(minutes))
        }
    }

    pub fn timeout(self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::After(timeout) => Some(timeout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound for a shared-process call to be answered by a tab.
    pub call_timeout: Duration,
    /// Passes attempted per storage tier before a conversion is reported failed.
    pub conversion_max_attempts: u32,
    /// Account storage categories replayed to tabs that connect later.
    pub mirrored_categories: Vec<String>,
    pub auto_lock: AutoLock,
    pub auto_lock_check_period: Duration,
    /// Origin the rewritten HLS playlists point at. Unset disables rewriting.
    pub stream_origin: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            conversion_max_attempts: 3,
            mirrored_categories: vec![
                "thumbs".to_string(),
                "peers".to_string(),
                "messages".to_string(),
            ],
            auto_lock: AutoLock::Disabled,
            auto_lock_check_period: Duration::from_secs(15),
            stream_origin: None,
        }
    }
}
