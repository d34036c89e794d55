//! Repository configuration.
//!
//! Defaults match the historical layout (`Batch` prefix, 2500-character exit
//! descriptions). Values can be overridden from the environment:
//!
//! - `BATCHREPO_COLLECTION_PREFIX`
//! - `BATCHREPO_MAX_EXIT_MESSAGE_LENGTH`
//! - `BATCHREPO_ID_PADDING`

use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, RepositoryResult};

pub const DEFAULT_COLLECTION_PREFIX: &str = "Batch";
pub const DEFAULT_MAX_EXIT_MESSAGE_LENGTH: usize = 2500;

const ENV_COLLECTION_PREFIX: &str = "BATCHREPO_COLLECTION_PREFIX";
const ENV_MAX_EXIT_MESSAGE_LENGTH: &str = "BATCHREPO_MAX_EXIT_MESSAGE_LENGTH";
const ENV_ID_PADDING: &str = "BATCHREPO_ID_PADDING";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Prepended to every collection name.
    pub collection_prefix: String,
    /// Exit descriptions are cut to this many characters before every write.
    pub max_exit_message_length: usize,
    /// Width that string identifiers are zero-padded to (0 = no padding).
    pub id_padding: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            collection_prefix: DEFAULT_COLLECTION_PREFIX.to_string(),
            max_exit_message_length: DEFAULT_MAX_EXIT_MESSAGE_LENGTH,
            id_padding: 0,
        }
    }
}

impl RepositoryConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> RepositoryResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RepositoryResult<Self> {
        let mut config = Self::default();

        if let Some(prefix) = lookup(ENV_COLLECTION_PREFIX) {
            config.collection_prefix = prefix;
        }
        if let Some(raw) = lookup(ENV_MAX_EXIT_MESSAGE_LENGTH) {
            config.max_exit_message_length = parse_usize(ENV_MAX_EXIT_MESSAGE_LENGTH, &raw)?;
        }
        if let Some(raw) = lookup(ENV_ID_PADDING) {
            config.id_padding = parse_usize(ENV_ID_PADDING, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RepositoryResult<()> {
        let prefix_ok = self
            .collection_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !prefix_ok {
            return Err(RepositoryError::validation(format!(
                "collection prefix '{}' may only contain ASCII letters, digits and '_'",
                self.collection_prefix
            )));
        }
        if self.max_exit_message_length == 0 {
            return Err(RepositoryError::validation("max exit message length must be positive"));
        }
        Ok(())
    }

    /// Full collection name for an entity kind.
    pub fn collection(&self, entity: &str) -> String {
        format!("{}{}", self.collection_prefix, entity)
    }
}

fn parse_usize(key: &str, raw: &str) -> RepositoryResult<usize> {
    raw.trim()
        .parse()
        .map_err(|_| RepositoryError::validation(format!("{key} must be a non-negative integer, got '{raw}'")))
}
