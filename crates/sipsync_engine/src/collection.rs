//! Tracked remote collections.

use crate::error::SyncError;
use sipsync_core::{CachedRecord, CatalogItem, Reward, TastedItem};
use std::fmt;
use std::str::FromStr;

/// A remote collection mirrored into a local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// The beer catalog. Refreshed in the foreground before the app is usable.
    Catalog,
    /// The user's tasting history.
    History,
    /// The user's rewards.
    Rewards,
}

impl Collection {
    /// Every collection, primary first.
    pub const ALL: [Collection; 3] = [Collection::Catalog, Collection::History, Collection::Rewards];

    /// Returns the collection name used in preferences and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Catalog => "catalog",
            Collection::History => "history",
            Collection::Rewards => "rewards",
        }
    }

    /// Returns the local table.
    pub fn table(&self) -> &'static str {
        match self {
            Collection::Catalog => CatalogItem::TABLE,
            Collection::History => TastedItem::TABLE,
            Collection::Rewards => Reward::TABLE,
        }
    }

    /// Returns true for the collection refreshed in the foreground.
    pub fn is_primary(&self) -> bool {
        matches!(self, Collection::Catalog)
    }

    /// Returns true for collections that belong to a signed-in user.
    ///
    /// These are skipped in guest mode.
    pub fn is_personal(&self) -> bool {
        !self.is_primary()
    }

    /// Returns the endpoint path used when nothing overrides it.
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Collection::Catalog => "/catalog",
            Collection::History => "/me/history",
            Collection::Rewards => "/me/rewards",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s || c.table() == s)
            .ok_or_else(|| SyncError::UnknownCollection(s.to_string()))
    }
}
