//! Translates source-org ids into target-org ids through the mapping store.

use crate::mapping::MappingStore;

/// Outcome of resolving one source id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Found in the mapping store.
    Mapped(String),
    /// Not mapped; the configured fallback owner is used instead.
    Fallback(String),
    /// Not mapped and no safe substitute exists. The field is left out.
    Unmapped,
}

impl Resolution {
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Mapped(id) | Self::Fallback(id) => Some(id),
            Self::Unmapped => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

/// Read-only view over the mapping store plus the fallback owner policy.
#[derive(Debug, Clone, Copy)]
pub struct IdResolver<'a> {
    store: &'a MappingStore,
    fallback_owner: Option<&'a str>,
}

impl<'a> IdResolver<'a> {
    pub fn new(store: &'a MappingStore, fallback_owner: Option<&'a str>) -> Self {
        Self {
            store,
            fallback_owner,
        }
    }

    /// Resolves an owner or creator. Unmapped ids fall back to the configured
    /// owner when there is one.
    pub fn resolve_owner(&self, scope: &str, source_id: &str) -> Resolution {
        match self.store.get(scope, source_id) {
            Some(target) => Resolution::Mapped(target.to_string()),
            None => match self.fallback_owner {
                Some(fallback) => Resolution::Fallback(fallback.to_string()),
                None => Resolution::Unmapped,
            },
        }
    }

    /// Resolves a relationship field. Never guesses.
    pub fn resolve_reference(&self, scope: &str, source_id: &str) -> Resolution {
        self.store
            .get(scope, source_id)
            .map_or(Resolution::Unmapped, |target| {
                Resolution::Mapped(target.to_string())
            })
    }
}
