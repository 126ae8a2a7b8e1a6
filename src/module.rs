//! Logical owners of queued work and the alias table that maps legacy
//! module names onto them.
//!
//! The canonical module string is part of the idempotency key, so every
//! name a producer has ever used for a module must resolve to the same
//! [`ModuleKind`] for as long as messages under that name can still be
//! redelivered. Aliases are configuration, not code: dropping one also
//! requires migrating the ledger rows recorded under it.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Allocation,
    Risk,
}

impl ModuleKind {
    pub const ALL: [Self; 2] = [Self::Allocation, Self::Risk];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allocation => "allocation",
            Self::Risk => "risk",
        }
    }
}

impl Display for ModuleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown module: {0}")]
pub struct UnknownModuleError(pub String);

impl FromStr for ModuleKind {
    type Err = UnknownModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocation" => Ok(Self::Allocation),
            "risk" => Ok(Self::Risk),
            other => Err(UnknownModuleError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AliasError {
    #[error("Alias cannot be empty")]
    Empty,
    #[error("Alias '{alias}' shadows the canonical name of module {module}")]
    ShadowsCanonical { alias: String, module: ModuleKind },
    #[error("Alias '{alias}' is already assigned to module {existing}, cannot assign to {requested}")]
    Conflict {
        alias: String,
        existing: ModuleKind,
        requested: ModuleKind,
    },
}

/// Closed lookup table from accepted legacy names to canonical modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleAliases {
    table: HashMap<String, ModuleKind>,
}

impl ModuleAliases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names producers used before the modules were renamed to their
    /// canonical values.
    pub fn legacy() -> Self {
        let table = [
            ("rebalance", ModuleKind::Allocation),
            ("allocation_execution", ModuleKind::Allocation),
            ("risk_adjustment", ModuleKind::Risk),
            ("risk_execution", ModuleKind::Risk),
        ]
        .into_iter()
        .map(|(alias, module)| (alias.to_string(), module))
        .collect();

        Self { table }
    }

    pub fn insert(&mut self, alias: &str, module: ModuleKind) -> Result<(), AliasError> {
        let alias = normalize(alias);
        if alias.is_empty() {
            return Err(AliasError::Empty);
        }

        if let Ok(canonical) = ModuleKind::from_str(&alias) {
            return Err(AliasError::ShadowsCanonical {
                alias,
                module: canonical,
            });
        }

        match self.table.get(&alias) {
            Some(existing) if *existing != module => Err(AliasError::Conflict {
                alias,
                existing: *existing,
                requested: module,
            }),
            _ => {
                self.table.insert(alias, module);
                Ok(())
            }
        }
    }

    pub fn with_alias(mut self, alias: &str, module: ModuleKind) -> Result<Self, AliasError> {
        self.insert(alias, module)?;
        Ok(self)
    }

    /// Resolves a canonical name or accepted alias. Matching ignores
    /// surrounding whitespace and ASCII case.
    pub fn resolve(&self, name: &str) -> Option<ModuleKind> {
        let name = normalize(name);
        ModuleKind::from_str(&name)
            .ok()
            .or_else(|| self.table.get(&name).copied())
    }

    pub fn aliases_for(&self, module: ModuleKind) -> Vec<&str> {
        let mut aliases: Vec<&str> = self
            .table
            .iter()
            .filter(|(_, target)| **target == module)
            .map(|(alias, _)| alias.as_str())
            .collect();
        aliases.sort_unstable();
        aliases
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_resolve_without_aliases() {
        let aliases = ModuleAliases::new();
        assert_eq!(aliases.resolve("allocation"), Some(ModuleKind::Allocation));
        assert_eq!(aliases.resolve("risk"), Some(ModuleKind::Risk));
        assert_eq!(aliases.resolve("rebalance"), None);
    }

    #[test]
    fn legacy_aliases_resolve_to_canonical_module() {
        let aliases = ModuleAliases::legacy();
        assert_eq!(aliases.resolve("rebalance"), Some(ModuleKind::Allocation));
        assert_eq!(aliases.resolve(" Rebalance "), Some(ModuleKind::Allocation));
        assert_eq!(aliases.resolve("risk_adjustment"), Some(ModuleKind::Risk));
        assert_eq!(aliases.resolve("hedging"), None);
    }

    #[test]
    fn alias_cannot_shadow_canonical_name() {
        let error = ModuleAliases::new()
            .with_alias("risk", ModuleKind::Allocation)
            .unwrap_err();
        assert_eq!(
            error,
            AliasError::ShadowsCanonical {
                alias: "risk".to_string(),
                module: ModuleKind::Risk,
            }
        );
    }

    #[test]
    fn alias_cannot_move_between_modules() {
        let error = ModuleAliases::new()
            .with_alias("legacy", ModuleKind::Allocation)
            .unwrap()
            .with_alias("LEGACY", ModuleKind::Risk)
            .unwrap_err();
        assert!(matches!(error, AliasError::Conflict { .. }));
    }

    #[test]
    fn reassigning_alias_to_same_module_is_accepted() {
        let aliases = ModuleAliases::new()
            .with_alias("rebalance", ModuleKind::Allocation)
            .unwrap()
            .with_alias("rebalance", ModuleKind::Allocation)
            .unwrap();
        assert_eq!(aliases.aliases_for(ModuleKind::Allocation), vec!["rebalance"]);
    }

    #[test]
    fn empty_alias_is_rejected() {
        assert_eq!(
            ModuleAliases::new().insert("  ", ModuleKind::Risk),
            Err(AliasError::Empty)
        );
    }
}
