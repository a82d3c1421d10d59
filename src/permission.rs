use crate::config::{ActorQuotaConfig, TierRuleConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Ceiling reported for actors holding a bypass permission.
pub const UNBOUNDED: i32 = i32::MAX;

/// One permission node as the host reports it. `granted == false` is an
/// explicit negation and never contributes a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub node: String,
    pub granted: bool,
}

/// Snapshot of an actor's effective permissions at the time of a check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    grants: BTreeMap<String, bool>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, node: impl Into<String>) -> Self {
        self.grants.insert(node.into(), true);
        self
    }

    pub fn negate(mut self, node: impl Into<String>) -> Self {
        self.grants.insert(node.into(), false);
        self
    }

    pub fn has(&self, node: &str) -> bool {
        self.grants.get(node).copied().unwrap_or(false)
    }

    /// Granted, non-negated nodes.
    pub fn granted(&self) -> impl Iterator<Item = &str> {
        self.grants
            .iter()
            .filter(|(_, granted)| **granted)
            .map(|(node, _)| node.as_str())
    }
}

impl FromIterator<PermissionGrant> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = PermissionGrant>>(iter: I) -> Self {
        Self {
            grants: iter.into_iter().map(|g| (g.node, g.granted)).collect(),
        }
    }
}

impl<'a> FromIterator<&'a str> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self {
            grants: iter.into_iter().map(|n| (n.to_string(), true)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierRule {
    /// `<prefix><digits>` grants a ceiling of `<digits>`.
    NumericSuffix { prefix: String },
    /// An exact node grants a fixed ceiling.
    Fixed { permission: String, ceiling: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TierMatch {
    Ceiling(i32),
    Malformed,
    NoMatch,
}

impl TierRule {
    fn evaluate(&self, node: &str) -> TierMatch {
        match self {
            TierRule::NumericSuffix { prefix } => match node.strip_prefix(prefix.as_str()) {
                None => TierMatch::NoMatch,
                Some(tail) if tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) => {
                    TierMatch::NoMatch
                }
                Some(tail) => match tail.parse::<i32>() {
                    Ok(ceiling) => TierMatch::Ceiling(ceiling),
                    Err(_) => TierMatch::Malformed,
                },
            },
            TierRule::Fixed {
                permission,
                ceiling,
            } => {
                if node == permission {
                    TierMatch::Ceiling(*ceiling)
                } else {
                    TierMatch::NoMatch
                }
            }
        }
    }
}

/// Derives an actor's ceiling from its permissions.
///
/// The result is the largest ceiling of any granted node that matches a rule,
/// never lower than `default_ceiling`. The bypass node wins outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    rules: Vec<TierRule>,
    default_ceiling: i32,
    bypass: String,
}

impl TierTable {
    pub fn new(rules: Vec<TierRule>, default_ceiling: i32, bypass: impl Into<String>) -> Self {
        Self {
            rules,
            default_ceiling,
            bypass: bypass.into(),
        }
    }

    pub fn from_config(config: &ActorQuotaConfig, bypass: &str) -> Self {
        let mut rules = vec![TierRule::NumericSuffix {
            prefix: config.tier_prefix.clone(),
        }];
        rules.extend(config.tiers.iter().map(|TierRuleConfig { permission, ceiling }| {
            TierRule::Fixed {
                permission: permission.clone(),
                ceiling: *ceiling,
            }
        }));
        Self::new(rules, config.max_per_actor, bypass)
    }

    pub fn default_ceiling(&self) -> i32 {
        self.default_ceiling
    }

    pub fn is_bypassed(&self, permissions: &PermissionSet) -> bool {
        permissions.has(&self.bypass)
    }

    pub fn effective_limit(&self, permissions: &PermissionSet) -> i32 {
        if self.is_bypassed(permissions) {
            return UNBOUNDED;
        }
        permissions
            .granted()
            .flat_map(|node| self.rules.iter().map(move |rule| (node, rule.evaluate(node))))
            .filter_map(|(node, outcome)| match outcome {
                TierMatch::Ceiling(ceiling) => Some(ceiling),
                TierMatch::Malformed => {
                    warn!(permission = node, "skipping tier permission with out-of-range limit");
                    None
                }
                TierMatch::NoMatch => None,
            })
            .fold(self.default_ceiling, i32::max)
    }
}
