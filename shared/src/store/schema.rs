use serde::{Deserialize, Serialize};

/// Current on-device schema version.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    Files,
    Solutions,
    AppState,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Files, Collection::Solutions, Collection::AppState];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Solutions => "solutions",
            Self::AppState => "app_state",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
struct CollectionSpec {
    collection: Collection,
    introduced_in: u32,
    /// Version at which the key layout last changed. Crossing it drops the
    /// collection's contents.
    rekeyed_in: Option<u32>,
}

// v1: files + solutions keyed per problem.
// v2: solutions keyed by fileItemId, app_state added.
const SCHEMA: &[CollectionSpec] = &[
    CollectionSpec {
        collection: Collection::Files,
        introduced_in: 1,
        rekeyed_in: None,
    },
    CollectionSpec {
        collection: Collection::Solutions,
        introduced_in: 1,
        rekeyed_in: Some(2),
    },
    CollectionSpec {
        collection: Collection::AppState,
        introduced_in: 2,
        rekeyed_in: None,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeStep {
    /// Create the collection if it does not exist yet.
    Create(Collection),
    /// Drop the collection (and every record in it) and create it empty.
    Recreate(Collection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePlan {
    pub from: u32,
    pub to: u32,
    pub steps: Vec<UpgradeStep>,
}

impl UpgradePlan {
    /// Plan for moving a store at `from` to `to`. Forward only.
    pub fn between(from: u32, to: u32) -> Self {
        let mut steps = Vec::new();
        for spec in SCHEMA.iter().filter(|s| s.introduced_in <= to) {
            let crosses_rekey = spec
                .rekeyed_in
                .is_some_and(|v| from < v && v <= to);
            if from < spec.introduced_in {
                steps.push(UpgradeStep::Create(spec.collection));
            } else if crosses_rekey {
                steps.push(UpgradeStep::Recreate(spec.collection));
            } else {
                steps.push(UpgradeStep::Create(spec.collection));
            }
        }
        Self { from, to, steps }
    }

    pub fn created(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.steps.iter().filter_map(|s| match s {
            UpgradeStep::Create(c) => Some(c.name()),
            UpgradeStep::Recreate(_) => None,
        })
    }

    pub fn recreated(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.steps.iter().filter_map(|s| match s {
            UpgradeStep::Recreate(c) => Some(c.name()),
            UpgradeStep::Create(_) => None,
        })
    }

    pub fn is_lossy(&self) -> bool {
        self.recreated().next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_install_creates_everything() {
        let plan = UpgradePlan::between(0, SCHEMA_VERSION);
        assert!(!plan.is_lossy());
        let created: Vec<_> = plan.created().collect();
        assert_eq!(created, vec!["files", "solutions", "app_state"]);
    }

    #[test]
    fn v1_to_v2_recreates_solutions_only() {
        let plan = UpgradePlan::between(1, 2);
        assert!(plan.is_lossy());
        assert_eq!(plan.recreated().collect::<Vec<_>>(), vec!["solutions"]);
        assert!(plan.created().any(|c| c == "app_state"));
        assert!(plan.created().any(|c| c == "files"));
    }

    #[test]
    fn same_version_is_not_lossy() {
        let plan = UpgradePlan::between(2, 2);
        assert!(!plan.is_lossy());
    }

    #[test]
    fn v1_target_excludes_later_collections() {
        let plan = UpgradePlan::between(0, 1);
        assert!(!plan.created().any(|c| c == "app_state"));
    }
}
