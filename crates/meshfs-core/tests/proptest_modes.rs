//! Property-based tests for path handling and longest-prefix mode
//! resolution.

use std::collections::HashMap;

use meshfs_core::mode::{Mode, ModeResolver};
use meshfs_core::MeshPath;
use proptest::prelude::*;

fn any_mode() -> impl Strategy<Value = Mode> {
    prop_oneof![
        Just(Mode::Primary),
        Just(Mode::Proxy),
        Just(Mode::DualSync),
        Just(Mode::DualAsync),
    ]
}

fn any_abs_path() -> impl Strategy<Value = String> {
    prop::collection::vec("[abc]{1,2}", 0..4)
        .prop_map(|segments| format!("/{}", segments.join("/")))
}

proptest! {
    #[test]
    fn longest_matching_prefix_wins(
        entries in prop::collection::vec((any_abs_path(), any_mode()), 0..6),
        probe in any_abs_path(),
    ) {
        // De-duplicate prefixes: the table keyed by path, first entry wins.
        let mut table: HashMap<String, Mode> = HashMap::new();
        for (path, mode) in entries {
            table.entry(path).or_insert(mode);
        }
        let entries: Vec<(String, Mode)> = table.into_iter().collect();

        let resolver = ModeResolver::from_config(Mode::DualSync, &entries, true).unwrap();
        let probe_path = MeshPath::new(&probe).unwrap();

        let resolved = resolver.resolve_mode(&probe_path);

        let expected = resolver
            .modes_ordered()
            .iter()
            .filter(|(p, _)| probe_path.is_same(p) || probe_path.is_subdirectory_of(p))
            .max_by_key(|(p, _)| p.as_str().len())
            .map(|(_, m)| *m)
            .unwrap_or(resolver.default_mode());

        prop_assert_eq!(resolved, expected);
    }

    #[test]
    fn children_modes_contain_every_descendant_mode(
        entries in prop::collection::vec((any_abs_path(), any_mode()), 0..6),
        probe in any_abs_path(),
    ) {
        let mut table: HashMap<String, Mode> = HashMap::new();
        for (path, mode) in entries {
            table.entry(path).or_insert(mode);
        }
        let entries: Vec<(String, Mode)> = table.into_iter().collect();

        let resolver = ModeResolver::from_config(Mode::DualSync, &entries, true).unwrap();
        let probe_path = MeshPath::new(&probe).unwrap();

        let children = resolver.resolve_children_modes(&probe_path);

        prop_assert!(children.contains(&resolver.resolve_mode(&probe_path)));

        for (prefix, _) in resolver.modes_ordered() {
            if prefix.is_subdirectory_of(&probe_path) {
                prop_assert!(children.contains(&resolver.resolve_mode(prefix)));
            }
        }
    }

    #[test]
    fn parent_child_round_trip(
        segments in prop::collection::vec("[a-z]{1,8}", 1..6),
        name in "[a-z]{1,8}",
    ) {
        let base = MeshPath::new(&format!("/{}", segments.join("/"))).unwrap();
        let child = base.child(&name);

        prop_assert_eq!(child.parent().unwrap(), base.clone());
        prop_assert_eq!(child.name(), name.as_str());
        prop_assert!(child.is_subdirectory_of(&base));
        prop_assert!(!base.is_subdirectory_of(&child));
    }

    #[test]
    fn normalization_is_idempotent(raw in "(/[a-z]{1,4}){0,5}/{0,3}") {
        if let Ok(path) = MeshPath::new(&raw) {
            let again = MeshPath::new(path.as_str()).unwrap();
            prop_assert_eq!(path, again);
        }
    }
}
