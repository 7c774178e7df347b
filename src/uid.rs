//! Read-mostly uid ↔ package map used by string matchers.
//!
//! String comparisons against uid-annotated fields resolve through two
//! layers: a static table of well-known service uids (all below 10000) and
//! the dynamic package map maintained from package-manager updates.

use dashmap::DashMap;
use std::collections::HashSet;

/// Well-known service names with fixed uids. Names resolve before the
/// dynamic package map is consulted.
pub const WELL_KNOWN_UIDS: &[(&str, i32)] = &[
    ("root", 0),
    ("system", 1000),
    ("radio", 1001),
    ("bluetooth", 1002),
    ("graphics", 1003),
    ("input", 1004),
    ("audio", 1005),
    ("camera", 1006),
    ("log", 1007),
    ("wifi", 1010),
    ("media", 1013),
    ("gps", 1021),
    ("nfc", 1027),
    ("shell", 2000),
    ("drm", 1019),
    ("nobody", 9999),
];

/// Looks up a well-known service uid by name.
pub fn well_known_uid(name: &str) -> Option<i32> {
    WELL_KNOWN_UIDS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, uid)| *uid)
}

/// Looks up the well-known name for a uid. Well-known uids never exceed
/// 9999, so higher uids skip the scan.
pub fn well_known_name(uid: i32) -> Option<&'static str> {
    if uid > 9999 {
        return None;
    }
    WELL_KNOWN_UIDS
        .iter()
        .find(|(_, u)| *u == uid)
        .map(|(n, _)| *n)
}

/// Dynamic uid → package-name map.
///
/// Reads dominate (every uid-string comparison on the matcher path);
/// writes happen only on package updates.
#[derive(Default)]
pub struct UidMap {
    apps: DashMap<i32, HashSet<String>>,
}

impl UidMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a package under a uid (shared uids carry several).
    pub fn add_app(&self, uid: i32, package: &str) {
        self.apps
            .entry(uid)
            .or_default()
            .insert(package.to_owned());
    }

    /// Removes one package from a uid; drops the entry when empty.
    pub fn remove_app(&self, uid: i32, package: &str) {
        if let Some(mut entry) = self.apps.get_mut(&uid) {
            entry.remove(package);
            let now_empty = entry.is_empty();
            drop(entry);
            if now_empty {
                self.apps.remove(&uid);
            }
        }
    }

    /// Whether the uid has the exact package installed.
    pub fn has_app(&self, uid: i32, package: &str) -> bool {
        self.apps
            .get(&uid)
            .map(|set| set.contains(package))
            .unwrap_or(false)
    }

    /// Snapshot of the package names registered under a uid.
    pub fn app_names(&self, uid: i32) -> Vec<String> {
        self.apps
            .get(&uid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_lookup() {
        assert_eq!(well_known_uid("system"), Some(1000));
        assert_eq!(well_known_name(1000), Some("system"));
        assert_eq!(well_known_uid("no.such.aid"), None);
        assert_eq!(well_known_name(10123), None);
    }

    #[test]
    fn test_add_remove_app() {
        let map = UidMap::new();
        map.add_app(10001, "com.example.one");
        map.add_app(10001, "com.example.two");
        assert!(map.has_app(10001, "com.example.one"));
        assert_eq!(map.app_names(10001).len(), 2);

        map.remove_app(10001, "com.example.one");
        assert!(!map.has_app(10001, "com.example.one"));
        assert!(map.has_app(10001, "com.example.two"));

        map.remove_app(10001, "com.example.two");
        assert!(map.app_names(10001).is_empty());
    }
}
