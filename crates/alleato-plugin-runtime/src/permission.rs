//! Permission model for plugins.
//!
//! Plugins declare the permissions they need in their manifest. Host calls
//! check the granted set before doing anything on the plugin's behalf.

use std::collections::HashSet;

/// A permission a plugin can declare.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Unrestricted outbound HTTP (lifts the fetch host allow-list).
    ApiAccess,

    /// Read/write access to plugin-scoped storage.
    Storage,

    /// Send notifications to the user.
    Notifications,

    /// Custom permission string for extension.
    Custom(String),
}

impl Permission {
    /// Parse a permission from its manifest string.
    pub fn parse(s: &str) -> Self {
        match s {
            "access:api" => Permission::ApiAccess,
            "access:storage" => Permission::Storage,
            "access:notifications" => Permission::Notifications,
            other => Permission::Custom(other.to_string()),
        }
    }

    /// String representation as it appears in a manifest.
    pub fn as_str(&self) -> &str {
        match self {
            Permission::ApiAccess => "access:api",
            Permission::Storage => "access:storage",
            Permission::Notifications => "access:notifications",
            Permission::Custom(s) => s,
        }
    }
}

/// A set of granted permissions.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    permissions: HashSet<Permission>,
}

impl PermissionSet {
    /// Create an empty permission set.
    pub fn new() -> Self {
        Self {
            permissions: HashSet::new(),
        }
    }

    /// Create a permission set from manifest strings.
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let permissions = strings
            .into_iter()
            .map(|s| Permission::parse(s.as_ref()))
            .collect();
        Self { permissions }
    }

    /// Add a permission to the set.
    pub fn add(&mut self, permission: Permission) {
        self.permissions.insert(permission);
    }

    /// Check whether the set contains a permission.
    pub fn has(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Check whether this set is a superset of another.
    pub fn contains_all(&self, other: &PermissionSet) -> bool {
        other.permissions.is_subset(&self.permissions)
    }

    /// Iterate over the permissions in the set.
    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    /// Number of permissions in the set.
    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self {
            permissions: iter.into_iter().collect(),
        }
    }
}
