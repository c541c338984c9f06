//! Capabilities a companion client can be granted.
//!
//! A client holds a [`PermissionSet`]; every REST request is checked
//! against it before the game performs the side effect.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// List the song library.
    ReadSongs,
    /// View the song queue.
    ReadSongQueue,
    /// Add to or remove from the song queue.
    WriteSongQueue,
    /// Read game settings.
    ReadConfig,
    /// Change game settings.
    WriteConfig,
    /// Read pitch data recorded by other companions.
    ReadMicrophoneData,
    /// Simulate key presses in the game.
    WriteInputSimulation,
}

impl Permission {
    /// Every permission, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::ReadSongs,
        Self::ReadSongQueue,
        Self::WriteSongQueue,
        Self::ReadConfig,
        Self::WriteConfig,
        Self::ReadMicrophoneData,
        Self::WriteInputSimulation,
    ];
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Ordered set of granted permissions. Serializes as a JSON array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Creates a set holding every permission.
    #[must_use]
    pub fn all() -> Self {
        Permission::ALL.into_iter().collect()
    }

    /// Whether `permission` is granted.
    #[must_use]
    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    /// Grants a permission. Returns `true` if it was not granted before.
    pub fn grant(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    /// Revokes a permission. Returns `true` if it was granted before.
    pub fn revoke(&mut self, permission: Permission) -> bool {
        self.0.remove(&permission)
    }

    /// Iterates the granted permissions in order.
    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    /// Number of granted permissions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is granted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the grants as a list, as carried in wire messages.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Permission> {
        self.iter().collect()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Permission> for PermissionSet {
    fn extend<I: IntoIterator<Item = Permission>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}
