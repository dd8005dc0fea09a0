//! Role algebra.
//!
//! Roles are compared by capability: `admin ⊇ writer ⊇ reader`, and
//! `writeOnly` grants write without read. Combining two roles (direct
//! membership, the `everyone` entry, inherited parent roles) takes the union
//! of their capabilities.

use covalence_core::Role;

/// Read/write/admin capability set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub admin: bool,
}

impl Capabilities {
    pub fn of(role: Role) -> Self {
        Self {
            read: role.can_read(),
            write: role.can_write(),
            admin: role.is_admin(),
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            read: self.read || other.read,
            write: self.write || other.write,
            admin: self.admin || other.admin,
        }
    }

    /// The weakest role carrying these capabilities; `None` when empty.
    pub fn to_role(self) -> Option<Role> {
        match (self.admin, self.read, self.write) {
            (true, _, _) => Some(Role::Admin),
            (false, true, true) => Some(Role::Writer),
            (false, true, false) => Some(Role::Reader),
            (false, false, true) => Some(Role::WriteOnly),
            (false, false, false) => None,
        }
    }
}

/// Combine two optional roles into the strongest effective role.
///
/// `Revoked` contributes nothing.
pub fn strongest(a: Option<Role>, b: Option<Role>) -> Option<Role> {
    let caps = a
        .map(Capabilities::of)
        .unwrap_or_default()
        .union(b.map(Capabilities::of).unwrap_or_default());
    caps.to_role()
}

/// The role a parent-group member holds in an extending child group.
pub fn inherited_role(parent_role: Role) -> Option<Role> {
    match parent_role {
        Role::Revoked => None,
        role => Some(role),
    }
}
