use once_cell::sync::Lazy;
use std::fmt;
use std::ops;

/// Describes the ability of a user to perform a certain action on a znode.
///
/// Permissions are a bit set; combine them with `|`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Permission(u32);

impl Permission {
    /// No permissions at all.
    pub const NONE: Permission = Permission(0b00000);
    /// You can access the data of a node and can list its children.
    pub const READ: Permission = Permission(0b00001);
    /// You can set the data of a node.
    pub const WRITE: Permission = Permission(0b00010);
    /// You can create a child node.
    pub const CREATE: Permission = Permission(0b00100);
    /// You can delete a child node (but not necessarily this one).
    pub const DELETE: Permission = Permission(0b01000);
    /// You can alter permissions on this node.
    pub const ADMIN: Permission = Permission(0b10000);
    /// All of the above.
    pub const ALL: Permission = Permission(0b11111);

    pub(crate) fn code(self) -> u32 {
        self.0
    }

    /// Check that all `permissions` are set in this value.
    pub fn can(self, permissions: Permission) -> bool {
        (self.0 & permissions.0) == permissions.0
    }
}

impl ops::BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Permission(self.0 | rhs.0)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == Permission::ALL {
            return write!(f, "ALL");
        }
        if *self == Permission::NONE {
            return write!(f, "NONE");
        }
        let names = [
            (Permission::READ, "READ"),
            (Permission::WRITE, "WRITE"),
            (Permission::CREATE, "CREATE"),
            (Permission::DELETE, "DELETE"),
            (Permission::ADMIN, "ADMIN"),
        ];
        let mut first = true;
        for (perm, name) in names.iter() {
            if self.can(*perm) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// An access control entry attached to a znode.
///
/// Only the fully open ACL is used by this crate; access policy is left to the ensemble.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Acl {
    /// The permissions associated with this ACL.
    pub perms: Permission,
    /// The authentication scheme this list is used for. The most common scheme is `"world"`.
    pub scheme: String,
    /// The ID of the user under the `scheme`.
    pub id: String,
}

static OPEN_UNSAFE: Lazy<[Acl; 1]> = Lazy::new(|| {
    [Acl {
        perms: Permission::ALL,
        scheme: "world".to_string(),
        id: "anyone".to_string(),
    }]
});

impl Acl {
    /// This is a completely open ACL: anyone can do anything with the node.
    pub fn open_unsafe() -> &'static [Acl] {
        &OPEN_UNSAFE[..]
    }
}
