//! ---
//! mh_section: "02-topology-model"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Closed role enumeration and per-role capability sets."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Function a host fulfils inside its domain.
///
/// Roles form a closed enumeration: an unknown role string in the topology
/// description is a parse-time configuration error, not a runtime surprise.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// Enrolled client machine driving the software under test.
    Client,
    /// Generic LDAP directory server.
    Ldap,
    /// FreeIPA server.
    Ipa,
    /// Active Directory domain controller.
    Ad,
    /// Samba domain controller.
    Samba,
    /// Kerberos KDC.
    Kdc,
    /// NFS server used by automount scenarios.
    Nfs,
}

/// Operation classes a test may request against hosts holding a role.
///
/// The mapping is resolved at topology-load time; tests asking for an
/// operation outside their host's capability set are a suite bug, not an
/// environment problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Plain remote command execution.
    Exec,
    /// File upload/download and remote filesystem edits.
    FileSystem,
    /// Local user and group manipulation on the host.
    LocalUsers,
    /// Directory-service administration (users, groups, sudo rules).
    DirectoryAdmin,
    /// Windows-flavoured shells; command lines are built with PowerShell
    /// prefixes instead of POSIX double dashes.
    PowerShell,
    /// Exported network file systems.
    FileSharing,
}

impl Role {
    /// Capability set granted to hosts holding this role.
    pub fn capabilities(self) -> &'static [Capability] {
        use Capability::*;
        match self {
            Role::Client => &[Exec, FileSystem, LocalUsers],
            Role::Ldap => &[Exec, FileSystem, DirectoryAdmin],
            Role::Ipa => &[Exec, FileSystem, DirectoryAdmin],
            Role::Ad => &[Exec, DirectoryAdmin, PowerShell],
            Role::Samba => &[Exec, FileSystem, DirectoryAdmin, FileSharing],
            Role::Kdc => &[Exec, FileSystem],
            Role::Nfs => &[Exec, FileSystem, FileSharing],
        }
    }

    /// Whether tests may request `capability` against hosts of this role.
    pub fn grants(self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn role_strings_round_trip() {
        for role in Role::iter() {
            let rendered = role.to_string();
            assert_eq!(Role::from_str(&rendered).unwrap(), role);
        }
        assert_eq!(Role::from_str("ad").unwrap(), Role::Ad);
        assert!(Role::from_str("mainframe").is_err());
    }

    #[test]
    fn every_role_can_execute_commands() {
        for role in Role::iter() {
            assert!(role.grants(Capability::Exec), "{role} must grant exec");
        }
    }

    #[test]
    fn ad_uses_powershell_and_skips_posix_fs() {
        assert!(Role::Ad.grants(Capability::PowerShell));
        assert!(!Role::Ad.grants(Capability::FileSystem));
    }
}
