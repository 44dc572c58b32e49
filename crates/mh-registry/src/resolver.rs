//! ---
//! mh_section: "04-session-pool-registry"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Role capability resolver over the pool's role index."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::collections::HashMap;

use tracing::debug;

use mh_topology::{Capability, HostId, Role};

use crate::quarantine::QuarantineSet;
use crate::RegistryError;

/// Maps a role to the hosts currently holding it.
///
/// Honors exclusions applied during topology construction (excluded hosts
/// never enter the index) and skips quarantined hosts on every query. The
/// index is rebuilt only when the topology is, i.e. once per run.
#[derive(Debug, Clone)]
pub struct RoleResolver {
    index: HashMap<Role, Vec<HostId>>,
    quarantine: QuarantineSet,
}

impl RoleResolver {
    /// Resolver over a prebuilt Role→[Host] index.
    pub(crate) fn new(index: HashMap<Role, Vec<HostId>>, quarantine: QuarantineSet) -> Self {
        Self { index, quarantine }
    }

    fn usable(&self, role: Role) -> Vec<HostId> {
        self.index
            .get(&role)
            .map(|hosts| {
                hosts
                    .iter()
                    .filter(|id| !self.quarantine.contains(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hosts holding `role`; the role is required, so an empty result is a
    /// hard failure for the requesting test.
    pub fn hosts_with_role(&self, role: Role) -> Result<Vec<HostId>, RegistryError> {
        let hosts = self.usable(role);
        if hosts.is_empty() {
            return Err(RegistryError::RoleNotPresent(role));
        }
        Ok(hosts)
    }

    /// Hosts holding `role`, empty when the environment lacks it. Used by
    /// tests that adapt behavior to the topology instead of requiring it.
    pub fn hosts_with_role_opt(&self, role: Role) -> Vec<HostId> {
        let hosts = self.usable(role);
        debug!(%role, count = hosts.len(), "optional role query");
        hosts
    }

    /// Whether hosts of `role` grant `capability` to tests.
    pub fn role_grants(&self, role: Role, capability: Capability) -> bool {
        role.grants(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> HashMap<Role, Vec<HostId>> {
        let mut index = HashMap::new();
        index.insert(Role::Client, vec![HostId::new("idm", "client1")]);
        index.insert(
            Role::Ldap,
            vec![HostId::new("idm", "ldap1"), HostId::new("idm", "ldap2")],
        );
        index
    }

    #[test]
    fn required_role_missing_is_hard_failure() {
        let resolver = RoleResolver::new(index(), QuarantineSet::new());
        assert!(matches!(
            resolver.hosts_with_role(Role::Ad),
            Err(RegistryError::RoleNotPresent(Role::Ad))
        ));
    }

    #[test]
    fn optional_role_missing_is_empty() {
        let resolver = RoleResolver::new(index(), QuarantineSet::new());
        assert!(resolver.hosts_with_role_opt(Role::Ad).is_empty());
        assert_eq!(
            resolver.hosts_with_role_opt(Role::Client),
            vec![HostId::new("idm", "client1")]
        );
    }

    #[test]
    fn quarantined_hosts_are_filtered() {
        let quarantine = QuarantineSet::new();
        let resolver = RoleResolver::new(index(), quarantine.clone());

        quarantine.quarantine(HostId::new("idm", "ldap1"), None);
        assert_eq!(
            resolver.hosts_with_role(Role::Ldap).unwrap(),
            vec![HostId::new("idm", "ldap2")]
        );

        // Quarantining the last host of a role makes a required query fail.
        quarantine.quarantine(HostId::new("idm", "ldap2"), None);
        assert!(resolver.hosts_with_role(Role::Ldap).is_err());
        assert!(resolver.hosts_with_role_opt(Role::Ldap).is_empty());
    }
}
