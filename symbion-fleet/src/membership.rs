/**
 * MEMBERSHIP CACHE - Index dérivé groupe → hôtes
 *
 * RÔLE : répondre à "quels hôtes appartiennent au groupe G" en O(1) sans
 * parcourir la table des hôtes à chaque requête.
 *
 * FONCTIONNEMENT :
 * - rebuild() relit tous les groupes (buckets vides inclus) et tous les hôtes
 * - appelé de façon synchrone par chaque écriture hôte/groupe avant retour
 * - un seul RwLock : lectures concurrentes, rebuild exclusif
 * - un échec d'énumération du stockage est remonté comme erreur fatale
 */

use crate::models::{Group, GroupId, Host, HostId};
use crate::state::{new_rw_state, SharedRw};
use crate::store::{EntityStore, StoreError};
use std::collections::HashMap;
use tracing::debug;

pub struct MembershipCache {
    members: SharedRw<HashMap<GroupId, Vec<HostId>>>,
}

impl Default for MembershipCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipCache {
    pub fn new() -> Self {
        Self {
            members: new_rw_state(HashMap::new()),
        }
    }

    /// Reconstruit l'index complet depuis le stockage
    pub fn rebuild(
        &self,
        groups: &dyn EntityStore<Group>,
        hosts: &dyn EntityStore<Host>,
    ) -> Result<(), StoreError> {
        let groups = groups.get_all(false)?;
        let hosts = hosts.get_all(false)?;

        let mut index: HashMap<GroupId, Vec<HostId>> =
            groups.iter().map(|g| (g.id, Vec::new())).collect();
        for host in &hosts {
            for group_id in &host.group_ids {
                let bucket = index.entry(*group_id).or_default();
                if !bucket.contains(&host.id) {
                    bucket.push(host.id);
                }
            }
        }

        *self.members.write() = index;
        debug!(groups = groups.len(), hosts = hosts.len(), "membership cache rebuilt");
        Ok(())
    }

    /// Hôtes membres d'un groupe ; vide pour un groupe inconnu
    pub fn members_of(&self, group_id: GroupId) -> Vec<HostId> {
        self.members
            .read()
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn member_count(&self, group_id: GroupId) -> usize {
        self.members.read().get(&group_id).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonTable;
    use std::collections::BTreeMap;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn group(name: &str) -> Group {
        Group {
            id: Uuid::new_v4(),
            name: name.into(),
            script_ids: vec![],
            environment: BTreeMap::new(),
        }
    }

    fn host(name: &str, groups: Vec<GroupId>) -> Host {
        Host {
            id: Uuid::new_v4(),
            name: name.into(),
            address: format!("{name}.lan"),
            port: 7022,
            enabled: true,
            psk: String::new(),
            group_ids: groups,
            trust: Default::default(),
            environment: BTreeMap::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    struct FailingStore;

    impl EntityStore<Host> for FailingStore {
        fn get(&self, _: Uuid) -> Result<Option<Host>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        fn get_all(&self, _: bool) -> Result<Vec<Host>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        fn get_by_unique(&self, _: &str, _: &str) -> Result<Option<Host>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        fn get_by_index(&self, _: &str, _: &str) -> Result<Vec<Host>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        fn add(&self, _: Host) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        fn update(&self, _: Host) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        fn delete(&self, _: Uuid) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    #[test]
    fn test_rebuild_seeds_empty_groups_and_indexes_hosts() {
        let groups = JsonTable::<Group>::in_memory();
        let hosts = JsonTable::<Host>::in_memory();
        let web = group("web");
        let empty = group("empty");
        groups.add(web.clone()).unwrap();
        groups.add(empty.clone()).unwrap();
        let a = host("a", vec![web.id]);
        let b = host("b", vec![web.id, web.id]);
        hosts.add(a.clone()).unwrap();
        hosts.add(b.clone()).unwrap();

        let cache = MembershipCache::new();
        cache.rebuild(&groups, &hosts).unwrap();

        assert_eq!(cache.members_of(web.id), vec![a.id, b.id]);
        assert!(cache.members_of(empty.id).is_empty());
        assert!(cache.members_of(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_rebuild_drops_stale_entries() {
        let groups = JsonTable::<Group>::in_memory();
        let hosts = JsonTable::<Host>::in_memory();
        let web = group("web");
        groups.add(web.clone()).unwrap();
        let mut a = host("a", vec![web.id]);
        hosts.add(a.clone()).unwrap();

        let cache = MembershipCache::new();
        cache.rebuild(&groups, &hosts).unwrap();
        assert_eq!(cache.member_count(web.id), 1);

        a.group_ids.clear();
        hosts.update(a).unwrap();
        cache.rebuild(&groups, &hosts).unwrap();
        assert_eq!(cache.member_count(web.id), 0);
    }

    #[test]
    fn test_rebuild_failure_keeps_error() {
        let groups = JsonTable::<Group>::in_memory();
        let cache = MembershipCache::new();
        assert!(matches!(
            cache.rebuild(&groups, &FailingStore),
            Err(StoreError::Unavailable(_))
        ));
    }
}
