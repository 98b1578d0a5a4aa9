/**
 * ENTITY STORE - Stockage CRUD des entités Fleet
 *
 * RÔLE :
 * Interface commune (get / get_all / index unique / index secondaire / add /
 * update / delete) que le kernel consomme pour chaque type d'entité.
 *
 * FONCTIONNEMENT :
 * - EntityStore<T> = trait consommé par les services (injecté en Arc<dyn ...>)
 * - JsonTable<T> = implémentation par défaut : cache mémoire Vec<T> (ordre
 *   d'insertion conservé) + miroir JSON réécrit à chaque écriture
 * - Les contraintes d'unicité déclarées par l'entité sont vérifiées ici
 */

use crate::models::{Group, Host, RegisterRule, Schedule, ScheduleReport, Script};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Erreurs possibles lors des opérations de stockage
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} with {field} '{value}' already exists")]
    Duplicate {
        kind: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("corrupt {kind} table at {path:?}: {source}")]
    Corrupt {
        kind: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Entité stockable : identité, clés uniques et index secondaires
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Nom du type, utilisé dans les erreurs et comme nom de fichier
    const KIND: &'static str;

    fn id(&self) -> Uuid;

    /// Paires (champ, valeur) qui doivent être uniques dans la table
    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Paires (champ, valeur) indexées ; un champ peut apparaître plusieurs fois
    fn index_keys(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Clé de tri pour `get_all(true)`
    fn sort_key(&self) -> String;
}

pub trait EntityStore<T: Entity>: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Option<T>, StoreError>;
    /// Toutes les entités ; ordre d'insertion sauf si `sorted`
    fn get_all(&self, sorted: bool) -> Result<Vec<T>, StoreError>;
    fn get_by_unique(&self, field: &str, value: &str) -> Result<Option<T>, StoreError>;
    fn get_by_index(&self, field: &str, value: &str) -> Result<Vec<T>, StoreError>;
    fn add(&self, entity: T) -> Result<(), StoreError>;
    fn update(&self, entity: T) -> Result<(), StoreError>;
    fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Table JSON : cache mémoire + fichier miroir optionnel
pub struct JsonTable<T: Entity> {
    rows: RwLock<Vec<T>>,
    storage_path: Option<PathBuf>,
}

impl<T: Entity> JsonTable<T> {
    /// Table purement mémoire (tests, outils)
    pub fn in_memory() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            storage_path: None,
        }
    }

    /// Ouvre (ou crée) la table `<data_dir>/<kind>.json`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let path = data_dir.as_ref().join(format!("{}.json", T::KIND));
        if !path.exists() {
            fs::write(&path, "[]")?;
        }
        let content = fs::read_to_string(&path)?;
        let rows: Vec<T> = serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            kind: T::KIND,
            path: path.clone(),
            source,
        })?;
        info!(kind = T::KIND, count = rows.len(), path = ?path, "table loaded");
        Ok(Self {
            rows: RwLock::new(rows),
            storage_path: Some(path),
        })
    }

    fn save_to_disk(&self, rows: &[T]) -> Result<(), StoreError> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(rows)?;
        // écriture atomique : fichier temporaire puis rename
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn check_unique(rows: &[T], entity: &T) -> Result<(), StoreError> {
        for (field, value) in entity.unique_keys() {
            let clash = rows.iter().any(|other| {
                other.id() != entity.id()
                    && other
                        .unique_keys()
                        .iter()
                        .any(|(f, v)| *f == field && *v == value)
            });
            if clash {
                return Err(StoreError::Duplicate {
                    kind: T::KIND,
                    field,
                    value,
                });
            }
        }
        Ok(())
    }
}

impl<T: Entity> EntityStore<T> for JsonTable<T> {
    fn get(&self, id: Uuid) -> Result<Option<T>, StoreError> {
        Ok(self.rows.read().iter().find(|row| row.id() == id).cloned())
    }

    fn get_all(&self, sorted: bool) -> Result<Vec<T>, StoreError> {
        let mut rows = self.rows.read().clone();
        if sorted {
            rows.sort_by_key(|row| row.sort_key());
        }
        Ok(rows)
    }

    fn get_by_unique(&self, field: &str, value: &str) -> Result<Option<T>, StoreError> {
        Ok(self
            .rows
            .read()
            .iter()
            .find(|row| row.unique_keys().iter().any(|(f, v)| *f == field && v == value))
            .cloned())
    }

    fn get_by_index(&self, field: &str, value: &str) -> Result<Vec<T>, StoreError> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|row| row.index_keys().iter().any(|(f, v)| *f == field && v == value))
            .cloned()
            .collect())
    }

    fn add(&self, entity: T) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        if rows.iter().any(|row| row.id() == entity.id()) {
            return Err(StoreError::Duplicate {
                kind: T::KIND,
                field: "id",
                value: entity.id().to_string(),
            });
        }
        Self::check_unique(&rows, &entity)?;
        let id = entity.id();
        rows.push(entity);
        if let Err(e) = self.save_to_disk(&rows) {
            rows.pop();
            return Err(e);
        }
        debug!(kind = T::KIND, %id, "entity added");
        Ok(())
    }

    fn update(&self, entity: T) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let id = entity.id();
        let Some(pos) = rows.iter().position(|row| row.id() == id) else {
            return Err(StoreError::NotFound { kind: T::KIND, id });
        };
        Self::check_unique(&rows, &entity)?;
        let previous = std::mem::replace(&mut rows[pos], entity);
        if let Err(e) = self.save_to_disk(&rows) {
            rows[pos] = previous;
            return Err(e);
        }
        debug!(kind = T::KIND, %id, "entity updated");
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let Some(pos) = rows.iter().position(|row| row.id() == id) else {
            return Err(StoreError::NotFound { kind: T::KIND, id });
        };
        let removed = rows.remove(pos);
        if let Err(e) = self.save_to_disk(&rows) {
            rows.insert(pos, removed);
            return Err(e);
        }
        debug!(kind = T::KIND, %id, "entity deleted");
        Ok(())
    }
}

impl Entity for Host {
    const KIND: &'static str = "host";

    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![("name", self.name.clone()), ("address", self.address.clone())]
    }

    fn index_keys(&self) -> Vec<(&'static str, String)> {
        self.group_ids
            .iter()
            .map(|id| ("group_id", id.to_string()))
            .collect()
    }

    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

impl Entity for Group {
    const KIND: &'static str = "group";

    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![("name", self.name.clone())]
    }

    fn index_keys(&self) -> Vec<(&'static str, String)> {
        self.script_ids
            .iter()
            .map(|id| ("script_id", id.to_string()))
            .collect()
    }

    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

impl Entity for Script {
    const KIND: &'static str = "script";

    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![("name", self.name.clone())]
    }

    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

impl Entity for RegisterRule {
    const KIND: &'static str = "register_rule";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<(&'static str, String)> {
        vec![("group_id", self.group_id.to_string())]
    }

    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

impl Entity for Schedule {
    const KIND: &'static str = "schedule";

    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![("name", self.name.clone())]
    }

    fn index_keys(&self) -> Vec<(&'static str, String)> {
        let mut keys = vec![("script_id", self.script_id.to_string())];
        keys.extend(
            self.scope
                .group_ids()
                .iter()
                .map(|id| ("scope_group_id", id.to_string())),
        );
        keys.extend(
            self.scope
                .host_ids()
                .iter()
                .map(|id| ("scope_host_id", id.to_string())),
        );
        keys
    }

    fn sort_key(&self) -> String {
        self.name.clone()
    }
}

impl Entity for ScheduleReport {
    const KIND: &'static str = "schedule_report";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<(&'static str, String)> {
        vec![("schedule_id", self.schedule_id.to_string())]
    }

    fn sort_key(&self) -> String {
        // RFC 3339 UTC se trie lexicographiquement
        self.started_at
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use time::OffsetDateTime;

    fn group(name: &str) -> Group {
        Group {
            id: Uuid::new_v4(),
            name: name.to_string(),
            script_ids: vec![],
            environment: BTreeMap::new(),
        }
    }

    fn host(name: &str, address: &str, groups: Vec<Uuid>) -> Host {
        Host {
            id: Uuid::new_v4(),
            name: name.to_string(),
            address: address.to_string(),
            port: 7022,
            enabled: true,
            psk: "psk".to_string(),
            group_ids: groups,
            trust: Default::default(),
            environment: BTreeMap::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_unique_constraints_on_add_and_update() {
        let table = JsonTable::<Host>::in_memory();
        let a = host("web-1", "10.0.0.1", vec![]);
        table.add(a.clone()).unwrap();

        let same_name = host("web-1", "10.0.0.2", vec![]);
        assert!(matches!(
            table.add(same_name),
            Err(StoreError::Duplicate { field: "name", .. })
        ));

        let b = host("web-2", "10.0.0.2", vec![]);
        table.add(b.clone()).unwrap();
        let mut moved = b.clone();
        moved.address = a.address.clone();
        assert!(matches!(
            table.update(moved),
            Err(StoreError::Duplicate { field: "address", .. })
        ));
        assert_eq!(table.get(b.id).unwrap().unwrap().address, "10.0.0.2");
    }

    #[test]
    fn test_secondary_index_and_insertion_order() {
        let table = JsonTable::<Host>::in_memory();
        let g = Uuid::new_v4();
        table.add(host("zeta", "10.0.0.3", vec![g])).unwrap();
        table.add(host("alpha", "10.0.0.4", vec![])).unwrap();
        table.add(host("mid", "10.0.0.5", vec![g])).unwrap();

        let in_group = table.get_by_index("group_id", &g.to_string()).unwrap();
        assert_eq!(in_group.len(), 2);

        let names: Vec<_> = table.get_all(false).unwrap().into_iter().map(|h| h.name).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
        let sorted: Vec<_> = table.get_all(true).unwrap().into_iter().map(|h| h.name).collect();
        assert_eq!(sorted, ["alpha", "mid", "zeta"]);

        let found = table.get_by_unique("address", "10.0.0.4").unwrap().unwrap();
        assert_eq!(found.name, "alpha");
    }

    #[test]
    fn test_table_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ops = group("ops");
        {
            let table = JsonTable::<Group>::open(dir.path()).unwrap();
            table.add(ops.clone()).unwrap();
            table.add(group("web")).unwrap();
            table.delete(ops.id).unwrap();
        }
        let reopened = JsonTable::<Group>::open(dir.path()).unwrap();
        let all = reopened.get_all(false).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "web");
    }

    #[test]
    fn test_corrupt_table_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("group.json"), "{not json").unwrap();
        assert!(matches!(
            JsonTable::<Group>::open(dir.path()),
            Err(StoreError::Corrupt { kind: "group", .. })
        ));
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let table = JsonTable::<Group>::in_memory();
        assert!(matches!(
            table.delete(Uuid::new_v4()),
            Err(StoreError::NotFound { kind: "group", .. })
        ));
    }
}
