//! Self-registration of agents and the rules that place them in groups.

use crate::classifier::{validate_pattern, RegistrationClassifier};
use crate::error::{FleetError, Result};
use crate::inventory::{HostInput, Inventory};
use crate::models::{GroupId, HostId, HostProperties, RegisterRule, RuleClause, RuleId, RuleProperty};
use crate::store::EntityStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

/// Clause telle que saisie ; la propriété est validée contre l'énumération fermée
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClauseInput {
    pub property: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleInput {
    pub name: String,
    pub clauses: Vec<ClauseInput>,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub properties: HostProperties,
    pub address: String,
    pub port: u16,
    pub shared_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub group_id: GroupId,
    pub host_id: HostId,
    pub psk: String,
}

pub struct Registrar {
    rules: Arc<dyn EntityStore<RegisterRule>>,
    inventory: Arc<Inventory>,
    classifier: RegistrationClassifier,
    shared_key: Option<String>,
}

impl Registrar {
    /// Sans clé partagée, l'auto-enregistrement est refusé
    pub fn new(
        rules: Arc<dyn EntityStore<RegisterRule>>,
        inventory: Arc<Inventory>,
        shared_key: Option<String>,
    ) -> Self {
        Self {
            rules,
            inventory,
            classifier: RegistrationClassifier::new(),
            shared_key: shared_key.filter(|k| !k.is_empty()),
        }
    }

    fn validate(&self, input: &RuleInput) -> Result<Vec<RuleClause>> {
        if input.name.trim().is_empty() {
            return Err(FleetError::InvalidRule("name must not be empty".into()));
        }
        if input.clauses.is_empty() {
            return Err(FleetError::InvalidRule("at least one clause is required".into()));
        }
        self.inventory.group(input.group_id)?;

        input
            .clauses
            .iter()
            .map(|clause| {
                let property: RuleProperty =
                    clause.property.parse().map_err(FleetError::InvalidRule)?;
                validate_pattern(&clause.pattern).map_err(|e| {
                    FleetError::InvalidRule(format!("pattern '{}': {e}", clause.pattern))
                })?;
                Ok(RuleClause {
                    property,
                    pattern: clause.pattern.clone(),
                })
            })
            .collect()
    }

    pub fn rule(&self, rule_id: RuleId) -> Result<RegisterRule> {
        self.rules.get(rule_id)?.ok_or(FleetError::NotFound {
            kind: "register_rule",
            id: rule_id,
        })
    }

    /// Règles dans l'ordre d'évaluation (ordre de création)
    pub fn rules(&self) -> Result<Vec<RegisterRule>> {
        Ok(self.rules.get_all(false)?)
    }

    pub fn create_rule(&self, input: RuleInput) -> Result<RegisterRule> {
        let rule = self.inventory.with_write_lock(|| {
            let clauses = self.validate(&input)?;
            let rule = RegisterRule {
                id: Uuid::new_v4(),
                name: input.name,
                clauses,
                group_id: input.group_id,
            };
            self.rules.add(rule.clone())?;
            Ok::<_, FleetError>(rule)
        })?;
        info!(rule_id = %rule.id, name = %rule.name, "registration rule created");
        Ok(rule)
    }

    pub fn update_rule(&self, rule_id: RuleId, input: RuleInput) -> Result<RegisterRule> {
        let rule = self.inventory.with_write_lock(|| {
            let mut rule = self.rule(rule_id)?;
            rule.clauses = self.validate(&input)?;
            rule.name = input.name;
            rule.group_id = input.group_id;
            self.rules.update(rule.clone())?;
            Ok::<_, FleetError>(rule)
        })?;
        info!(%rule_id, "registration rule updated");
        Ok(rule)
    }

    pub fn delete_rule(&self, rule_id: RuleId) -> Result<()> {
        self.rules.delete(rule_id)?;
        info!(%rule_id, "registration rule deleted");
        Ok(())
    }

    fn key_matches(&self, presented: &str) -> bool {
        match &self.shared_key {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(presented.as_bytes())),
            None => false,
        }
    }

    /// Crée l'hôte d'un agent qui s'annonce et le place dans un groupe
    pub fn register_host(&self, request: RegistrationRequest) -> Result<Registration> {
        if self.shared_key.is_none() {
            return Err(FleetError::RegistrationRefused("self-registration is disabled".into()));
        }
        if !self.key_matches(&request.shared_key) {
            warn!(address = %request.address, "registration with wrong shared key");
            return Err(FleetError::RegistrationRefused("invalid shared key".into()));
        }
        if request.properties.hostname.trim().is_empty() {
            return Err(FleetError::Validation("hostname must not be empty".into()));
        }
        let default_group = self.inventory.default_group().ok_or_else(|| {
            FleetError::RegistrationRefused("no default registration group".into())
        })?;

        let rules = self.rules()?;
        let group_id = self
            .classifier
            .classify(&rules, &request.properties, default_group);

        let host = self.inventory.create_host(HostInput {
            name: request.properties.hostname.clone(),
            address: request.address,
            port: request.port,
            psk: None,
            group_ids: vec![group_id],
            environment: Default::default(),
            enabled: true,
        })?;

        info!(
            host_id = %host.id,
            hostname = %host.name,
            %group_id,
            "agent registered"
        );
        Ok(Registration {
            group_id,
            host_id: host.id,
            psk: host.psk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::GroupInput;
    use crate::membership::MembershipCache;
    use crate::models::{Group, Host, Schedule, Script};
    use crate::reachability::ReachabilityTracker;
    use crate::store::JsonTable;
    use parking_lot::Mutex;

    fn setup(key: Option<&str>) -> (Registrar, Arc<Inventory>) {
        let rules: Arc<JsonTable<RegisterRule>> = Arc::new(JsonTable::in_memory());
        let inventory = Arc::new(Inventory::new(
            Arc::new(JsonTable::<Host>::in_memory()),
            Arc::new(JsonTable::<Group>::in_memory()),
            Arc::new(JsonTable::<Script>::in_memory()),
            rules.clone(),
            Arc::new(JsonTable::<Schedule>::in_memory()),
            Arc::new(MembershipCache::new()),
            Arc::new(ReachabilityTracker::new()),
            Arc::new(Mutex::new(())),
        ));
        inventory.ensure_default_group("unassigned").unwrap();
        let registrar = Registrar::new(rules, inventory.clone(), key.map(str::to_string));
        (registrar, inventory)
    }

    fn request(hostname: &str, address: &str, key: &str) -> RegistrationRequest {
        RegistrationRequest {
            properties: HostProperties {
                hostname: hostname.into(),
                kernel_name: "Linux".into(),
                kernel_version: "6.6".into(),
                distribution_name: "debian".into(),
                distribution_version: "12".into(),
            },
            address: address.into(),
            port: 7022,
            shared_key: key.into(),
        }
    }

    fn clause(property: &str, pattern: &str) -> ClauseInput {
        ClauseInput { property: property.into(), pattern: pattern.into() }
    }

    #[test]
    fn test_rule_validation() {
        let (registrar, inventory) = setup(Some("k"));
        let g = inventory.default_group().unwrap();
        let bad_prop = RuleInput { name: "r".into(), clauses: vec![clause("cpu", "x")], group_id: g };
        assert!(matches!(registrar.create_rule(bad_prop), Err(FleetError::InvalidRule(_))));
        let bad_re = RuleInput { name: "r".into(), clauses: vec![clause("hostname", "(")], group_id: g };
        assert!(matches!(registrar.create_rule(bad_re), Err(FleetError::InvalidRule(_))));
        let bad_group = RuleInput {
            name: "r".into(),
            clauses: vec![clause("hostname", "x")],
            group_id: Uuid::new_v4(),
        };
        assert!(matches!(registrar.create_rule(bad_group), Err(FleetError::NotFound { .. })));
        assert!(registrar.rules().unwrap().is_empty());
    }

    #[test]
    fn test_registration_uses_rules_then_default() {
        let (registrar, inventory) = setup(Some("s3cret"));
        let web = inventory
            .create_group(GroupInput { name: "web".into(), ..GroupInput::default() })
            .unwrap();
        registrar
            .create_rule(RuleInput {
                name: "web hosts".into(),
                clauses: vec![clause("hostname", "^web-")],
                group_id: web.id,
            })
            .unwrap();

        let r1 = registrar.register_host(request("web-01", "10.0.0.1", "s3cret")).unwrap();
        assert_eq!(r1.group_id, web.id);
        assert!(!r1.psk.is_empty());
        assert_eq!(inventory.members_of(web.id), vec![r1.host_id]);

        let r2 = registrar.register_host(request("db-01", "10.0.0.2", "s3cret")).unwrap();
        assert_eq!(Some(r2.group_id), inventory.default_group());
    }

    #[test]
    fn test_rule_creation_and_group_deletion_are_serialized() {
        let (registrar, inventory) = setup(Some("k"));
        for round in 0..50 {
            let g = inventory
                .create_group(GroupInput { name: format!("g{round}"), ..GroupInput::default() })
                .unwrap();
            let input = RuleInput {
                name: format!("r{round}"),
                clauses: vec![clause("hostname", "^web")],
                group_id: g.id,
            };
            let (created, deleted) = std::thread::scope(|s| {
                let create = s.spawn(|| registrar.create_rule(input));
                let delete = s.spawn(|| inventory.delete_group(g.id));
                (create.join().unwrap(), delete.join().unwrap())
            });
            match (created, deleted) {
                (Ok(rule), Err(FleetError::GroupInUse { .. })) => registrar.delete_rule(rule.id).unwrap(),
                (Err(FleetError::NotFound { kind: "group", .. }), Ok(())) => {}
                other => panic!("round {round}: inconsistent outcome {other:?}"),
            }
        }
        assert!(registrar.rules().unwrap().is_empty());
    }

    #[test]
    fn test_registration_refusals() {
        let (registrar, _) = setup(Some("s3cret"));
        assert!(matches!(
            registrar.register_host(request("web-01", "10.0.0.1", "guess")),
            Err(FleetError::RegistrationRefused(_))
        ));
        registrar.register_host(request("web-01", "10.0.0.1", "s3cret")).unwrap();
        assert!(matches!(
            registrar.register_host(request("web-01", "10.0.0.9", "s3cret")),
            Err(FleetError::Duplicate { field: "name", .. })
        ));

        let (closed, _) = setup(None);
        assert!(matches!(
            closed.register_host(request("x", "10.0.0.3", "")),
            Err(FleetError::RegistrationRefused(_))
        ));
    }
}
