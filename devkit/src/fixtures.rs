/*!
Builders d'entrées pour les tests

Valeurs par défaut réalistes pour chaque formulaire du kernel ; les tests
ne précisent que ce qui compte pour eux.
*/

use symbion_fleet::inventory::{GroupInput, HostInput, ScriptInput};
use symbion_fleet::models::{GroupId, HostId, HostProperties, ScriptId};
use symbion_fleet::registration::{ClauseInput, RegistrationRequest, RuleInput};
use symbion_fleet::schedules::{ScheduleInput, ScopeInput};

pub const AGENT_PORT: u16 = 7022;

pub struct FleetFixtures;

impl FleetFixtures {
    pub fn host<S: Into<String>>(name: S, address: S, group_ids: Vec<GroupId>) -> HostInput {
        HostInput {
            name: name.into(),
            address: address.into(),
            port: AGENT_PORT,
            psk: None,
            group_ids,
            environment: Default::default(),
            enabled: true,
        }
    }

    pub fn group<S: Into<String>>(name: S) -> GroupInput {
        GroupInput {
            name: name.into(),
            ..GroupInput::default()
        }
    }

    pub fn script<S: Into<String>>(name: S, content: S) -> ScriptInput {
        ScriptInput {
            name: name.into(),
            content: content.into(),
            ..ScriptInput::default()
        }
    }

    /// Planification toutes les minutes sur des groupes
    pub fn schedule_on_groups<S: Into<String>>(
        name: S,
        script_id: ScriptId,
        group_ids: Vec<GroupId>,
    ) -> ScheduleInput {
        ScheduleInput {
            name: name.into(),
            script_id,
            scope: ScopeInput {
                group_ids,
                host_ids: vec![],
            },
            pattern: "* * * * *".into(),
            enabled: true,
        }
    }

    pub fn schedule_on_hosts<S: Into<String>>(
        name: S,
        script_id: ScriptId,
        host_ids: Vec<HostId>,
    ) -> ScheduleInput {
        ScheduleInput {
            name: name.into(),
            script_id,
            scope: ScopeInput {
                group_ids: vec![],
                host_ids,
            },
            pattern: "* * * * *".into(),
            enabled: true,
        }
    }

    /// Règle à clauses `(propriété, regex)`
    pub fn rule<S: Into<String>>(name: S, clauses: &[(&str, &str)], group_id: GroupId) -> RuleInput {
        RuleInput {
            name: name.into(),
            clauses: clauses
                .iter()
                .map(|(property, pattern)| ClauseInput {
                    property: property.to_string(),
                    pattern: pattern.to_string(),
                })
                .collect(),
            group_id,
        }
    }

    /// Propriétés d'un Debian 12 standard
    pub fn properties<S: Into<String>>(hostname: S) -> HostProperties {
        HostProperties {
            hostname: hostname.into(),
            kernel_name: "Linux".into(),
            kernel_version: "6.1.0-18-amd64".into(),
            distribution_name: "debian".into(),
            distribution_version: "12".into(),
        }
    }

    pub fn registration<S: Into<String>>(
        properties: HostProperties,
        address: S,
        shared_key: S,
    ) -> RegistrationRequest {
        RegistrationRequest {
            properties,
            address: address.into(),
            port: AGENT_PORT,
            shared_key: shared_key.into(),
        }
    }
}
