/**
 * MODÈLES FLEET - Entités persistées du plan de contrôle
 *
 * RÔLE : Hôtes, groupes, scripts, règles d'enregistrement, planifications et
 * rapports d'exécution. Ces structures sont écrites telles quelles en JSON
 * (data/<type>.json) et relues au redémarrage : les noms de champs sont stables.
 *
 * RELATIONS :
 * - Host.group_ids → Group (many-to-many par back-reference côté hôte)
 * - Group.script_ids → Script
 * - Schedule.scope → groupes OU hôtes, jamais les deux
 * - RegisterRule.group_id → Group cible de la classification
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

pub type HostId = Uuid;
pub type GroupId = Uuid;
pub type ScriptId = Uuid;
pub type ScheduleId = Uuid;
pub type RuleId = Uuid;
pub type ReportId = Uuid;

/// Variables d'environnement (ordre déterministe pour les rapports et les tests)
pub type Environment = BTreeMap<String, String>;

/// Code résultat d'un hôte qui n'a pas pu exécuter le script
/// (erreur transport, hôte supprimé, hôte ignoré en pré-vol)
pub const HOST_RESULT_NOT_RUN: i32 = -1;

/// Identité cryptographique présentée par un agent, telle que suivie par le kernel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTrust {
    /// Identité acceptée par un administrateur (vide = jamais approuvée)
    pub trusted_identity: String,
    /// Dernière identité présentée qui n'est pas l'identité approuvée
    pub untrusted_identity: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_trust_update: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub enabled: bool,
    /// Secret partagé utilisé par le transport, opaque pour le kernel
    pub psk: String,
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub trust: HostTrust,
    #[serde(default)]
    pub environment: Environment,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub script_ids: Vec<ScriptId>,
    #[serde(default)]
    pub environment: Environment,
}

/// Action envoyée à l'agent après un script réussi
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostAction {
    Reboot,
    ExitAgent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub id: ScriptId,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub post_action: Option<PostAction>,
}

/// Résultat structuré renvoyé par le transport pour une exécution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Dernière tentative de contact d'une adresse.
///
/// Indexé par adresse et non par ID d'hôte : survit à un delete + re-register,
/// mais fusionne l'historique de deux hôtes successifs partageant une adresse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub address: String,
    pub is_reachable: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_reply: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_attempt: OffsetDateTime,
}

/// Propriétés rapportées par un agent à l'enregistrement (énumération fermée)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleProperty {
    Hostname,
    KernelName,
    KernelVersion,
    DistributionName,
    DistributionVersion,
}

impl RuleProperty {
    pub const ALL: [RuleProperty; 5] = [
        RuleProperty::Hostname,
        RuleProperty::KernelName,
        RuleProperty::KernelVersion,
        RuleProperty::DistributionName,
        RuleProperty::DistributionVersion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleProperty::Hostname => "hostname",
            RuleProperty::KernelName => "kernel_name",
            RuleProperty::KernelVersion => "kernel_version",
            RuleProperty::DistributionName => "distribution_name",
            RuleProperty::DistributionVersion => "distribution_version",
        }
    }
}

impl fmt::Display for RuleProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleProperty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleProperty::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown property '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleClause {
    pub property: RuleProperty,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRule {
    pub id: RuleId,
    pub name: String,
    pub clauses: Vec<RuleClause>,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProperties {
    pub hostname: String,
    pub kernel_name: String,
    pub kernel_version: String,
    pub distribution_name: String,
    pub distribution_version: String,
}

impl HostProperties {
    pub fn get(&self, property: RuleProperty) -> &str {
        match property {
            RuleProperty::Hostname => &self.hostname,
            RuleProperty::KernelName => &self.kernel_name,
            RuleProperty::KernelVersion => &self.kernel_version,
            RuleProperty::DistributionName => &self.distribution_name,
            RuleProperty::DistributionVersion => &self.distribution_version,
        }
    }
}

/// Cible d'une planification : exactement un des deux types, non vide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum ScheduleScope {
    Groups(Vec<GroupId>),
    Hosts(Vec<HostId>),
}

impl ScheduleScope {
    pub fn group_ids(&self) -> &[GroupId] {
        match self {
            ScheduleScope::Groups(ids) => ids,
            ScheduleScope::Hosts(_) => &[],
        }
    }

    pub fn host_ids(&self) -> &[HostId] {
        match self {
            ScheduleScope::Groups(_) => &[],
            ScheduleScope::Hosts(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub script_id: ScriptId,
    pub scope: ScheduleScope,
    /// Motif cron 5 champs (minute heure jour-du-mois mois jour-de-semaine)
    pub pattern: String,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_run_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleResult {
    Success,
    PartialSuccess,
    Fail,
}

/// Trace immuable d'une exécution de planification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub id: ReportId,
    pub schedule_id: ScheduleId,
    pub host_ids: Vec<HostId>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub elapsed_secs: f64,
    pub host_results: BTreeMap<HostId, i32>,
    pub result: ScheduleResult,
}
