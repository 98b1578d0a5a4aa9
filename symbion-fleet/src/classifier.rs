/**
 * REGISTRATION CLASSIFIER - Affectation d'un agent auto-enregistré à un groupe
 *
 * Règles évaluées dans l'ordre de création, toutes les clauses doivent
 * matcher (recherche regex non ancrée), la première règle complète gagne,
 * sinon le groupe par défaut. Les regex compilées sont mises en cache.
 */

use crate::models::{GroupId, HostProperties, RegisterRule};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Default)]
pub struct RegistrationClassifier {
    compiled: Mutex<HashMap<String, Regex>>,
}

impl RegistrationClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Motif compilé (None si invalide, jamais mis en cache dans ce cas)
    fn pattern(&self, raw: &str) -> Option<Regex> {
        if let Some(re) = self.compiled.lock().get(raw) {
            return Some(re.clone());
        }
        match Regex::new(raw) {
            Ok(re) => {
                self.compiled.lock().insert(raw.to_string(), re.clone());
                Some(re)
            }
            Err(e) => {
                warn!(pattern = raw, error = %e, "rule pattern does not compile");
                None
            }
        }
    }

    fn rule_matches(&self, rule: &RegisterRule, properties: &HostProperties) -> bool {
        rule.clauses.iter().all(|clause| match self.pattern(&clause.pattern) {
            Some(re) => re.is_match(properties.get(clause.property)),
            None => {
                warn!(rule = %rule.name, "skipping rule with invalid pattern");
                false
            }
        })
    }

    pub fn classify(
        &self,
        rules: &[RegisterRule],
        properties: &HostProperties,
        default_group: GroupId,
    ) -> GroupId {
        for rule in rules {
            if self.rule_matches(rule, properties) {
                debug!(rule = %rule.name, hostname = %properties.hostname, "registration rule matched");
                return rule.group_id;
            }
        }
        default_group
    }
}

/// Valide une regex de clause à la création/édition d'une règle
pub fn validate_pattern(raw: &str) -> Result<(), regex::Error> {
    Regex::new(raw).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RuleClause, RuleProperty};
    use uuid::Uuid;

    fn rule(name: &str, clauses: &[(RuleProperty, &str)], group: GroupId) -> RegisterRule {
        RegisterRule {
            id: Uuid::new_v4(),
            name: name.into(),
            clauses: clauses
                .iter()
                .map(|(property, pattern)| RuleClause {
                    property: *property,
                    pattern: pattern.to_string(),
                })
                .collect(),
            group_id: group,
        }
    }

    fn props(hostname: &str, distro: &str) -> HostProperties {
        HostProperties {
            hostname: hostname.into(),
            kernel_name: "Linux".into(),
            kernel_version: "6.1.0".into(),
            distribution_name: distro.into(),
            distribution_version: "12".into(),
        }
    }

    #[test]
    fn test_first_full_match_wins_in_order() {
        let (g1, g2, default) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let r1 = rule("web", &[(RuleProperty::Hostname, "^web")], g1);
        let r2 = rule("debian", &[(RuleProperty::DistributionName, "debian")], g2);
        let classifier = RegistrationClassifier::new();
        let p = props("web-03", "debian");

        assert_eq!(classifier.classify(&[r1.clone(), r2.clone()], &p, default), g1);
        assert_eq!(classifier.classify(&[r2, r1], &p, default), g2);
    }

    #[test]
    fn test_all_clauses_must_match() {
        let (g1, default) = (Uuid::new_v4(), Uuid::new_v4());
        let r = rule(
            "web-debian",
            &[(RuleProperty::Hostname, "web"), (RuleProperty::DistributionName, "debian")],
            g1,
        );
        let classifier = RegistrationClassifier::new();
        assert_eq!(classifier.classify(&[r.clone()], &props("web-1", "fedora"), default), default);
        assert_eq!(classifier.classify(&[r], &props("edge-web-1", "debian"), default), g1);
    }

    #[test]
    fn test_invalid_stored_pattern_skips_rule() {
        let (g1, g2, default) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let broken = rule("broken", &[(RuleProperty::Hostname, "web(")], g1);
        let fallback = rule("any", &[(RuleProperty::KernelName, "Linux")], g2);
        let classifier = RegistrationClassifier::new();
        assert_eq!(classifier.classify(&[broken, fallback], &props("web-1", "x"), default), g2);
        assert!(validate_pattern("web(").is_err());
    }

    #[test]
    fn test_no_rules_falls_back_to_default() {
        let default = Uuid::new_v4();
        let classifier = RegistrationClassifier::new();
        assert_eq!(classifier.classify(&[], &props("x", "y"), default), default);
    }
}
