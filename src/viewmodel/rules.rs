//! Per-property validation rules, merged from metadata and instance
//! overrides.

use crate::metadata::Property;
use crate::model::FieldValue;
use std::collections::HashMap;
use std::sync::Arc;

/// One validation check. Standard rules carry their parameters; custom
/// rules return an error message or None to pass.
#[derive(Clone)]
pub enum Rule {
    Required,
    MinLength(u32),
    MaxLength(u32),
    Pattern(regex::Regex),
    Min(f64),
    Max(f64),
    Custom(Arc<dyn Fn(&FieldValue) -> Option<String> + Send + Sync>),
}

/// Identifiers under which metadata rules register. An instance override
/// with the same identifier replaces the declared rule.
fn metadata_rules(prop: &Property) -> Vec<(String, Rule)> {
    let mut out = Vec::new();
    let rules = &prop.rules;
    if rules.required {
        out.push(("required".to_string(), Rule::Required));
    }
    if let Some(n) = rules.min_length {
        out.push(("minLength".to_string(), Rule::MinLength(n)));
    }
    if let Some(n) = rules.max_length {
        out.push(("maxLength".to_string(), Rule::MaxLength(n)));
    }
    if let Some(re) = &rules.pattern {
        out.push(("pattern".to_string(), Rule::Pattern(re.clone())));
    }
    if let Some(n) = rules.minimum {
        out.push(("min".to_string(), Rule::Min(n)));
    }
    if let Some(n) = rules.maximum {
        out.push(("max".to_string(), Rule::Max(n)));
    }
    out
}

enum RuleOverride {
    Set(Rule),
    Remove,
}

/// Instance-level rule adjustments with a memo of merged results.
#[derive(Default)]
pub(crate) struct RuleOverrides {
    entries: HashMap<String, Vec<(String, RuleOverride)>>,
    cache: HashMap<String, Arc<Vec<(String, Rule)>>>,
}

impl RuleOverrides {
    pub fn add(&mut self, prop: &str, identifier: &str, rule: Rule) {
        let overrides = self.entries.entry(prop.to_string()).or_default();
        overrides.retain(|(id, _)| id != identifier);
        overrides.push((identifier.to_string(), RuleOverride::Set(rule)));
        self.cache.remove(prop);
    }

    pub fn remove(&mut self, prop: &str, identifier: &str) {
        let overrides = self.entries.entry(prop.to_string()).or_default();
        overrides.retain(|(id, _)| id != identifier);
        overrides.push((identifier.to_string(), RuleOverride::Remove));
        self.cache.remove(prop);
    }

    /// The merged rule list for one property, memoized until the next
    /// override change.
    pub fn effective(&mut self, prop: &Property) -> Arc<Vec<(String, Rule)>> {
        if let Some(hit) = self.cache.get(prop.name()) {
            return hit.clone();
        }
        let mut rules = metadata_rules(prop);
        if let Some(overrides) = self.entries.get(prop.name()) {
            for (id, ov) in overrides {
                rules.retain(|(rid, _)| rid != id);
                if let RuleOverride::Set(rule) = ov {
                    rules.push((id.clone(), rule.clone()));
                }
            }
        }
        let merged = Arc::new(rules);
        self.cache.insert(prop.name().to_string(), merged.clone());
        merged
    }
}

/// Evaluate one rule against a value. `satisfied_elsewhere` marks a null
/// that another source will fill, like a foreign key backed by a loaded
/// navigation object.
pub(crate) fn evaluate(
    rule: &Rule,
    display_name: &str,
    value: &FieldValue,
    satisfied_elsewhere: bool,
) -> Option<String> {
    if let Rule::Required = rule {
        let missing = match value {
            FieldValue::Null => !satisfied_elsewhere,
            FieldValue::String(s) => s.is_empty(),
            _ => false,
        };
        return missing.then(|| format!("{} is required", display_name));
    }
    // Null passes every non-required check.
    if value.is_null() {
        return None;
    }
    match rule {
        Rule::Required => None,
        Rule::MinLength(n) => value.as_str().and_then(|s| {
            (s.len() < *n as usize)
                .then(|| format!("{} must be at least {} characters", display_name, n))
        }),
        Rule::MaxLength(n) => value.as_str().and_then(|s| {
            (s.len() > *n as usize)
                .then(|| format!("{} must be at most {} characters", display_name, n))
        }),
        Rule::Pattern(re) => value.as_str().and_then(|s| {
            (!re.is_match(s)).then(|| format!("{} does not match required pattern", display_name))
        }),
        Rule::Min(min) => value.as_f64().and_then(|n| {
            (n < *min).then(|| format!("{} must be at least {}", display_name, min))
        }),
        Rule::Max(max) => value.as_f64().and_then(|n| {
            (n > *max).then(|| format!("{} must be at most {}", display_name, max))
        }),
        Rule::Custom(check) => check(value),
    }
}
