//! Invalidation rules and change descriptions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Predicate deciding whether a rule applies to the supplied change data
pub type RuleCondition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A named recipe for what to invalidate
///
/// Applying a rule clears every tag in `tags`, then every SWR entry under the
/// prefix derived from `pattern`, then applies each rule named in `cascade`.
#[derive(Clone)]
pub struct InvalidationRule {
    pub name: String,
    pub pattern: Option<String>,
    pub tags: Vec<String>,
    pub condition: Option<RuleCondition>,
    pub cascade: Vec<String>,
}

impl fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("tags", &self.tags)
            .field("condition", &self.condition.as_ref().map(|_| "<fn>"))
            .field("cascade", &self.cascade)
            .finish()
    }
}

impl InvalidationRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: None,
            tags: Vec::new(),
            condition: None,
            cascade: Vec::new(),
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn cascade<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cascade = rules.into_iter().map(Into::into).collect();
        self
    }

    pub fn condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Whether the rule applies; rules without a condition, or calls
    /// without data, always apply
    pub fn applies_to(&self, data: Option<&Value>) -> bool {
        match (&self.condition, data) {
            (Some(condition), Some(data)) if !data.is_null() => condition(data),
            _ => true,
        }
    }

    /// SWR prefix cleared by this rule, if any
    pub fn clear_prefix(&self) -> Option<String> {
        self.pattern.as_deref().and_then(pattern_prefix)
    }

    pub fn summary(&self) -> RuleSummary {
        RuleSummary {
            name: self.name.clone(),
            pattern: self.pattern.clone(),
            tags: self.tags.clone(),
            cascade: self.cascade.clone(),
            conditional: self.condition.is_some(),
        }
    }
}

/// Serializable view of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSummary {
    pub name: String,
    pub pattern: Option<String>,
    pub tags: Vec<String>,
    pub cascade: Vec<String>,
    pub conditional: bool,
}

/// Derive the clear prefix from a pattern: `"obs:*"` becomes `"obs"`
///
/// Returns `None` when nothing remains, so a bare `"*"` never clears the
/// whole SWR namespace.
pub fn pattern_prefix(pattern: &str) -> Option<String> {
    let prefix = pattern.trim_end_matches('*').trim_end_matches(':');
    if prefix.is_empty() {
        None
    } else {
        Some(prefix.to_string())
    }
}

/// JSON truthiness: null, false, 0, "" and absent values are false
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |v| v != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Species changes only matter to observation lists when they carry media or text
fn species_has_content(data: &Value) -> bool {
    [Some(data), data.get("metadata")].into_iter().flatten().any(|d| {
        d.get("photos")
            .and_then(Value::as_array)
            .map_or(false, |photos| !photos.is_empty())
            || truthy(d.get("description"))
            || truthy(d.get("hasPhotos"))
            || truthy(d.get("hasDescription"))
    })
}

/// Rules installed on every new manager
pub fn default_rules() -> Vec<InvalidationRule> {
    vec![
        InvalidationRule::new("new-observations")
            .pattern("observations:*")
            .tags(["observations", "recent", "location-based"])
            .cascade(["user-stats", "dashboard-data"]),
        InvalidationRule::new("species-updates")
            .pattern("species:*")
            .tags(["species", "taxonomy"])
            .condition(species_has_content),
        InvalidationRule::new("user-activity")
            .pattern("user:*")
            .tags(["user-data", "achievements", "statistics"])
            .cascade(["dashboard-data"]),
        InvalidationRule::new("location-changes")
            .pattern("locations:*")
            .tags(["location-based", "geographic"]),
        InvalidationRule::new("dashboard-data")
            .pattern("dashboard:*")
            .tags(["dashboard", "statistics", "aggregated"]),
        InvalidationRule::new("static-data")
            .pattern("static:*")
            .tags(["countries", "regions", "groups", "challenges"]),
    ]
}

/// Kind of entity a change concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Observation,
    Species,
    User,
    Location,
    #[serde(other)]
    Unknown,
}

/// Description of a data change used to pick invalidation rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedData {
    #[serde(rename = "type")]
    pub kind: DataKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AffectedData {
    pub fn new(kind: DataKind) -> Self {
        Self {
            kind,
            id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Truthiness of a metadata field
    pub fn flag(&self, key: &str) -> bool {
        truthy(self.metadata.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pattern_prefix() {
        assert_eq!(pattern_prefix("observations:*").as_deref(), Some("observations"));
        assert_eq!(pattern_prefix("obs:*").as_deref(), Some("obs"));
        assert_eq!(pattern_prefix("obs").as_deref(), Some("obs"));
        assert_eq!(pattern_prefix("a:b:*").as_deref(), Some("a:b"));
        assert_eq!(pattern_prefix("*"), None);
        assert_eq!(pattern_prefix(""), None);
    }

    #[test]
    fn test_truthy() {
        assert!(!truthy(None));
        assert!(!truthy(Some(&json!(null))));
        assert!(!truthy(Some(&json!(false))));
        assert!(!truthy(Some(&json!(0))));
        assert!(!truthy(Some(&json!(""))));
        assert!(truthy(Some(&json!(true))));
        assert!(truthy(Some(&json!(12))));
        assert!(truthy(Some(&json!("yes"))));
        assert!(truthy(Some(&json!([]))));
    }

    #[test]
    fn test_condition() {
        let rule = InvalidationRule::new("r").condition(|d| d["ok"] == json!(true));
        assert!(rule.applies_to(Some(&json!({"ok": true}))));
        assert!(!rule.applies_to(Some(&json!({"ok": false}))));
        assert!(rule.applies_to(None));
        assert!(rule.applies_to(Some(&Value::Null)));
        assert!(InvalidationRule::new("plain").applies_to(Some(&json!({}))));
    }

    #[test]
    fn test_species_condition() {
        let rules = default_rules();
        let species = rules.iter().find(|r| r.name == "species-updates").unwrap();

        assert!(species.applies_to(Some(&json!({"photos": [{"id": 1}]}))));
        assert!(species.applies_to(Some(&json!({"description": "A small bird"}))));
        assert!(species.applies_to(Some(&json!({"type": "species", "metadata": {"hasPhotos": true}}))));
        assert!(!species.applies_to(Some(&json!({"photos": [], "description": ""}))));
        assert!(!species.applies_to(Some(&json!({"type": "species", "id": 3}))));
    }

    #[test]
    fn test_default_rules() {
        let rules = default_rules();
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "new-observations",
                "species-updates",
                "user-activity",
                "location-changes",
                "dashboard-data",
                "static-data"
            ]
        );

        let observations = &rules[0];
        assert_eq!(observations.clear_prefix().as_deref(), Some("observations"));
        assert_eq!(observations.cascade, vec!["user-stats", "dashboard-data"]);
        assert!(observations.summary().cascade.contains(&"dashboard-data".to_string()));
        assert!(rules[1].summary().conditional);
    }

    #[test]
    fn test_affected_data_wire_format() {
        let parsed: AffectedData = serde_json::from_value(json!({
            "type": "observation",
            "id": 42,
            "metadata": {"location": "NZ"}
        }))
        .unwrap();

        assert_eq!(parsed.kind, DataKind::Observation);
        assert_eq!(parsed.id, Some(json!(42)));
        assert!(parsed.flag("location"));
        assert!(!parsed.flag("userId"));

        let unknown: AffectedData = serde_json::from_value(json!({"type": "comet"})).unwrap();
        assert_eq!(unknown.kind, DataKind::Unknown);

        let built = AffectedData::new(DataKind::User).with_id("u1");
        assert_eq!(serde_json::to_value(&built).unwrap(), json!({"type": "user", "id": "u1"}));
    }
}
