//! Automation rules
//!
//! A [`Rule`] pairs a match expression with a capture to start on every
//! matching target and a retention policy for periodic archives of it.
//! Rules are built through [`RuleBuilder`], which enforces the field
//! constraints and applies the documented defaults; the same checks run
//! again whenever a persisted rule is deserialized.

pub mod archiver;
pub mod expression;
pub mod processor;
pub mod registry;

pub use archiver::PeriodicArchiver;
pub use expression::{MatchExpressionEvaluator, MatchExpressionValidator};
pub use processor::RuleProcessor;
pub use registry::{FileRuleStorage, RuleEvent, RuleEventKind, RuleRegistry, RuleStorage};

use crate::error::{CryostatError, Result};
use crate::session::{EventTemplate, TemplateType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Event specifier marking a one-shot snapshot-and-archive rule
pub const ARCHIVE_EVENT_SPECIFIER: &str = "archive";

/// Prefix of the capture name a rule starts on its targets
pub const RECORDING_NAME_PREFIX: &str = "auto_";

/// Persisted match expression, used to scope stored credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchExpression {
    /// Storage identifier
    pub id: i64,
    /// Expression text
    pub text: String,
}

impl MatchExpression {
    /// Creates a match expression record
    pub fn new(id: i64, text: impl Into<String>) -> Self {
        Self { id, text: text.into() }
    }
}

impl PartialEq for MatchExpression {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MatchExpression {}

impl Hash for MatchExpression {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Parsed form of a rule's event specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSpecifier {
    /// Take one snapshot and archive it
    Archive,
    /// Start a capture with the named event template
    Template(EventTemplate),
}

impl FromStr for EventSpecifier {
    type Err = anyhow::Error;

    /// Parses `archive` or `template=<name>[,type=<TARGET|CUSTOM>]`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == ARCHIVE_EVENT_SPECIFIER {
            return Ok(EventSpecifier::Archive);
        }
        let mut name = None;
        let mut template_type = None;
        for part in s.split(',') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(format!("malformed event specifier '{}'", s)))?;
            match key.trim() {
                "template" if !value.trim().is_empty() => name = Some(value.trim().to_string()),
                "type" => template_type = Some(value.trim().parse::<TemplateType>().map_err(invalid)?),
                _ => return Err(invalid(format!("malformed event specifier '{}'", s))),
            }
        }
        let name = name.ok_or_else(|| invalid(format!("event specifier '{}' names no template", s)))?;
        Ok(EventSpecifier::Template(EventTemplate { name, template_type }))
    }
}

/// An automation rule
///
/// Equality and hashing cover every field except `enabled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RuleBuilder")]
pub struct Rule {
    name: String,
    description: String,
    match_expression: String,
    event_specifier: String,
    archival_period_seconds: i64,
    initial_delay_seconds: i64,
    preserved_archives: i64,
    max_age_seconds: i64,
    max_size_bytes: i64,
    enabled: bool,
}

impl Rule {
    /// Starts a builder
    pub fn builder() -> RuleBuilder {
        RuleBuilder::default()
    }

    /// Sanitised rule name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-form description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Match expression text
    pub fn match_expression(&self) -> &str {
        &self.match_expression
    }

    /// Raw event specifier
    pub fn event_specifier(&self) -> &str {
        &self.event_specifier
    }

    /// Seconds between periodic archives
    pub fn archival_period_seconds(&self) -> i64 {
        self.archival_period_seconds
    }

    /// Seconds before the first periodic archive
    pub fn initial_delay_seconds(&self) -> i64 {
        self.initial_delay_seconds
    }

    /// Number of archives kept per target
    pub fn preserved_archives(&self) -> i64 {
        self.preserved_archives
    }

    /// Maximum age of capture data kept on the target
    pub fn max_age_seconds(&self) -> i64 {
        self.max_age_seconds
    }

    /// Maximum size of capture data kept on the target
    pub fn max_size_bytes(&self) -> i64 {
        self.max_size_bytes
    }

    /// Whether the rule is active
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns a copy with the enabled flag set
    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            enabled,
            ..self.clone()
        }
    }

    /// Whether this is a one-shot snapshot-and-archive rule
    pub fn is_archiver(&self) -> bool {
        self.event_specifier.trim() == ARCHIVE_EVENT_SPECIFIER
    }

    /// Name of the capture this rule starts on its targets
    pub fn recording_name(&self) -> String {
        format!("{}{}", RECORDING_NAME_PREFIX, self.name)
    }

    /// Parsed event specifier
    pub fn parsed_event_specifier(&self) -> Result<EventSpecifier> {
        self.event_specifier.parse()
    }

    fn key(&self) -> (&str, &str, &str, &str, [i64; 5]) {
        (
            &self.name,
            &self.description,
            &self.match_expression,
            &self.event_specifier,
            [
                self.archival_period_seconds,
                self.initial_delay_seconds,
                self.preserved_archives,
                self.max_age_seconds,
                self.max_size_bytes,
            ],
        )
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] -> {}", self.name, self.match_expression, self.event_specifier)
    }
}

impl TryFrom<RuleBuilder> for Rule {
    type Error = anyhow::Error;

    fn try_from(builder: RuleBuilder) -> Result<Self> {
        builder.build()
    }
}

/// Builder for [`Rule`]
///
/// # Examples
///
/// ```
/// use cryostat::rules::Rule;
///
/// let rule = Rule::builder()
///     .name("my rule")
///     .match_expression("target.alias == 'app'")
///     .event_specifier("template=Continuous,type=TARGET")
///     .archival_period_seconds(60)
///     .preserved_archives(3)
///     .build()
///     .unwrap();
/// assert_eq!(rule.name(), "my_rule");
/// assert_eq!(rule.initial_delay_seconds(), 60);
/// assert_eq!(rule.max_age_seconds(), 60);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleBuilder {
    name: String,
    description: String,
    match_expression: String,
    event_specifier: String,
    archival_period_seconds: i64,
    initial_delay_seconds: i64,
    preserved_archives: i64,
    max_age_seconds: i64,
    max_size_bytes: i64,
    enabled: bool,
}

impl Default for RuleBuilder {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            match_expression: String::new(),
            event_specifier: String::new(),
            archival_period_seconds: 0,
            initial_delay_seconds: 0,
            preserved_archives: 0,
            max_age_seconds: 0,
            max_size_bytes: 0,
            enabled: true,
        }
    }
}

impl RuleBuilder {
    /// Sets the name; whitespace is replaced with underscores
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the match expression
    pub fn match_expression(mut self, expression: impl Into<String>) -> Self {
        self.match_expression = expression.into();
        self
    }

    /// Sets the event specifier
    pub fn event_specifier(mut self, specifier: impl Into<String>) -> Self {
        self.event_specifier = specifier.into();
        self
    }

    /// Sets the archival period
    pub fn archival_period_seconds(mut self, seconds: i64) -> Self {
        self.archival_period_seconds = seconds;
        self
    }

    /// Sets the initial delay
    pub fn initial_delay_seconds(mut self, seconds: i64) -> Self {
        self.initial_delay_seconds = seconds;
        self
    }

    /// Sets the number of preserved archives
    pub fn preserved_archives(mut self, count: i64) -> Self {
        self.preserved_archives = count;
        self
    }

    /// Sets the capture max age
    pub fn max_age_seconds(mut self, seconds: i64) -> Self {
        self.max_age_seconds = seconds;
        self
    }

    /// Sets the capture max size
    pub fn max_size_bytes(mut self, bytes: i64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    /// Sets the enabled flag
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validates the fields and applies defaults
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::InvalidRule` naming the first violated
    /// constraint.
    pub fn build(self) -> Result<Rule> {
        let name = sanitize_rule_name(&self.name);
        if self.match_expression.trim().is_empty() {
            return Err(invalid("match expression must not be blank"));
        }
        if self.event_specifier.trim().is_empty() {
            return Err(invalid("event specifier must not be blank"));
        }

        let specifier: EventSpecifier = self.event_specifier.parse()?;
        let mut rule = Rule {
            name,
            description: self.description,
            match_expression: self.match_expression,
            event_specifier: self.event_specifier.trim().to_string(),
            archival_period_seconds: self.archival_period_seconds,
            initial_delay_seconds: self.initial_delay_seconds,
            preserved_archives: self.preserved_archives,
            max_age_seconds: self.max_age_seconds,
            max_size_bytes: self.max_size_bytes,
            enabled: self.enabled,
        };

        if specifier == EventSpecifier::Archive {
            for (field, value) in [
                ("archivalPeriodSeconds", rule.archival_period_seconds),
                ("initialDelaySeconds", rule.initial_delay_seconds),
                ("preservedArchives", rule.preserved_archives),
                ("maxAgeSeconds", rule.max_age_seconds),
                ("maxSizeBytes", rule.max_size_bytes),
            ] {
                if value > 0 {
                    return Err(invalid(format!("{} must not be positive for archiver rules", field)));
                }
            }
            return Ok(rule);
        }

        if rule.name.is_empty() {
            return Err(invalid("name must not be blank"));
        }
        for (field, value) in [
            ("archivalPeriodSeconds", rule.archival_period_seconds),
            ("initialDelaySeconds", rule.initial_delay_seconds),
            ("preservedArchives", rule.preserved_archives),
        ] {
            if value < 0 {
                return Err(invalid(format!("{} must not be negative", field)));
            }
        }

        if rule.initial_delay_seconds <= 0 {
            rule.initial_delay_seconds = rule.archival_period_seconds;
        }
        if rule.archival_period_seconds <= 0 && rule.initial_delay_seconds > 0 && rule.preserved_archives <= 0 {
            rule.preserved_archives = 1;
        }
        if rule.max_age_seconds <= 0 {
            rule.max_age_seconds = rule.archival_period_seconds;
        }
        Ok(rule)
    }
}

impl From<&Rule> for RuleBuilder {
    fn from(rule: &Rule) -> Self {
        Self {
            name: rule.name.clone(),
            description: rule.description.clone(),
            match_expression: rule.match_expression.clone(),
            event_specifier: rule.event_specifier.clone(),
            archival_period_seconds: rule.archival_period_seconds,
            initial_delay_seconds: rule.initial_delay_seconds,
            preserved_archives: rule.preserved_archives,
            max_age_seconds: rule.max_age_seconds,
            max_size_bytes: rule.max_size_bytes,
            enabled: rule.enabled,
        }
    }
}

/// Replaces whitespace runs in a rule name with underscores
pub fn sanitize_rule_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("_")
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    CryostatError::InvalidRule(message.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RuleBuilder {
        Rule::builder()
            .name("rule")
            .match_expression("true")
            .event_specifier("template=Continuous")
    }

    fn is_invalid(result: Result<Rule>) -> bool {
        matches!(
            result.err().as_ref().and_then(|e| e.downcast_ref::<CryostatError>()),
            Some(CryostatError::InvalidRule(_))
        )
    }

    #[test]
    fn test_build_round_trips_fields() {
        let rule = base()
            .description("desc")
            .archival_period_seconds(30)
            .initial_delay_seconds(10)
            .preserved_archives(5)
            .max_age_seconds(120)
            .max_size_bytes(1024)
            .enabled(false)
            .build()
            .unwrap();
        assert_eq!(rule.name(), "rule");
        assert_eq!(rule.description(), "desc");
        assert_eq!(rule.match_expression(), "true");
        assert_eq!(rule.event_specifier(), "template=Continuous");
        assert_eq!(rule.archival_period_seconds(), 30);
        assert_eq!(rule.initial_delay_seconds(), 10);
        assert_eq!(rule.preserved_archives(), 5);
        assert_eq!(rule.max_age_seconds(), 120);
        assert_eq!(rule.max_size_bytes(), 1024);
        assert!(!rule.is_enabled());
        assert!(!rule.is_archiver());
        assert_eq!(rule.recording_name(), "auto_rule");
    }

    #[test]
    fn test_defaults() {
        let rule = base().archival_period_seconds(60).build().unwrap();
        assert_eq!(rule.initial_delay_seconds(), 60);
        assert_eq!(rule.max_age_seconds(), 60);
        assert_eq!(rule.preserved_archives(), 0);

        let once = base().initial_delay_seconds(30).build().unwrap();
        assert_eq!(once.archival_period_seconds(), 0);
        assert_eq!(once.preserved_archives(), 1);
        assert_eq!(once.max_age_seconds(), 0);

        let capture_only = base().build().unwrap();
        assert_eq!(capture_only.preserved_archives(), 0);
        assert!(capture_only.is_enabled());
    }

    #[test]
    fn test_name_is_sanitised() {
        let rule = base().name("  my  fancy\trule ").build().unwrap();
        assert_eq!(rule.name(), "my_fancy_rule");
        assert_eq!(rule.recording_name(), "auto_my_fancy_rule");
    }

    #[test]
    fn test_blank_fields_rejected() {
        assert!(is_invalid(base().name("  ").build()));
        assert!(is_invalid(base().match_expression(" ").build()));
        assert!(is_invalid(base().event_specifier("").build()));
    }

    #[test]
    fn test_negative_schedule_rejected() {
        assert!(is_invalid(base().archival_period_seconds(-1).build()));
        assert!(is_invalid(base().initial_delay_seconds(-1).build()));
        assert!(is_invalid(base().preserved_archives(-1).build()));
        assert!(base().max_age_seconds(-1).max_size_bytes(-5).build().is_ok());
    }

    #[test]
    fn test_archiver_rules() {
        let archiver = Rule::builder()
            .match_expression("true")
            .event_specifier("archive")
            .build()
            .unwrap();
        assert!(archiver.is_archiver());
        assert_eq!(archiver.name(), "");
        assert_eq!(archiver.parsed_event_specifier().unwrap(), EventSpecifier::Archive);

        let positive: [fn(RuleBuilder) -> RuleBuilder; 5] = [
            |b| b.archival_period_seconds(1),
            |b| b.initial_delay_seconds(1),
            |b| b.preserved_archives(1),
            |b| b.max_age_seconds(1),
            |b| b.max_size_bytes(1),
        ];
        for set in positive {
            let builder = Rule::builder().match_expression("true").event_specifier("archive");
            assert!(is_invalid(set(builder).build()));
        }
    }

    #[test]
    fn test_event_specifier_parsing() {
        assert_eq!(
            "template=Profiling,type=CUSTOM".parse::<EventSpecifier>().unwrap(),
            EventSpecifier::Template(EventTemplate {
                name: "Profiling".to_string(),
                template_type: Some(TemplateType::Custom),
            })
        );
        assert_eq!(
            "template=Continuous".parse::<EventSpecifier>().unwrap(),
            EventSpecifier::Template(EventTemplate {
                name: "Continuous".to_string(),
                template_type: None,
            })
        );
        assert!("Continuous".parse::<EventSpecifier>().is_err());
        assert!("type=TARGET".parse::<EventSpecifier>().is_err());
        assert!("template=x,type=OTHER".parse::<EventSpecifier>().is_err());
        assert!(is_invalid(base().event_specifier("bogus").build()));
    }

    #[test]
    fn test_equality_ignores_enabled() {
        let a = base().build().unwrap();
        let b = a.with_enabled(false);
        assert_eq!(a, b);
        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_ne!(base().description("other").build().unwrap(), b);
    }

    #[test]
    fn test_deserialization_revalidates() {
        let json = r#"{"name":"r","matchExpression":"true","eventSpecifier":"template=x","archivalPeriodSeconds":10}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.initial_delay_seconds(), 10);
        assert!(rule.is_enabled());

        let bad = r#"{"name":"r","matchExpression":"","eventSpecifier":"template=x"}"#;
        assert!(serde_json::from_str::<Rule>(bad).is_err());

        let round_trip: Rule = serde_json::from_str(&serde_json::to_string(&rule).unwrap()).unwrap();
        assert_eq!(round_trip, rule);
    }
}
