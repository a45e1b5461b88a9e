//! Rule management commands
//!
//! Operate directly on the rule storage directory. Output is JSON on stdout.

use crate::cli::{AddRuleArgs, RuleCommand};
use crate::config::Config;
use crate::error::{CryostatError, Result};
use crate::rules::{FileRuleStorage, MatchExpressionEvaluator, Rule, RuleRegistry};
use std::sync::Arc;

/// Opens the registry over the configured storage directory and loads it
pub fn open_registry(config: &Config) -> Result<RuleRegistry> {
    let storage = FileRuleStorage::new(config.rules.storage_dir()?)?;
    tracing::debug!(dir = %storage.dir().display(), "Opening rule storage");
    let evaluator = Arc::new(MatchExpressionEvaluator::new(config.rules.expression_cache_capacity));
    let registry = RuleRegistry::new(Arc::new(storage), evaluator);
    registry.load_rules()?;
    Ok(registry)
}

/// Runs a rule subcommand
pub fn run_rules(config: &Config, command: RuleCommand) -> Result<()> {
    match command {
        RuleCommand::Validate { expression } => validate_expression(config, &expression),
        RuleCommand::List => {
            let registry = open_registry(config)?;
            println!("{}", serde_json::to_string_pretty(&registry.get_rules())?);
            Ok(())
        }
        RuleCommand::Add(args) => add_rule(config, args),
        RuleCommand::Delete { name } => {
            let removed = open_registry(config)?.delete(&name)?;
            if removed.is_empty() {
                return Err(CryostatError::InvalidRule(format!("no rule named '{}'", name)).into());
            }
            println!("{}", serde_json::to_string_pretty(&removed)?);
            Ok(())
        }
        RuleCommand::Enable { name } => set_enabled(config, &name, true),
        RuleCommand::Disable { name } => set_enabled(config, &name, false),
    }
}

/// Validates an expression statically and against a placeholder target
pub fn validate_expression(config: &Config, expression: &str) -> Result<()> {
    MatchExpressionEvaluator::new(config.rules.expression_cache_capacity).validate(expression)?;
    println!("{}", serde_json::json!({ "expression": expression, "valid": true }));
    Ok(())
}

fn add_rule(config: &Config, args: AddRuleArgs) -> Result<()> {
    let rule = Rule::builder()
        .name(args.name)
        .description(args.description)
        .match_expression(args.match_expression)
        .event_specifier(args.event_specifier)
        .archival_period_seconds(args.archival_period)
        .initial_delay_seconds(args.initial_delay)
        .preserved_archives(args.preserved_archives)
        .max_age_seconds(args.max_age)
        .max_size_bytes(args.max_size)
        .enabled(!args.disabled)
        .build()?;
    let added = open_registry(config)?.add_rule(rule)?;
    println!("{}", serde_json::to_string_pretty(&added)?);
    Ok(())
}

fn set_enabled(config: &Config, name: &str, enabled: bool) -> Result<()> {
    let updated = open_registry(config)?.enable(name, enabled)?;
    println!("{}", serde_json::to_string_pretty(&updated)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.rules.storage_dir = Some(dir.path().to_path_buf());
        config
    }

    fn add_args(name: &str) -> AddRuleArgs {
        AddRuleArgs {
            name: name.to_string(),
            description: String::new(),
            match_expression: "target.alias == 'x'".to_string(),
            event_specifier: "template=Continuous".to_string(),
            archival_period: 60,
            initial_delay: 0,
            preserved_archives: 2,
            max_age: 0,
            max_size: 0,
            disabled: false,
        }
    }

    #[test]
    fn test_add_enable_delete() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        run_rules(&config, RuleCommand::Add(add_args("a rule"))).unwrap();
        assert!(run_rules(&config, RuleCommand::Add(add_args("a rule"))).is_err());

        run_rules(&config, RuleCommand::Disable { name: "a_rule".to_string() }).unwrap();
        assert!(!open_registry(&config).unwrap().get("a_rule").unwrap().is_enabled());

        run_rules(&config, RuleCommand::Delete { name: "a_rule".to_string() }).unwrap();
        assert!(open_registry(&config).unwrap().get_rules().is_empty());
        assert!(run_rules(&config, RuleCommand::Delete { name: "a_rule".to_string() }).is_err());
    }

    #[test]
    fn test_validate_expression() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        assert!(validate_expression(&config, "target.alias == 'x'").is_ok());
        assert!(validate_expression(&config, "System.exit(1)").is_err());
        assert!(validate_expression(&config, "target.alias").is_err());
    }
}
