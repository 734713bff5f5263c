//! Rule matcher: selects the transform chain for a resolved module

use regex::Regex;

use crate::{
    config::ModuleConfig,
    error::{BuildError, BuildResult},
    resolver::ResolvedRequest,
    transform::{StepDescriptor, StepKind, execution_order},
};

/// Outcome of matching one module against the rule set
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    /// Dependency extraction is skipped; the module is a graph leaf
    pub parse_skipped: bool,
    /// Steps in execution order
    pub steps: Vec<StepDescriptor>,
}

impl RuleMatch {
    fn plain() -> Self {
        Self {
            parse_skipped: false,
            steps: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    label: String,
    enabled: bool,
    test: Regex,
    exclude: Vec<Regex>,
    steps: Vec<StepDescriptor>,
}

impl CompiledRule {
    fn matches(&self, subject: &str) -> bool {
        self.enabled
            && !self.exclude.iter().any(|pattern| pattern.is_match(subject))
            && self.test.is_match(subject)
    }
}

/// Compiled, validated form of the `[module]` section
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    no_parse: Vec<Regex>,
}

fn compile(pattern: &str, what: &str) -> BuildResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| BuildError::config(format!("invalid {what} pattern '{pattern}': {e}")))
}

impl RuleSet {
    pub fn from_config(config: &ModuleConfig) -> BuildResult<Self> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for (index, rule) in config.rules.iter().enumerate() {
            let label = rule.name.clone().unwrap_or_else(|| format!("#{index}"));
            let declared = rule
                .steps
                .as_slice()
                .iter()
                .enumerate()
                .map(|(position, spec)| StepDescriptor::parse(spec, position))
                .collect::<BuildResult<Vec<_>>>()
                .map_err(|e| match e {
                    BuildError::Configuration(message) => {
                        BuildError::config(format!("rule {label}: {message}"))
                    }
                    other => other,
                })?;
            if declared.is_empty() {
                return Err(BuildError::config(format!("rule {label} lists no steps")));
            }
            rules.push(CompiledRule {
                test: compile(&rule.test, "test")?,
                exclude: rule
                    .exclude
                    .iter()
                    .map(|p| compile(p, "exclude"))
                    .collect::<BuildResult<_>>()?,
                steps: execution_order(&declared).cloned().collect(),
                enabled: rule.enabled,
                label,
            });
        }
        let no_parse = config
            .no_parse
            .iter()
            .map(|p| compile(p, "no_parse"))
            .collect::<BuildResult<_>>()?;
        Ok(Self { rules, no_parse })
    }

    /// Chain for a resolved module; the query suffix takes part in matching
    pub fn match_request(&self, request: &ResolvedRequest) -> RuleMatch {
        self.match_subject(&request.rule_subject())
    }

    /// Chain for a forward-slashed path, optionally followed by a query suffix
    pub fn match_subject(&self, subject: &str) -> RuleMatch {
        if self.no_parse.iter().any(|pattern| pattern.is_match(subject)) {
            return RuleMatch {
                parse_skipped: true,
                steps: Vec::new(),
            };
        }

        let mut steps = Vec::new();
        for rule in self.rules.iter().filter(|rule| rule.matches(subject)) {
            log::trace!("Rule {} matches {subject}", rule.label);
            steps.extend(rule.steps.iter().cloned());
        }
        if !steps.is_empty() {
            return RuleMatch {
                parse_skipped: false,
                steps,
            };
        }

        let path = subject.split(['?', '#']).next().unwrap_or(subject);
        if path.to_ascii_lowercase().ends_with(".json") {
            return RuleMatch {
                parse_skipped: false,
                steps: vec![StepDescriptor::builtin("json", StepKind::Json)],
            };
        }
        // Scripts need no steps; anything else becomes a passthrough asset in the executor
        RuleMatch::plain()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::Config;

    const RULES: &str = r#"
[entries]
app = ["./src/index.js"]

[module]
no_parse = ['\.elm$']

[[module.rules]]
name = "styles"
test = '\.(css|scss)$'
use = ["style-loader", "css-loader"]

[[module.rules]]
name = "fonts"
test = '\.woff(2)?(\?v=[0-9]\.[0-9]\.[0-9])?$'
loader = "url-loader?limit=10000&mimetype=application/font-woff"

[[module.rules]]
name = "elm"
test = '\.elm$'
exclude = ['elm-stuff', 'node_modules']
use = [{ loader = "command", options = { program = "elm-make" } }]

[[module.rules]]
name = "vendor-css"
test = 'vendor/.*\.css$'
use = "raw"
"#;

    fn rule_set(disabled: &[&str]) -> RuleSet {
        let mut config = Config::from_toml_str(RULES, "/p".into()).expect("valid config");
        let names: Vec<String> = disabled.iter().map(|s| (*s).to_owned()).collect();
        config.disable_rules(&names).expect("known rules");
        RuleSet::from_config(&config.module).expect("valid rules")
    }

    fn names(found: &RuleMatch) -> Vec<&str> {
        found.steps.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_chain_is_in_execution_order() {
        let found = rule_set(&[]).match_subject("/p/src/app.css");
        assert!(!found.parse_skipped);
        assert_eq!(names(&found), vec!["css-loader", "style-loader"]);
    }

    #[test]
    fn test_matching_chains_concatenate_in_rule_order() {
        let found = rule_set(&[]).match_subject("/p/vendor/reset.css");
        assert_eq!(names(&found), vec!["css-loader", "style-loader", "raw"]);
    }

    #[test]
    fn test_query_takes_part_in_matching() {
        let rules = rule_set(&[]);
        assert_eq!(names(&rules.match_subject("/p/f/icons.woff?v=4.7.0")), vec!["url-loader"]);
        assert!(rules.match_subject("/p/f/icons.woff?v=latest").steps.is_empty());
    }

    #[test]
    fn test_no_parse_wins_with_empty_chain() {
        let found = rule_set(&[]).match_subject("/p/src/Main.elm");
        assert!(found.parse_skipped);
        assert!(found.steps.is_empty());
    }

    #[test]
    fn test_exclude_is_evaluated_first() {
        let mut config = Config::from_toml_str(RULES, "/p".into()).expect("valid config");
        config.module.no_parse.clear();
        let rules = RuleSet::from_config(&config.module).expect("valid rules");
        assert_eq!(names(&rules.match_subject("/p/src/Main.elm")), vec!["command"]);
        assert!(rules.match_subject("/p/elm-stuff/Main.elm").steps.is_empty());
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let found = rule_set(&["styles"]).match_subject("/p/src/app.css");
        assert!(found.steps.is_empty());
    }

    #[test]
    fn test_unmatched_json_gets_implicit_step() {
        let rules = rule_set(&[]);
        assert_eq!(names(&rules.match_subject("/p/data/levels.json")), vec!["json"]);
        assert!(rules.match_subject("/p/src/index.js").steps.is_empty());
    }

    #[test]
    fn test_rule_without_steps_is_rejected() {
        let mut config = Config::from_toml_str(RULES, "/p".into()).expect("valid config");
        config.module.rules[0].steps = crate::config::OneOrMany::Many(Vec::new());
        let err = RuleSet::from_config(&config.module).expect_err("empty chain");
        assert!(err.to_string().contains("styles"));
    }
}
