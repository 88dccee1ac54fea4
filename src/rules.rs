//! Monitoring rules for the Nagios-style check.
//!
//! A rules file decides which features the check looks at and lets
//! individual features carry their own alert thresholds. One directive per
//! line:
//!
//! ```text
//! option matching first
//! exclude string=demo:acme:1.0
//! include pattern=MATLAB* warn=80% crit=95%
//! include regex=^Sim warn=0.75
//! include warn=90% crit=12
//! ```
//!
//! Rules match against the `feature:vendor:version` tuple string. A rule
//! without a matcher matches every tuple. Thresholds are a fraction (`0.9`),
//! a percentage (`90%`), or an absolute seat count (`12`). The `matching`
//! option picks whether the first or the last matching rule wins; first
//! wins by default.

use std::fmt;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

/// An alert threshold from a rule or the configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    /// Alert when `in_use / issued` reaches this fraction.
    Fraction(f64),
    /// Alert when `in_use` reaches this many seats.
    Seats(i64),
}

impl Threshold {
    /// True when a usage level breaches the threshold.
    pub fn is_breached(&self, in_use: i64, issued: i64) -> bool {
        match *self {
            Threshold::Fraction(fraction) => {
                issued > 0 && in_use as f64 / issued as f64 >= fraction
            }
            Threshold::Seats(seats) => in_use >= seats,
        }
    }

    fn parse(text: &str) -> Result<Self> {
        if let Some(percent) = text.strip_suffix('%') {
            let value: f64 = percent
                .parse()
                .map_err(|_| anyhow!("invalid percentage '{text}'"))?;
            return Ok(Threshold::Fraction(value / 100.0));
        }
        if text.contains('.') {
            let value: f64 = text
                .parse()
                .map_err(|_| anyhow!("invalid fraction '{text}'"))?;
            return Ok(Threshold::Fraction(value));
        }
        let value: i64 = text
            .parse()
            .map_err(|_| anyhow!("invalid seat count '{text}'"))?;
        Ok(Threshold::Seats(value))
    }
}

impl std::str::FromStr for Threshold {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Fraction(fraction) => write!(f, "{:.0}%", fraction * 100.0),
            Threshold::Seats(seats) => write!(f, "{seats} seats"),
        }
    }
}

#[derive(Debug)]
enum Matcher {
    Any,
    Exact(String),
    Glob(glob::Pattern),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, tuple: &str) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Exact(text) => text == tuple,
            Matcher::Glob(pattern) => pattern.matches(tuple),
            Matcher::Regex(regex) => regex.is_match(tuple),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Include,
    Exclude,
}

#[derive(Debug)]
struct Rule {
    action: Action,
    matcher: Matcher,
    warn: Option<Threshold>,
    crit: Option<Threshold>,
}

/// Which of several matching rules decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    #[default]
    First,
    Last,
}

/// What the rules decided for one tuple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleDecision {
    /// No rule matched; the caller applies its defaults.
    Decline,
    /// Skip this feature entirely.
    Exclude,
    /// Check this feature, optionally with overridden thresholds.
    Include {
        warn: Option<Threshold>,
        crit: Option<Threshold>,
    },
}

/// An ordered list of monitoring rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    policy: MatchPolicy,
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read rules file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in rules file {}", path.display()))
    }

    /// Parse a rules file. Blank lines and `#` comments are skipped; any
    /// malformed directive fails with its line number.
    pub fn parse(text: &str) -> Result<Self> {
        let mut set = RuleSet::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            set.parse_directive(line)
                .with_context(|| format!("invalid rule on line {}", index + 1))?;
        }
        Ok(set)
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn parse_directive(&mut self, line: &str) -> Result<()> {
        let mut words = line.split_whitespace();
        let keyword = words.next().unwrap_or_default();
        match keyword {
            "option" => {
                let setting = words.next().ok_or_else(|| anyhow!("option needs a name"))?;
                if setting != "matching" {
                    bail!("unknown option '{setting}'");
                }
                let value = words
                    .next()
                    .ok_or_else(|| anyhow!("option matching needs a value"))?;
                self.policy = match value {
                    "first" => MatchPolicy::First,
                    "last" => MatchPolicy::Last,
                    other => bail!("unknown matching policy '{other}' (expected first or last)"),
                };
            }
            "include" | "exclude" => {
                let action = if keyword == "include" {
                    Action::Include
                } else {
                    Action::Exclude
                };
                let mut matcher = None;
                let mut warn = None;
                let mut crit = None;
                for word in words {
                    let (key, value) = word
                        .split_once('=')
                        .ok_or_else(|| anyhow!("expected key=value, got '{word}'"))?;
                    match key {
                        "string" | "pattern" | "regex" => {
                            if matcher.is_some() {
                                bail!("rule has more than one matcher");
                            }
                            matcher = Some(match key {
                                "string" => Matcher::Exact(value.to_string()),
                                "pattern" => Matcher::Glob(
                                    glob::Pattern::new(value)
                                        .map_err(|e| anyhow!("invalid pattern '{value}': {e}"))?,
                                ),
                                _ => Matcher::Regex(
                                    Regex::new(value)
                                        .map_err(|e| anyhow!("invalid regex '{value}': {e}"))?,
                                ),
                            });
                        }
                        "warn" => warn = Some(Threshold::parse(value)?),
                        "crit" => crit = Some(Threshold::parse(value)?),
                        other => bail!("unknown key '{other}'"),
                    }
                }
                if action == Action::Exclude && (warn.is_some() || crit.is_some()) {
                    bail!("exclude rules cannot carry thresholds");
                }
                self.rules.push(Rule {
                    action,
                    matcher: matcher.unwrap_or(Matcher::Any),
                    warn,
                    crit,
                });
            }
            other => bail!("unknown directive '{other}'"),
        }
        Ok(())
    }

    /// Decide what to do with one `feature:vendor:version` tuple.
    pub fn apply(&self, tuple: &str) -> RuleDecision {
        let mut decision = RuleDecision::Decline;
        for rule in &self.rules {
            if !rule.matcher.matches(tuple) {
                continue;
            }
            decision = match rule.action {
                Action::Exclude => RuleDecision::Exclude,
                Action::Include => RuleDecision::Include {
                    warn: rule.warn,
                    crit: rule.crit,
                },
            };
            if self.policy == MatchPolicy::First {
                break;
            }
        }
        decision
    }
}
