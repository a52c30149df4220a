//! Ordered accept/drop filter evaluated for every (server, channel, origin,
//! plugin, event) tuple before a plugin handler runs.

use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::RuleError;
use crate::util::irc_lower;

pub type RuleResult<T> = core::result::Result<T, RuleError>;

/// Canonical event names a rule may reference. Anything else is rejected at
/// construction time.
pub const EVENT_NAMES: [&str; 15] = [
    "onCommand",
    "onConnect",
    "onDisconnect",
    "onInvite",
    "onJoin",
    "onKick",
    "onMe",
    "onMessage",
    "onMode",
    "onNames",
    "onNick",
    "onNotice",
    "onPart",
    "onTopic",
    "onWhois",
];

pub fn is_event_name(name: &str) -> bool {
    EVENT_NAMES.iter().any(|ev| ev.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleAction {
    #[default]
    Accept,
    Drop,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Accept => "accept",
            RuleAction::Drop => "drop",
        }
    }
}

impl FromStr for RuleAction {
    type Err = RuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "accept" => Ok(RuleAction::Accept),
            "drop" => Ok(RuleAction::Drop),
            _ => Err(RuleError::InvalidAction),
        }
    }
}

/// One filter entry. Empty criteria sets are wildcards; members are stored
/// lowercased so matching and de-duplication are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rule {
    pub servers: BTreeSet<String>,
    pub channels: BTreeSet<String>,
    pub origins: BTreeSet<String>,
    pub plugins: BTreeSet<String>,
    pub events: BTreeSet<String>,
    pub action: RuleAction,
}

fn normalize<I, S>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values.into_iter().map(|v| irc_lower(v.as_ref())).collect()
}

impl Rule {
    pub fn new<S: AsRef<str>>(
        servers: impl IntoIterator<Item = S>,
        channels: impl IntoIterator<Item = S>,
        origins: impl IntoIterator<Item = S>,
        plugins: impl IntoIterator<Item = S>,
        events: impl IntoIterator<Item = S>,
        action: RuleAction,
    ) -> RuleResult<Self> {
        let events = normalize(events);
        for event in &events {
            if !is_event_name(event) {
                return Err(RuleError::InvalidEvent);
            }
        }

        Ok(Self {
            servers: normalize(servers),
            channels: normalize(channels),
            origins: normalize(origins),
            plugins: normalize(plugins),
            events,
            action,
        })
    }

    fn set_matches(set: &BTreeSet<String>, value: &str) -> bool {
        set.is_empty() || set.contains(&irc_lower(value))
    }

    /// A rule matches when every criteria set matches its tuple component.
    pub fn matches(
        &self,
        server: &str,
        channel: &str,
        origin: &str,
        plugin: &str,
        event: &str,
    ) -> bool {
        Self::set_matches(&self.servers, server)
            && Self::set_matches(&self.channels, channel)
            && Self::set_matches(&self.origins, origin)
            && Self::set_matches(&self.plugins, plugin)
            && Self::set_matches(&self.events, event)
    }
}

/// Atomic field mutation for `edit`: add/remove entries per criteria set,
/// optionally replace the action. Applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct RuleEdit {
    pub add_servers: Vec<String>,
    pub remove_servers: Vec<String>,
    pub add_channels: Vec<String>,
    pub remove_channels: Vec<String>,
    pub add_origins: Vec<String>,
    pub remove_origins: Vec<String>,
    pub add_plugins: Vec<String>,
    pub remove_plugins: Vec<String>,
    pub add_events: Vec<String>,
    pub remove_events: Vec<String>,
    pub action: Option<RuleAction>,
}

/// The ordered rule list. Evaluation starts from accept and walks the whole
/// list; every matching rule overwrites the running decision, so later rules
/// override earlier ones.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn add(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Inserts at `index`, clamped to the list length.
    pub fn insert(&mut self, rule: Rule, index: usize) {
        let index = index.min(self.rules.len());
        self.rules.insert(index, rule);
    }

    pub fn remove(&mut self, index: usize) -> RuleResult<Rule> {
        if index >= self.rules.len() {
            return Err(RuleError::InvalidIndex);
        }

        Ok(self.rules.remove(index))
    }

    pub fn get(&self, index: usize) -> RuleResult<&Rule> {
        self.rules.get(index).ok_or(RuleError::InvalidIndex)
    }

    pub fn list(&self) -> &[Rule] {
        &self.rules
    }

    /// Relocates the rule at `from`. A destination at or past the end means
    /// "append at the end".
    pub fn relocate(&mut self, from: usize, to: usize) -> RuleResult<()> {
        if from >= self.rules.len() {
            return Err(RuleError::InvalidIndex);
        }

        let rule = self.rules.remove(from);
        let to = to.min(self.rules.len());
        self.rules.insert(to, rule);
        Ok(())
    }

    /// Applies an edit atomically: the mutation is validated and staged on a
    /// copy, and the stored rule is only replaced when everything succeeded.
    pub fn edit(&mut self, index: usize, edit: &RuleEdit) -> RuleResult<()> {
        let rule = self.rules.get(index).ok_or(RuleError::InvalidIndex)?;
        let mut staged = rule.clone();

        for event in &edit.add_events {
            if !is_event_name(event) {
                return Err(RuleError::InvalidEvent);
            }
        }

        staged.servers.extend(normalize(&edit.add_servers));
        staged.channels.extend(normalize(&edit.add_channels));
        staged.origins.extend(normalize(&edit.add_origins));
        staged.plugins.extend(normalize(&edit.add_plugins));
        staged.events.extend(normalize(&edit.add_events));

        for server in normalize(&edit.remove_servers) {
            staged.servers.remove(&server);
        }
        for channel in normalize(&edit.remove_channels) {
            staged.channels.remove(&channel);
        }
        for origin in normalize(&edit.remove_origins) {
            staged.origins.remove(&origin);
        }
        for plugin in normalize(&edit.remove_plugins) {
            staged.plugins.remove(&plugin);
        }
        for event in normalize(&edit.remove_events) {
            staged.events.remove(&event);
        }

        if let Some(action) = edit.action {
            staged.action = action;
        }

        self.rules[index] = staged;
        Ok(())
    }

    /// Returns `true` when the event is accepted for the given tuple.
    pub fn solve(
        &self,
        server: &str,
        channel: &str,
        origin: &str,
        plugin: &str,
        event: &str,
    ) -> bool {
        let mut decision = RuleAction::Accept;

        for rule in &self.rules {
            if rule.matches(server, channel, origin, plugin, event) {
                decision = rule.action;
            }
        }

        decision == RuleAction::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        servers: &[&str],
        channels: &[&str],
        events: &[&str],
        action: RuleAction,
    ) -> Rule {
        Rule::new(servers, channels, &[], &[], events, action).unwrap()
    }

    #[test]
    fn empty_list_accepts_everything() {
        let rules = RuleSet::new();
        assert!(rules.solve("any", "#any", "anyone", "p", "onMessage"));
    }

    #[test]
    fn unknown_event_rejected_at_construction() {
        let err = Rule::new(&[], &[], &[], &[], &["onBogus"], RuleAction::Drop);
        assert_eq!(err.unwrap_err(), RuleError::InvalidEvent);
    }

    #[test]
    fn last_match_wins() {
        let mut rules = RuleSet::new();
        rules.add(rule(&[], &["#t"], &[], RuleAction::Drop));
        rules.add(rule(&[], &["#t"], &[], RuleAction::Accept));
        assert!(rules.solve("s", "#t", "o", "p", "onMessage"));

        let mut rules = RuleSet::new();
        rules.add(rule(&[], &["#t"], &[], RuleAction::Accept));
        rules.add(rule(&[], &["#t"], &[], RuleAction::Drop));
        assert!(!rules.solve("s", "#t", "o", "p", "onMessage"));
    }

    #[test]
    fn overlapping_rules_scenario() {
        let mut rules = RuleSet::new();
        rules.add(rule(&[], &["#staff"], &["onCommand"], RuleAction::Drop));
        rules.add(rule(
            &["unsafe"],
            &["#staff"],
            &["onCommand"],
            RuleAction::Accept,
        ));

        assert!(rules.solve("unsafe", "#staff", "alice", "p", "onCommand"));
        assert!(!rules.solve("freenode", "#staff", "alice", "p", "onCommand"));
        assert!(rules.solve("freenode", "#staff", "alice", "p", "onMessage"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let mut rules = RuleSet::new();
        rules.add(rule(&["IRC"], &["#Staff"], &[], RuleAction::Drop));
        assert!(!rules.solve("irc", "#STAFF", "x", "p", "onJoin"));
    }

    #[test]
    fn relocate_reorders_and_clamps() {
        let mut rules = RuleSet::new();
        rules.add(rule(&["s0"], &[], &[], RuleAction::Accept));
        rules.add(rule(&["s1"], &[], &[], RuleAction::Accept));
        rules.add(rule(&["s2"], &[], &[], RuleAction::Accept));

        rules.relocate(2, 0).unwrap();
        let order: Vec<_> = rules
            .list()
            .iter()
            .map(|r| r.servers.iter().next().unwrap().clone())
            .collect();
        assert_eq!(order, vec!["s2", "s0", "s1"]);

        rules.relocate(0, 123).unwrap();
        let order: Vec<_> = rules
            .list()
            .iter()
            .map(|r| r.servers.iter().next().unwrap().clone())
            .collect();
        assert_eq!(order, vec!["s0", "s1", "s2"]);

        assert_eq!(rules.relocate(3, 0), Err(RuleError::InvalidIndex));
    }

    #[test]
    fn solve_is_deterministic() {
        let mut rules = RuleSet::new();
        rules.add(rule(&["a"], &["#b"], &["onKick"], RuleAction::Drop));

        let first = rules.solve("a", "#b", "c", "d", "onKick");
        for _ in 0..10 {
            assert_eq!(rules.solve("a", "#b", "c", "d", "onKick"), first);
        }
    }

    #[test]
    fn edit_is_atomic() {
        let mut rules = RuleSet::new();
        rules.add(rule(&["s"], &[], &["onJoin"], RuleAction::Accept));

        // invalid event must leave the rule untouched, including valid parts
        let bad = RuleEdit {
            add_servers: vec!["added".to_string()],
            add_events: vec!["onNope".to_string()],
            ..RuleEdit::default()
        };
        assert_eq!(rules.edit(0, &bad), Err(RuleError::InvalidEvent));
        assert!(!rules.get(0).unwrap().servers.contains("added"));

        let good = RuleEdit {
            add_servers: vec!["Added".to_string()],
            remove_events: vec!["onJoin".to_string()],
            action: Some(RuleAction::Drop),
            ..RuleEdit::default()
        };
        rules.edit(0, &good).unwrap();

        let rule = rules.get(0).unwrap();
        assert!(rule.servers.contains("added"));
        assert!(rule.events.is_empty());
        assert_eq!(rule.action, RuleAction::Drop);
    }

    #[test]
    fn edit_deduplicates_case_insensitively() {
        let mut rules = RuleSet::new();
        rules.add(rule(&["srv"], &[], &[], RuleAction::Accept));

        let edit = RuleEdit {
            add_servers: vec!["SRV".to_string(), "srv".to_string()],
            ..RuleEdit::default()
        };
        rules.edit(0, &edit).unwrap();
        assert_eq!(rules.get(0).unwrap().servers.len(), 1);
    }
}
