//! Ordered rule table with first-match-wins lookup.

use crate::matcher::Matcher;
use crate::request::Request;
use crate::response::ResponseTemplate;

/// A matcher paired with the response it selects.
#[derive(Debug, Clone)]
pub struct Rule {
    pub matcher: Matcher,
    pub response: ResponseTemplate,
    /// Free-form label, used in logs.
    pub description: Option<String>,
}

impl Rule {
    pub fn new(matcher: Matcher, response: impl Into<ResponseTemplate>) -> Self {
        Self {
            matcher,
            response: response.into(),
            description: None,
        }
    }

    /// A rule that answers every request.
    pub fn catch_all(response: impl Into<ResponseTemplate>) -> Self {
        Self::new(Matcher::Any, response)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Rules in registration order.
///
/// Lookup is a linear scan; the earliest registered rule that matches wins.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Append every rule of `other`, keeping its order.
    pub fn extend(&mut self, other: RuleTable) {
        self.rules.extend(other.rules);
    }

    /// First rule whose matcher accepts `request`.
    pub fn find(&self, request: &Request) -> Option<&Rule> {
        self.find_indexed(request).map(|(_, rule)| rule)
    }

    /// Like [`RuleTable::find`], with the rule's position.
    pub fn find_indexed(&self, request: &Request) -> Option<(usize, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matcher.matches(request))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

impl FromIterator<Rule> for RuleTable {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::BodySource;
    use serde_json::json;

    fn body_of(rule: &Rule) -> String {
        match &rule.response.body {
            BodySource::Text(text) => String::from_utf8_lossy(text).into_owned(),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_first_match_wins() {
        let mut table = RuleTable::new();
        table.register(Rule::new(Matcher::uri("/foo"), "first"));
        table.register(Rule::new(Matcher::uri("/foo"), "second"));
        table.register(Rule::catch_all("fallback"));

        let (index, rule) = table.find_indexed(&Request::new("GET", "/foo")).unwrap();
        assert_eq!(index, 0);
        assert_eq!(body_of(rule), "first");

        let rule = table.find(&Request::new("GET", "/other")).unwrap();
        assert_eq!(body_of(rule), "fallback");
    }

    #[test]
    fn test_no_match() {
        let mut table = RuleTable::new();
        table.register(Rule::new(Matcher::uri("/foo"), "foo"));
        assert!(table.find(&Request::new("GET", "/bar")).is_none());
        assert!(RuleTable::new().find(&Request::new("GET", "/")).is_none());
    }

    #[test]
    fn test_method_discrimination() {
        let table: RuleTable = [
            Rule::new(
                Matcher::and([Matcher::method("GET"), Matcher::uri("/foo")]),
                "Gotten",
            ),
            Rule::new(
                Matcher::and([Matcher::method("POST"), Matcher::uri("/foo")]),
                "Posted",
            ),
        ]
        .into_iter()
        .collect();

        let get = table.find(&Request::new("GET", "/foo")).unwrap();
        assert_eq!(body_of(get), "Gotten");
        let post = table.find(&Request::new("POST", "/foo")).unwrap();
        assert_eq!(body_of(post), "Posted");
        assert!(table.find(&Request::new("PUT", "/foo")).is_none());
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let mut table = RuleTable::new();
        table.register(Rule::new(Matcher::json_path_eq("cc_number", "ABC123"), "bar"));
        table.register(Rule::catch_all("foo"));

        let request = Request::new("POST", "/").with_json(&json!({"cc_number": "ABC123"}));
        for _ in 0..10 {
            assert_eq!(body_of(table.find(&request).unwrap()), "bar");
        }
    }

    #[test]
    fn test_extend_preserves_order() {
        let mut table = RuleTable::new();
        table.register(Rule::new(Matcher::uri("/a"), "a"));

        let mut more = RuleTable::new();
        more.register(Rule::catch_all("any").with_description("catch-all"));
        table.extend(more);

        assert_eq!(table.len(), 2);
        let last = table.iter().last().unwrap();
        assert_eq!(last.description.as_deref(), Some("catch-all"));
    }
}
