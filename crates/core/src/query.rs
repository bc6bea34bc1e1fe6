use std::collections::BTreeMap;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelTerm {
    Exists(String),
    NotExists(String),
    Equal(String, String),
}

impl LabelTerm {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            LabelTerm::Exists(k) => labels.contains_key(k),
            LabelTerm::NotExists(k) => !labels.contains_key(k),
            LabelTerm::Equal(k, v) => labels.get(k).map(|x| x == v).unwrap_or(false),
        }
    }
}

/// Conjunction of label terms; an empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelQuery {
    pub terms: Vec<LabelTerm>,
}

impl LabelQuery {
    pub fn exists(mut self, key: &str) -> Self { self.terms.push(LabelTerm::Exists(key.to_string())); self }
    pub fn not_exists(mut self, key: &str) -> Self { self.terms.push(LabelTerm::NotExists(key.to_string())); self }
    pub fn equal(mut self, key: &str, value: &str) -> Self {
        self.terms.push(LabelTerm::Equal(key.to_string(), value.to_string()));
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool { self.terms.iter().all(|t| t.matches(labels)) }
}

/// Filter applied by list and kind watches.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub labels: LabelQuery,
    pub id_regex: Option<Regex>,
}

impl ListOptions {
    pub fn with_labels(labels: LabelQuery) -> Self { Self { labels, id_regex: None } }

    pub fn with_id_regex(mut self, re: Regex) -> Self {
        self.id_regex = Some(re);
        self
    }

    pub fn matches(&self, id: &str, labels: &BTreeMap<String, String>) -> bool {
        if let Some(re) = &self.id_regex {
            if !re.is_match(id) { return false; }
        }
        self.labels.matches(labels)
    }
}
