//! Label and field selectors.
//!
//! Grammar for labels: comma separated terms of `k=v`, `k==v`, `k!=v`,
//! `k`, `!k`, `k in (a,b)` and `k notin (a,b)`. Fields support the
//! equality forms only. An empty selector matches everything.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use super::ObjectMeta;
use super::StorageObject;
use crate::Result;
use crate::StorageError;

/// Field name to value, as exposed by [`StorageObject::fields`]
pub type FieldSet = BTreeMap<String, String>;

pub fn object_meta_fields(meta: &ObjectMeta) -> FieldSet {
    let mut fields = FieldSet::new();
    fields.insert("metadata.name".to_string(), meta.name.clone());
    fields.insert("metadata.namespace".to_string(), meta.namespace.clone());
    fields
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(
        &self,
        set: &BTreeMap<String, String>,
    ) -> bool {
        match self {
            Requirement::Equals(k, v) => set.get(k) == Some(v),
            Requirement::NotEquals(k, v) => set.get(k) != Some(v),
            Requirement::In(k, values) => set.get(k).is_some_and(|v| values.contains(v)),
            Requirement::NotIn(k, values) => !set.get(k).is_some_and(|v| values.contains(v)),
            Requirement::Exists(k) => set.contains_key(k),
            Requirement::DoesNotExist(k) => !set.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::In(k, values) => write!(f, "{k} in ({})", join(values)),
            Requirement::NotIn(k, values) => write!(f, "{k} notin ({})", join(values)),
            Requirement::Exists(k) => write!(f, "{k}"),
            Requirement::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// Conjunction of label requirements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in split_terms(selector)? {
            requirements.push(parse_label_term(&term)?);
        }
        Ok(Self { requirements })
    }

    pub fn with(
        mut self,
        requirement: Requirement,
    ) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let terms: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        write!(f, "{}", terms.join(","))
    }
}

/// Conjunction of field equality requirements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: Vec<Requirement>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in split_terms(selector)? {
            let requirement = match parse_label_term(&term)? {
                r @ (Requirement::Equals(..) | Requirement::NotEquals(..)) => r,
                other => {
                    return Err(invalid(format!(
                        "field selector only supports equality, got `{other}`"
                    )))
                }
            };
            requirements.push(requirement);
        }
        Ok(Self { requirements })
    }

    /// Single `field=value` term
    pub fn equals(
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            requirements: vec![Requirement::Equals(field.into(), value.into())],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(
        &self,
        fields: &FieldSet,
    ) -> bool {
        self.requirements.iter().all(|r| r.matches(fields))
    }
}

/// Filter applied to reads and watch streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPredicate {
    pub label: LabelSelector,
    pub field: FieldSelector,
    /// Opt-in to periodic bookmark events on watch streams
    pub allow_watch_bookmarks: bool,
}

impl SelectionPredicate {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn new(
        label: LabelSelector,
        field: FieldSelector,
    ) -> Self {
        Self {
            label,
            field,
            allow_watch_bookmarks: false,
        }
    }

    pub fn with_bookmarks(mut self) -> Self {
        self.allow_watch_bookmarks = true;
        self
    }

    pub fn is_everything(&self) -> bool {
        self.label.is_empty() && self.field.is_empty()
    }

    pub fn matches<T: StorageObject>(
        &self,
        obj: &T,
    ) -> bool {
        if self.is_everything() {
            return true;
        }
        if !self.label.matches(&obj.metadata().labels) {
            return false;
        }
        self.field.is_empty() || self.field.matches(&obj.fields())
    }
}

fn invalid(msg: String) -> crate::Error {
    StorageError::Invalid(msg).into()
}

/// Splits on commas that sit outside parentheses.
fn split_terms(selector: &str) -> Result<Vec<String>> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in selector.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| invalid(format!("unbalanced `)` in selector `{selector}`")))?;
                current.push(c);
            }
            ',' if depth == 0 => terms.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(invalid(format!("unbalanced `(` in selector `{selector}`")));
    }
    terms.push(current);

    Ok(terms
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect())
}

fn parse_label_term(term: &str) -> Result<Requirement> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(valid_key(key.trim())?));
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(valid_key(key.trim())?, value.trim().to_string()));
    }
    if let Some((key, value)) = term.split_once("==") {
        return Ok(Requirement::Equals(valid_key(key.trim())?, value.trim().to_string()));
    }
    if let Some((key, value)) = term.split_once('=') {
        return Ok(Requirement::Equals(valid_key(key.trim())?, value.trim().to_string()));
    }
    if let Some((key, values)) = term.split_once(" notin ") {
        return Ok(Requirement::NotIn(valid_key(key.trim())?, parse_set(values)?));
    }
    if let Some((key, values)) = term.split_once(" in ") {
        return Ok(Requirement::In(valid_key(key.trim())?, parse_set(values)?));
    }
    Ok(Requirement::Exists(valid_key(term)?))
}

fn parse_set(values: &str) -> Result<BTreeSet<String>> {
    let inner = values
        .trim()
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| invalid(format!("expected parenthesised value set, got `{values}`")))?;
    Ok(inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

fn valid_key(key: &str) -> Result<String> {
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(invalid(format!("invalid selector key `{key}`")));
    }
    Ok(key.to_string())
}
