//! Tag validation and tag filter expressions.
//!
//! Filters use `:` for AND and `,` for OR, so `a:b,c:d` reads as
//! `(a AND b) OR (c AND d)`. A leading `~` negates a single tag. Several filter
//! strings are OR'ed together.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_-]*[a-z0-9]$").expect("tag regex compiles")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("invalid tag {0:?}: tags must match ^[a-z][a-z0-9_-]*[a-z0-9]$")]
    InvalidTag(String),

    #[error("empty clause in tag filter {0:?}")]
    EmptyClause(String),
}

/// Validate a single tag.
pub fn validate_tag(tag: &str) -> Result<(), TagError> {
    if TAG_RE.is_match(tag) {
        Ok(())
    } else {
        Err(TagError::InvalidTag(tag.to_string()))
    }
}

/// One tag test inside an AND group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagLiteral {
    Has(String),
    Lacks(String),
}

impl TagLiteral {
    fn matches(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            Self::Has(tag) => tags.contains(tag),
            Self::Lacks(tag) => !tags.contains(tag),
        }
    }
}

/// Disjunction of conjunctions: `Or(And(literal...)...)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagFilter {
    groups: Vec<Vec<TagLiteral>>,
}

impl TagFilter {
    /// Parse `--tags` values. Returns `Ok(None)` when no non-empty filter was given.
    pub fn parse_all<S: AsRef<str>>(filters: &[S]) -> Result<Option<Self>, TagError> {
        let mut groups = Vec::new();
        for filter in filters {
            let filter = filter.as_ref();
            if filter.is_empty() {
                continue;
            }
            groups.extend(parse_filter(filter)?);
        }
        if groups.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { groups }))
    }

    /// Conjunction of negated tags, as produced by `--no-tags a,b`.
    pub fn parse_excluded<S: AsRef<str>>(values: &[S]) -> Result<Option<Self>, TagError> {
        let mut group = Vec::new();
        for value in values {
            for tag in value.as_ref().split(',').filter(|t| !t.is_empty()) {
                validate_tag(tag)?;
                group.push(TagLiteral::Lacks(tag.to_string()));
            }
        }
        if group.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            groups: vec![group],
        }))
    }

    /// AND two filters together by distributing over their groups.
    pub fn and(self, other: Self) -> Self {
        let mut groups = Vec::with_capacity(self.groups.len() * other.groups.len());
        for left in &self.groups {
            for right in &other.groups {
                let mut merged = left.clone();
                merged.extend(right.iter().cloned());
                groups.push(merged);
            }
        }
        Self { groups }
    }

    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        self.groups
            .iter()
            .any(|group| group.iter().all(|literal| literal.matches(tags)))
    }
}

fn parse_filter(filter: &str) -> Result<Vec<Vec<TagLiteral>>, TagError> {
    let mut groups = Vec::new();
    for or_clause in filter.split(',') {
        let mut group = Vec::new();
        for and_clause in or_clause.split(':') {
            if and_clause.is_empty() {
                return Err(TagError::EmptyClause(filter.to_string()));
            }
            let literal = match and_clause.strip_prefix('~') {
                Some(tag) => {
                    validate_tag(tag)?;
                    TagLiteral::Lacks(tag.to_string())
                }
                None => {
                    validate_tag(and_clause)?;
                    TagLiteral::Has(and_clause.to_string())
                }
            };
            group.push(literal);
        }
        groups.push(group);
    }
    Ok(groups)
}
