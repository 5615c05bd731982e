use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TreeError};
use crate::node::Record;

/// How a clause compares a record field against its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    /// Exact value equality.
    Equals,
    /// Case-insensitive substring match on the string form.
    Contains,
    /// Case-insensitive prefix match on the string form.
    StartsWith,
}

impl MatchOp {
    fn rank(self) -> u8 {
        match self {
            MatchOp::Equals => 0,
            MatchOp::Contains => 1,
            MatchOp::StartsWith => 2,
        }
    }
}

/// A single field test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub field: String,
    pub op: MatchOp,
    pub value: Value,
}

impl Clause {
    pub fn equals(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: MatchOp::Equals,
            value: value.into(),
        }
    }

    pub fn contains(field: &str, substring: &str) -> Self {
        Self {
            field: field.to_string(),
            op: MatchOp::Contains,
            value: Value::String(substring.to_string()),
        }
    }

    pub fn starts_with(field: &str, prefix: &str) -> Self {
        Self {
            field: field.to_string(),
            op: MatchOp::StartsWith,
            value: Value::String(prefix.to_string()),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let Some(actual) = record.field(&self.field) else {
            return false;
        };
        match self.op {
            MatchOp::Equals => actual == self.value,
            MatchOp::Contains => match (actual.as_str(), self.value.as_str()) {
                (Some(a), Some(q)) => a.to_lowercase().contains(&q.to_lowercase()),
                _ => false,
            },
            MatchOp::StartsWith => match (actual.as_str(), self.value.as_str()) {
                (Some(a), Some(q)) => a.to_lowercase().starts_with(&q.to_lowercase()),
                _ => false,
            },
        }
    }

    fn sort_key(&self) -> (String, u8, String) {
        (self.field.clone(), self.op.rank(), self.value.to_string())
    }
}

/// Filter criteria: a conjunction or disjunction of field clauses.
///
/// Empty criteria of either variant match every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criteria {
    /// Every clause must match.
    All(Vec<Clause>),
    /// At least one clause must match.
    Any(Vec<Clause>),
}

impl Default for Criteria {
    fn default() -> Self {
        Criteria::All(Vec::new())
    }
}

impl Criteria {
    /// Criteria that match everything.
    pub fn none() -> Self {
        Criteria::default()
    }

    pub fn all(clauses: Vec<Clause>) -> Self {
        Criteria::All(clauses)
    }

    pub fn any(clauses: Vec<Clause>) -> Self {
        Criteria::Any(clauses)
    }

    pub fn is_empty(&self) -> bool {
        self.clauses().is_empty()
    }

    pub fn clauses(&self) -> &[Clause] {
        match self {
            Criteria::All(c) | Criteria::Any(c) => c,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Criteria::All(clauses) => clauses.iter().all(|c| c.matches(record)),
            Criteria::Any(clauses) => {
                clauses.is_empty() || clauses.iter().any(|c| c.matches(record))
            }
        }
    }

    /// Order-independent value comparison: clause order never matters, and
    /// empty conjunctions and disjunctions are interchangeable.
    pub fn same_as(&self, other: &Criteria) -> bool {
        if self.is_empty() && other.is_empty() {
            return true;
        }
        if std::mem::discriminant(self) != std::mem::discriminant(other) {
            return false;
        }
        let mut a = self.clauses().to_vec();
        let mut b = other.clauses().to_vec();
        a.sort_by_key(Clause::sort_key);
        b.sort_by_key(Clause::sort_key);
        a == b
    }

    /// Split into a server-evaluable subset and a client-only subset, given
    /// the set of server-filterable field names.
    ///
    /// A conjunction is partitioned clause-by-clause. A disjunction can only
    /// go wholly to one side; one that straddles the split is rejected.
    pub fn split(&self, server_fields: &[String]) -> Result<(Criteria, Criteria)> {
        let is_server = |c: &Clause| server_fields.iter().any(|f| f == &c.field);
        match self {
            Criteria::All(clauses) => {
                let (server, client): (Vec<Clause>, Vec<Clause>) =
                    clauses.iter().cloned().partition(|c| is_server(c));
                Ok((Criteria::All(server), Criteria::All(client)))
            }
            Criteria::Any(clauses) => {
                if clauses.is_empty() {
                    return Ok((Criteria::none(), Criteria::none()));
                }
                if clauses.iter().all(|c| is_server(c)) {
                    Ok((self.clone(), Criteria::none()))
                } else if !clauses.iter().any(|c| is_server(c)) {
                    Ok((Criteria::none(), self.clone()))
                } else {
                    Err(TreeError::InvalidCriteriaSplit(
                        "disjunction mixes server and client fields".into(),
                    ))
                }
            }
        }
    }
}
