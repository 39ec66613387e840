//! Queryable relation handles and the keyset predicate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::str::FromStr;

use crate::cursor::CursorValue;
use crate::error::{ErrorCode, IterationError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Sort Direction
// ═══════════════════════════════════════════════════════════════════════════════

/// Sort direction of an ordering column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending order (A-Z, 0-9, oldest first).
    #[default]
    Asc,
    /// Descending order (Z-A, 9-0, newest first).
    Desc,
}

impl SortDirection {
    /// Get the SQL keyword for this direction.
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// The strict comparison selecting rows after a position.
    pub fn after(&self) -> Comparison {
        match self {
            Self::Asc => Comparison::Gt,
            Self::Desc => Comparison::Lt,
        }
    }

    /// The inclusive comparison selecting rows at or after a position.
    pub fn at_or_after(&self) -> Comparison {
        match self {
            Self::Asc => Comparison::Gte,
            Self::Desc => Comparison::Lte,
        }
    }
}

impl FromStr for SortDirection {
    type Err = IterationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Asc),
            "desc" | "descending" => Ok(Self::Desc),
            other => Err(IterationError::configuration(
                ErrorCode::InvalidSortDirection,
                format!("order must be asc or desc, got {:?}", other),
            )),
        }
    }
}

impl std::fmt::Display for SortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sort Field
// ═══════════════════════════════════════════════════════════════════════════════

/// A column of the ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    /// The column name.
    pub name: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl SortField {
    pub fn asc(name: impl Into<String>) -> Self {
        Self::new(name, SortDirection::Asc)
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self::new(name, SortDirection::Desc)
    }

    pub fn new(name: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Predicates
// ═══════════════════════════════════════════════════════════════════════════════

/// Comparison operators usable in a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Comparison {
    pub fn sql_operator(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    /// Whether `left OP right` holds given `left.cmp(right)`.
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::NotEq => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Lte => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Gte => ordering != Ordering::Less,
        }
    }
}

/// A boolean filter over rows, renderable to SQL and evaluable in memory.
///
/// Comparisons involving NULL never hold, as in SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        op: Comparison,
        value: CursorValue,
    },
    /// Row tuple over `columns` equals one of `values`.
    In {
        columns: Vec<String>,
        values: Vec<Vec<CursorValue>>,
    },
    IsNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: Comparison, value: impl Into<CursorValue>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<CursorValue>) -> Self {
        Self::compare(column, Comparison::Eq, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<CursorValue>) -> Self {
        Self::compare(column, Comparison::Gt, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<CursorValue>) -> Self {
        Self::compare(column, Comparison::Lt, value)
    }

    /// Evaluate this predicate against a row.
    pub fn matches(&self, row: &TableRow) -> bool {
        match self {
            Self::Compare { column, op, value } => match row.cursor_value(column) {
                Some(actual) if !actual.is_null() && !value.is_null() => actual
                    .compare(value)
                    .map(|ordering| op.holds(ordering))
                    .unwrap_or(false),
                _ => false,
            },
            Self::In { columns, values } => match row.key(columns) {
                Ok(key) => values.iter().any(|candidate| tuple_eq(&key, candidate)),
                Err(_) => false,
            },
            Self::IsNull(column) => row.get(column).map_or(true, Value::is_null),
            Self::And(parts) => parts.iter().all(|p| p.matches(row)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(row)),
        }
    }
}

/// Build the lexicographic seek predicate `(k1..kn) OP (c1..cn)`.
///
/// Every field compares strictly except the last, which compares inclusively when
/// `inclusive` is set:
///
/// ```text
/// k1 > c1 OR (k1 = c1 AND (k2 > c2 OR (k2 = c2 AND k3 >= c3)))
/// ```
pub fn keyset_predicate(fields: &[SortField], position: &[CursorValue], inclusive: bool) -> Predicate {
    debug_assert_eq!(fields.len(), position.len());
    debug_assert!(!fields.is_empty());

    let last = fields.len() - 1;
    let mut predicate = {
        let field = &fields[last];
        let op = if inclusive {
            field.direction.at_or_after()
        } else {
            field.direction.after()
        };
        Predicate::compare(field.name.clone(), op, position[last].clone())
    };

    for (field, value) in fields[..last].iter().zip(&position[..last]).rev() {
        predicate = Predicate::Or(vec![
            Predicate::compare(field.name.clone(), field.direction.after(), value.clone()),
            Predicate::And(vec![Predicate::eq(field.name.clone(), value.clone()), predicate]),
        ]);
    }
    predicate
}

/// Tuple equality under [`CursorValue::compare`].
pub(crate) fn tuple_eq(left: &[CursorValue], right: &[CursorValue]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .all(|(a, b)| a.compare(b) == Some(Ordering::Equal))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Relation
// ═══════════════════════════════════════════════════════════════════════════════

/// A queryable relation: a table plus filters, projection, order and limit.
///
/// Relations are plain values; a [`QueryExecutor`](super::QueryExecutor) runs them.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    table: String,
    primary_key: Vec<String>,
    select: Option<Vec<String>>,
    filters: Vec<Predicate>,
    order_by: Vec<SortField>,
    limit: Option<u64>,
}

impl Relation {
    /// A relation over every row of `table`, keyed by `id`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: vec!["id".to_string()],
            select: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Add a filter; filters are combined with AND.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn order_by(mut self, field: SortField) -> Self {
        self.order_by.push(field);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Drop any order and limit clauses.
    pub fn unordered(mut self) -> Self {
        self.order_by.clear();
        self.limit = None;
        self
    }

    /// Narrow this relation to exactly the given primary-key tuples, keeping existing filters.
    pub fn constrained_to(&self, keys: Vec<Vec<CursorValue>>) -> Self {
        let columns = self.primary_key.clone();
        self.clone().filter(Predicate::In {
            columns,
            values: keys,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_key
    }

    pub fn projection(&self) -> Option<&[String]> {
        self.select.as_deref()
    }

    pub fn filters(&self) -> &[Predicate] {
        &self.filters
    }

    pub fn ordering(&self) -> &[SortField] {
        &self.order_by
    }

    pub fn row_limit(&self) -> Option<u64> {
        self.limit
    }

    /// The combined filter, if any.
    pub fn predicate(&self) -> Option<Predicate> {
        match self.filters.len() {
            0 => None,
            1 => Some(self.filters[0].clone()),
            _ => Some(Predicate::And(self.filters.clone())),
        }
    }

    /// Check whether a row satisfies every filter.
    pub fn admits(&self, row: &TableRow) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Table Row
// ═══════════════════════════════════════════════════════════════════════════════

/// A fetched row, as a JSON object keyed by column name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableRow(Map<String, Value>);

impl TableRow {
    pub fn new(columns: Map<String, Value>) -> Self {
        Self(columns)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    /// A column as a cursor scalar; `None` when missing or not a scalar.
    pub fn cursor_value(&self, column: &str) -> Option<CursorValue> {
        self.0.get(column).and_then(CursorValue::from_column)
    }

    /// The tuple of `columns`, in order.
    pub fn key(&self, columns: &[String]) -> Result<Vec<CursorValue>> {
        columns
            .iter()
            .map(|column| {
                self.cursor_value(column).ok_or_else(|| {
                    IterationError::configuration(
                        ErrorCode::InvalidConfiguration,
                        format!("row has no scalar value for column {:?}", column),
                    )
                })
            })
            .collect()
    }

    /// Keep only the given columns.
    pub fn project(&self, columns: &[String]) -> Self {
        Self(
            columns
                .iter()
                .filter_map(|c| self.0.get(c).map(|v| (c.clone(), v.clone())))
                .collect(),
        )
    }

    /// Deserialize the row into a typed record.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl TryFrom<Value> for TableRow {
    type Error = IterationError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(IterationError::new(
                ErrorCode::DeserializationError,
                format!("expected a JSON object row, got {}", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> TableRow {
        TableRow::try_from(value).unwrap()
    }

    #[test]
    fn test_keyset_predicate_two_columns() {
        let fields = [SortField::asc("updated_at"), SortField::asc("id")];
        let position = [CursorValue::Integer(10), CursorValue::Integer(5)];

        let strict = keyset_predicate(&fields, &position, false);
        assert_eq!(
            strict,
            Predicate::Or(vec![
                Predicate::gt("updated_at", 10),
                Predicate::And(vec![Predicate::eq("updated_at", 10), Predicate::gt("id", 5)]),
            ])
        );

        let inclusive = keyset_predicate(&fields, &position, true);
        assert!(inclusive.matches(&row(json!({"updated_at": 10, "id": 5}))));
        assert!(!strict.matches(&row(json!({"updated_at": 10, "id": 5}))));
        assert!(strict.matches(&row(json!({"updated_at": 10, "id": 6}))));
        assert!(strict.matches(&row(json!({"updated_at": 11, "id": 1}))));
        assert!(!strict.matches(&row(json!({"updated_at": 9, "id": 99}))));
    }

    #[test]
    fn test_keyset_predicate_descending() {
        let fields = [SortField::desc("id")];
        let predicate = keyset_predicate(&fields, &[CursorValue::Integer(5)], false);
        assert!(predicate.matches(&row(json!({"id": 4}))));
        assert!(!predicate.matches(&row(json!({"id": 5}))));
    }

    #[test]
    fn test_null_comparisons_never_hold() {
        let predicate = Predicate::gt("score", 1);
        assert!(!predicate.matches(&row(json!({"score": null}))));
        assert!(!predicate.matches(&row(json!({}))));
        assert!(Predicate::IsNull("score".into()).matches(&row(json!({}))));
    }

    #[test]
    fn test_constrained_to_keeps_filters() {
        let relation = Relation::new("users").filter(Predicate::eq("active", true));
        let narrowed = relation.constrained_to(vec![vec![CursorValue::Integer(1)]]);
        assert_eq!(narrowed.filters().len(), 2);
        assert!(narrowed.admits(&row(json!({"id": 1, "active": true}))));
        assert!(!narrowed.admits(&row(json!({"id": 2, "active": true}))));
        assert!(!narrowed.admits(&row(json!({"id": 1, "active": false}))));
    }

    #[test]
    fn test_sort_direction_parse() {
        assert_eq!("DESC".parse::<SortDirection>().unwrap(), SortDirection::Desc);
        let err = "sideways".parse::<SortDirection>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSortDirection);
    }
}
