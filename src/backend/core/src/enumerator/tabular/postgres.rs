//! PostgreSQL query executor.
//!
//! Relations render to parameterised SQL. Rows come back as `jsonb` objects so any table
//! shape maps onto [`TableRow`] without a per-table `FromRow` type:
//!
//! ```sql
//! SELECT to_jsonb(t) AS row FROM "posts" AS t
//! WHERE (t."updated_at" > $1 OR (t."updated_at" = $2 AND t."id" > $3))
//! ORDER BY t."updated_at" ASC, t."id" ASC
//! LIMIT 100
//! ```

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use super::executor::QueryExecutor;
use super::relation::{Predicate, Relation, TableRow};
use crate::cursor::CursorValue;
use crate::error::Result;

/// Alias every relation's table is selected under.
const TABLE_ALIAS: &str = "t";

/// A rendered statement and its positional bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub binds: Vec<CursorValue>,
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_ref(name: &str) -> String {
    format!("{}.{}", TABLE_ALIAS, quote_ident(name))
}

struct SqlWriter {
    binds: Vec<CursorValue>,
}

impl SqlWriter {
    fn placeholder(&mut self, value: &CursorValue) -> String {
        self.binds.push(value.clone());
        format!("${}", self.binds.len())
    }

    fn predicate(&mut self, predicate: &Predicate) -> String {
        match predicate {
            Predicate::Compare { column, op, value } => {
                let placeholder = self.placeholder(value);
                format!("{} {} {}", column_ref(column), op.sql_operator(), placeholder)
            }
            Predicate::In { values, .. } if values.is_empty() => "FALSE".to_string(),
            Predicate::In { columns, values } => {
                let tuple = |parts: Vec<String>| {
                    if parts.len() == 1 {
                        parts.into_iter().collect::<String>()
                    } else {
                        format!("({})", parts.join(", "))
                    }
                };
                let lhs = tuple(columns.iter().map(|c| column_ref(c)).collect());
                let rhs: Vec<String> = values
                    .iter()
                    .map(|key| tuple(key.iter().map(|v| self.placeholder(v)).collect()))
                    .collect();
                format!("{} IN ({})", lhs, rhs.join(", "))
            }
            Predicate::IsNull(column) => format!("{} IS NULL", column_ref(column)),
            Predicate::And(parts) => self.join(parts, " AND ", "TRUE"),
            Predicate::Or(parts) => self.join(parts, " OR ", "FALSE"),
        }
    }

    fn join(&mut self, parts: &[Predicate], separator: &str, empty: &str) -> String {
        if parts.is_empty() {
            return empty.to_string();
        }
        let rendered: Vec<String> = parts.iter().map(|p| self.predicate(p)).collect();
        format!("({})", rendered.join(separator))
    }

    fn where_clause(&mut self, relation: &Relation) -> String {
        match relation.predicate() {
            Some(predicate) => format!(" WHERE {}", self.predicate(&predicate)),
            None => String::new(),
        }
    }
}

/// Render the row-fetching statement for `relation`.
pub fn render_select(relation: &Relation) -> SqlQuery {
    let mut writer = SqlWriter { binds: Vec::new() };

    let projection = match relation.projection() {
        Some(columns) => {
            let pairs: Vec<String> = columns
                .iter()
                .map(|c| format!("'{}', {}", c.replace('\'', "''"), column_ref(c)))
                .collect();
            format!("jsonb_build_object({})", pairs.join(", "))
        }
        None => format!("to_jsonb({})", TABLE_ALIAS),
    };

    let mut sql = format!(
        "SELECT {} AS row FROM {} AS {}",
        projection,
        quote_ident(relation.table_name()),
        TABLE_ALIAS
    );
    sql.push_str(&writer.where_clause(relation));

    if !relation.ordering().is_empty() {
        let order: Vec<String> = relation
            .ordering()
            .iter()
            .map(|f| format!("{} {}", column_ref(&f.name), f.direction.sql_keyword()))
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    if let Some(limit) = relation.row_limit() {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    SqlQuery {
        sql,
        binds: writer.binds,
    }
}

/// Render the counting statement for `relation`; order and limit are ignored.
pub fn render_count(relation: &Relation) -> SqlQuery {
    let mut writer = SqlWriter { binds: Vec::new() };
    let mut sql = format!(
        "SELECT COUNT(*) FROM {} AS {}",
        quote_ident(relation.table_name()),
        TABLE_ALIAS
    );
    sql.push_str(&writer.where_clause(relation));
    SqlQuery {
        sql,
        binds: writer.binds,
    }
}

/// Strings that parse as UUIDs bind as `uuid` so they compare against uuid columns.
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &CursorValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        CursorValue::Null => query.bind(None::<String>),
        CursorValue::Boolean(b) => query.bind(*b),
        CursorValue::Integer(i) => query.bind(*i),
        CursorValue::Float(f) => query.bind(*f),
        CursorValue::String(s) => match uuid::Uuid::parse_str(s) {
            Ok(id) => query.bind(id),
            Err(_) => query.bind(s.clone()),
        },
        CursorValue::Timestamp(ts) => query.bind(*ts),
    }
}

/// Executes relations against PostgreSQL.
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    #[instrument(skip(self, relation), fields(table = %relation.table_name()))]
    async fn fetch(&self, relation: &Relation) -> Result<Vec<TableRow>> {
        let rendered = render_select(relation);
        debug!(sql = %rendered.sql, binds = rendered.binds.len(), "Fetching batch");

        let query = rendered
            .binds
            .iter()
            .fold(sqlx::query(&rendered.sql), bind_value);
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                let value: serde_json::Value = row.try_get("row")?;
                TableRow::try_from(value)
            })
            .collect()
    }

    #[instrument(skip(self, relation), fields(table = %relation.table_name()))]
    async fn count(&self, relation: &Relation) -> Result<u64> {
        let rendered = render_count(relation);
        let query = rendered
            .binds
            .iter()
            .fold(sqlx::query(&rendered.sql), bind_value);
        let count: i64 = query.fetch_one(&self.pool).await?.try_get(0)?;
        Ok(count.max(0) as u64)
    }
}
