//! SQLite backend: [`SqliteProfile`] and [`SqliteRunner`].
//!
//! Grounded on the retention-sweep example
//! (`other_examples/...drift-storage-src-retention.rs`): `rusqlite::{Connection,
//! Transaction}`, RAII transactions, and owned row extraction rather than borrowing a
//! `rusqlite::Row` past its statement's lifetime.

use rusqlite::types::{ToSql, Value};
use rusqlite::{Row as RusqliteRow, Transaction};

use crate::dialect::{rewrite, DialectProfile, PlaceholderStyle};
use crate::error::{Error, ErrorKind};
use crate::script::{Param, ParamMap, ScriptRunner, SqlRow};
use crate::{Oid, Tid};

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteProfile;

impl DialectProfile for SqliteProfile {
    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Colon
    }

    /// SQLite has no `OCTET_LENGTH`; `LENGTH` returns the byte length of a BLOB (and the
    /// UTF-8 byte length is irrelevant here since `state` is always stored as a BLOB).
    fn octet_length_fn(&self) -> &'static str {
        "LENGTH"
    }

    fn create_temp_visit_table_sql(&self) -> &'static str {
        "CREATE TEMP TABLE IF NOT EXISTS temp_pack_visit (\
            zoid INTEGER NOT NULL PRIMARY KEY, \
            keep_tid INTEGER\
        )"
    }

    /// SQLite has no table-level lock statement; a single connection already
    /// serializes writers, so this just takes a write lock on the sentinel row, giving
    /// the same call-site shape (one statement, first thing in the pack transaction)
    /// as the Postgres profile's `LOCK TABLE`.
    fn acquire_commit_lock_sql(&self) -> &'static str {
        "UPDATE commit_lock SET token = token + 1 WHERE id = 1"
    }

    fn is_lock_not_available(&self, err: &Error) -> bool {
        matches!(err.kind, ErrorKind::Conflict)
    }
}

/// An owned snapshot of one result row, so `query` can return `Vec<SqliteRow>` without
/// borrowing from the `rusqlite::Statement` that produced it.
pub struct SqliteRow(Vec<Value>);

impl SqliteRow {
    fn from_row(row: &RusqliteRow) -> rusqlite::Result<Self> {
        let columns = row.as_ref().column_count();
        let values = (0..columns)
            .map(|i| row.get::<_, Value>(i))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(SqliteRow(values))
    }

    fn type_error(&self, idx: usize, expected: &str) -> Error {
        ErrorKind::Internal(format!(
            "column {idx} is {:?}, expected {expected}",
            self.0.get(idx).map(|v| value_kind(v))
        ))
        .into()
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Integer(_) => "integer",
        Value::Real(_) => "real",
        Value::Text(_) => "text",
        Value::Blob(_) => "blob",
    }
}

impl SqlRow for SqliteRow {
    fn get_oid(&self, idx: usize) -> crate::Result<Oid> {
        match self.0.get(idx) {
            Some(Value::Integer(i)) => Ok(*i as u64),
            _ => Err(self.type_error(idx, "integer")),
        }
    }

    fn get_tid(&self, idx: usize) -> crate::Result<Tid> {
        match self.0.get(idx) {
            Some(Value::Integer(i)) => Ok(*i),
            _ => Err(self.type_error(idx, "integer")),
        }
    }

    fn get_opt_tid(&self, idx: usize) -> crate::Result<Option<Tid>> {
        match self.0.get(idx) {
            Some(Value::Integer(i)) => Ok(Some(*i)),
            Some(Value::Null) | None => Ok(None),
            _ => Err(self.type_error(idx, "integer or null")),
        }
    }

    fn get_bytes(&self, idx: usize) -> crate::Result<Vec<u8>> {
        match self.0.get(idx) {
            Some(Value::Blob(b)) => Ok(b.clone()),
            Some(Value::Text(s)) => Ok(s.clone().into_bytes()),
            _ => Err(self.type_error(idx, "blob")),
        }
    }

    fn get_opt_bytes(&self, idx: usize) -> crate::Result<Option<Vec<u8>>> {
        match self.0.get(idx) {
            Some(Value::Blob(b)) => Ok(Some(b.clone())),
            Some(Value::Text(s)) => Ok(Some(s.clone().into_bytes())),
            Some(Value::Null) | None => Ok(None),
            _ => Err(self.type_error(idx, "blob or null")),
        }
    }

    fn get_bool(&self, idx: usize) -> crate::Result<bool> {
        match self.0.get(idx) {
            Some(Value::Integer(i)) => Ok(*i != 0),
            _ => Err(self.type_error(idx, "integer")),
        }
    }

    fn get_i64(&self, idx: usize) -> crate::Result<i64> {
        match self.0.get(idx) {
            Some(Value::Integer(i)) => Ok(*i),
            _ => Err(self.type_error(idx, "integer")),
        }
    }

    fn get_opt_i64(&self, idx: usize) -> crate::Result<Option<i64>> {
        match self.0.get(idx) {
            Some(Value::Integer(i)) => Ok(Some(*i)),
            Some(Value::Null) | None => Ok(None),
            _ => Err(self.type_error(idx, "integer or null")),
        }
    }

    fn get_opt_text(&self, idx: usize) -> crate::Result<Option<String>> {
        match self.0.get(idx) {
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(Value::Blob(b)) => Ok(Some(String::from_utf8_lossy(b).into_owned())),
            Some(Value::Null) | None => Ok(None),
            _ => Err(self.type_error(idx, "text or null")),
        }
    }
}

fn bind(params: &ParamMap, order: &[String]) -> crate::Result<Vec<(String, Box<dyn ToSql>)>> {
    let values = params.ordered(order)?;
    Ok(order
        .iter()
        .zip(values)
        .map(|(name, p)| {
            let boxed: Box<dyn ToSql> = match p {
                Param::Oid(o) => Box::new(*o as i64),
                Param::Tid(t) => Box::new(*t),
                Param::I64(i) => Box::new(*i),
                Param::Bytes(b) => Box::new(b.clone()),
                Param::Text(s) => Box::new(s.clone()),
                Param::Bool(b) => Box::new(*b),
                Param::Null => Box::new(Option::<i64>::None),
            };
            (format!(":{name}"), boxed)
        })
        .collect())
}

/// A [`ScriptRunner`] over one open `rusqlite::Transaction`.
pub struct SqliteRunner<'a, 'b> {
    tx: &'a Transaction<'b>,
    profile: SqliteProfile,
}

impl<'a, 'b> SqliteRunner<'a, 'b> {
    pub fn new(tx: &'a Transaction<'b>) -> Self {
        SqliteRunner {
            tx,
            profile: SqliteProfile,
        }
    }
}

impl<'a, 'b> ScriptRunner for SqliteRunner<'a, 'b> {
    type Row = SqliteRow;

    fn profile(&self) -> &dyn DialectProfile {
        &self.profile
    }

    fn execute(&mut self, template: &str, params: &ParamMap) -> crate::Result<u64> {
        let rewritten = rewrite(&self.profile, template);
        let bound = bind(params, &rewritten.order)?;
        let refs: Vec<(&str, &dyn ToSql)> =
            bound.iter().map(|(n, v)| (n.as_str(), v.as_ref())).collect();
        self.tx
            .execute(&rewritten.sql, refs.as_slice())
            .map(|affected| affected as u64)
            .map_err(|e| {
                log::warn!("sqlite statement failed: {}", rewritten.sql);
                e.into()
            })
    }

    fn query(&mut self, template: &str, params: &ParamMap) -> crate::Result<Vec<Self::Row>> {
        let rewritten = rewrite(&self.profile, template);
        let bound = bind(params, &rewritten.order)?;
        let refs: Vec<(&str, &dyn ToSql)> =
            bound.iter().map(|(n, v)| (n.as_str(), v.as_ref())).collect();
        let rows = (|| -> rusqlite::Result<Vec<SqliteRow>> {
            let mut stmt = self.tx.prepare(&rewritten.sql)?;
            stmt.query_map(refs.as_slice(), SqliteRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
        })();
        rows.map_err(|e| {
            log::warn!("sqlite statement failed: {}", rewritten.sql);
            e.into()
        })
    }
}
