//! PostgreSQL backend: [`PostgresProfile`] and [`PostgresRunner`].
//!
//! Grounded on the teacher's own driver usage (`eugene/src/tracing/queries.rs`, which
//! runs hand-written SQL against a `postgres::Transaction` and extracts columns with
//! `row.try_get`), adapted to the template-rewriting layer in `src/dialect.rs`.

use postgres::types::ToSql;
use postgres::Transaction;

use crate::dialect::{rewrite, DialectProfile, PlaceholderStyle};
use crate::error::{Error, ErrorKind};
use crate::script::{Param, ParamMap, ScriptRunner, SqlRow};
use crate::{Oid, Tid};

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresProfile;

impl DialectProfile for PostgresProfile {
    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn create_temp_visit_table_sql(&self) -> &'static str {
        "CREATE TEMPORARY TABLE IF NOT EXISTS temp_pack_visit (\
            zoid BIGINT NOT NULL PRIMARY KEY, \
            keep_tid BIGINT\
        ) ON COMMIT DROP"
    }

    fn acquire_commit_lock_sql(&self) -> &'static str {
        "LOCK TABLE commit_lock IN EXCLUSIVE MODE"
    }

    fn acquire_commit_lock_nowait_sql(&self) -> &'static str {
        "LOCK TABLE commit_lock IN EXCLUSIVE MODE NOWAIT"
    }

    fn is_lock_not_available(&self, err: &Error) -> bool {
        matches!(
            &err.kind,
            ErrorKind::Postgres(e) if e.code() == Some(&postgres::error::SqlState::LOCK_NOT_AVAILABLE)
        )
    }
}

/// Wraps a column of a `postgres::Row`.
pub struct PostgresRow(postgres::Row);

impl SqlRow for PostgresRow {
    fn get_oid(&self, idx: usize) -> crate::Result<Oid> {
        let v: i64 = self.0.try_get(idx)?;
        Ok(v as u64)
    }

    fn get_tid(&self, idx: usize) -> crate::Result<Tid> {
        Ok(self.0.try_get(idx)?)
    }

    fn get_opt_tid(&self, idx: usize) -> crate::Result<Option<Tid>> {
        Ok(self.0.try_get(idx)?)
    }

    fn get_bytes(&self, idx: usize) -> crate::Result<Vec<u8>> {
        Ok(self.0.try_get(idx)?)
    }

    fn get_opt_bytes(&self, idx: usize) -> crate::Result<Option<Vec<u8>>> {
        Ok(self.0.try_get(idx)?)
    }

    fn get_bool(&self, idx: usize) -> crate::Result<bool> {
        Ok(self.0.try_get(idx)?)
    }

    fn get_i64(&self, idx: usize) -> crate::Result<i64> {
        Ok(self.0.try_get(idx)?)
    }

    fn get_opt_i64(&self, idx: usize) -> crate::Result<Option<i64>> {
        Ok(self.0.try_get(idx)?)
    }

    fn get_opt_text(&self, idx: usize) -> crate::Result<Option<String>> {
        Ok(self.0.try_get(idx)?)
    }
}

fn bind(params: &ParamMap, order: &[String]) -> crate::Result<Vec<Box<dyn ToSql + Sync + Send>>> {
    let values = params.ordered(order)?;
    Ok(values
        .into_iter()
        .map(|p| -> Box<dyn ToSql + Sync + Send> {
            match p {
                Param::Oid(o) => Box::new(*o as i64),
                Param::Tid(t) => Box::new(*t),
                Param::I64(i) => Box::new(*i),
                Param::Bytes(b) => Box::new(b.clone()),
                Param::Text(s) => Box::new(s.clone()),
                Param::Bool(b) => Box::new(*b),
                Param::Null => Box::new(Option::<i64>::None),
            }
        })
        .collect())
}

/// A [`ScriptRunner`] over one open `postgres::Transaction`. The caller owns the
/// transaction's lifetime and decides when to commit or roll back; this type never
/// calls `commit`/`rollback` itself.
pub struct PostgresRunner<'a, 'b> {
    tx: &'a mut Transaction<'b>,
    profile: PostgresProfile,
}

impl<'a, 'b> PostgresRunner<'a, 'b> {
    pub fn new(tx: &'a mut Transaction<'b>) -> Self {
        PostgresRunner {
            tx,
            profile: PostgresProfile,
        }
    }
}

impl<'a, 'b> ScriptRunner for PostgresRunner<'a, 'b> {
    type Row = PostgresRow;

    fn profile(&self) -> &dyn DialectProfile {
        &self.profile
    }

    fn execute(&mut self, template: &str, params: &ParamMap) -> crate::Result<u64> {
        let rewritten = rewrite(&self.profile, template);
        let boxed = bind(params, &rewritten.order)?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
        self.tx.execute(&rewritten.sql, &refs).map_err(|e| {
            log::warn!("postgres statement failed: {}", rewritten.sql);
            e.into()
        })
    }

    fn query(&mut self, template: &str, params: &ParamMap) -> crate::Result<Vec<Self::Row>> {
        let rewritten = rewrite(&self.profile, template);
        let boxed = bind(params, &rewritten.order)?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
        let rows = self.tx.query(&rewritten.sql, &refs).map_err(|e| {
            log::warn!("postgres statement failed: {}", rewritten.sql);
            e.into()
        })?;
        Ok(rows.into_iter().map(PostgresRow).collect())
    }
}
