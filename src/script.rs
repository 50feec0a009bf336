//! Statement splitting, parameter binding, and the [`ScriptRunner`] trait that lets the
//! pack algorithm in `src/pack.rs` run unmodified against more than one backend.
//!
//! A `ScriptRunner` executes SQL written in the neutral template syntax from
//! `src/dialect.rs`: `%(TRUE)s`/`%(FALSE)s`/`%(OCTET_LENGTH)s` literals and `%(name)s`
//! parameter placeholders. Each backend rewrites a template via its [`DialectProfile`]
//! before handing it to the driver.

use std::collections::HashMap;

use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, take_till};
use nom::character::complete::char;
use nom::combinator::{map, recognize};
use nom::multi::many0;
use nom::sequence::{delimited, pair};
use nom::IResult;

use crate::dialect::DialectProfile;
use crate::error::{Error, ErrorKind};
use crate::{Oid, Tid};

/// A bound parameter value. Kept as a small closed enum rather than a trait object so
/// both backends can match on it exhaustively when converting to their driver's own
/// bind type.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Oid(Oid),
    Tid(Tid),
    I64(i64),
    Bytes(Vec<u8>),
    Text(String),
    Bool(bool),
    Null,
}

/// The parameters bound to one template execution, keyed by placeholder name.
#[derive(Debug, Clone, Default)]
pub struct ParamMap(HashMap<String, Param>);

impl ParamMap {
    pub fn new() -> Self {
        ParamMap(HashMap::new())
    }

    pub fn set(mut self, name: &str, value: Param) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> crate::Result<&Param> {
        self.0
            .get(name)
            .ok_or_else(|| Error::from(ErrorKind::UnboundPlaceholder(name.to_string())))
    }

    /// Look up every name in `order`, in order, failing on the first unbound name.
    pub fn ordered(&self, order: &[String]) -> crate::Result<Vec<&Param>> {
        order.iter().map(|name| self.get(name)).collect()
    }
}

/// A row returned by a backend query, abstracted just enough for `src/pack.rs` and
/// `src/refs.rs` to read the handful of column types the pack algorithm needs.
pub trait SqlRow {
    fn get_oid(&self, idx: usize) -> crate::Result<Oid>;
    fn get_tid(&self, idx: usize) -> crate::Result<Tid>;
    fn get_opt_tid(&self, idx: usize) -> crate::Result<Option<Tid>>;
    fn get_bytes(&self, idx: usize) -> crate::Result<Vec<u8>>;
    /// Like [`Self::get_bytes`], but tolerant of `NULL` (an `object_state.state` tombstone).
    fn get_opt_bytes(&self, idx: usize) -> crate::Result<Option<Vec<u8>>>;
    fn get_bool(&self, idx: usize) -> crate::Result<bool>;
    fn get_i64(&self, idx: usize) -> crate::Result<i64>;
    /// Like [`Self::get_i64`], but tolerant of `NULL` (e.g. `OCTET_LENGTH` of a tombstone).
    fn get_opt_i64(&self, idx: usize) -> crate::Result<Option<i64>>;
    fn get_opt_text(&self, idx: usize) -> crate::Result<Option<String>>;
}

/// Executes templates against one backend inside one open transaction.
///
/// Implementors own the driver-specific connection/transaction handle; `src/pack.rs`
/// only ever talks to this trait, never to `postgres`/`rusqlite` directly.
pub trait ScriptRunner {
    type Row: SqlRow;

    fn profile(&self) -> &dyn DialectProfile;

    /// Run a template expected to mutate rows, returning the affected row count as
    /// reported by the driver. Not reliable on every backend; see
    /// [`DialectProfile::reliable_rowcount`].
    fn execute(&mut self, template: &str, params: &ParamMap) -> crate::Result<u64>;

    /// Run a template expected to return rows.
    fn query(&mut self, template: &str, params: &ParamMap) -> crate::Result<Vec<Self::Row>>;

    fn query_one(&mut self, template: &str, params: &ParamMap) -> crate::Result<Option<Self::Row>> {
        Ok(self.query(template, params)?.into_iter().next())
    }

    /// Run every statement in a DDL/setup script, in order, with no bound parameters.
    /// Grounded on `_run_script`/`_run_script_stmt`: comments are stripped, blank
    /// statements are skipped, and each statement runs as its own `execute`.
    fn run_script(&mut self, script: &str) -> crate::Result<()> {
        for stmt in split_statements(script)? {
            self.execute(&stmt, &ParamMap::new())?;
        }
        Ok(())
    }

    /// Run a query that may return a large object value truncated by the driver's
    /// default inline-fetch plan. On a backend whose [`DialectProfile`] recognizes the
    /// truncation error, retries once with `retry_template`, an equivalent statement
    /// written so the driver recompiles it with a streaming output plan instead of an
    /// inline buffer.
    fn run_lob(
        &mut self,
        template: &str,
        retry_template: &str,
        params: &ParamMap,
    ) -> crate::Result<Vec<Self::Row>> {
        match self.query(template, params) {
            Err(e) if self.profile().is_truncated_blob_error(&e) => {
                log::warn!("large object value truncated, retrying with streaming output plan");
                self.query(retry_template, params)
            }
            other => other,
        }
    }
}

fn quoted_string(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('\''),
        many0(alt((tag("''"), is_not("'")))),
        char('\''),
    ))(input)
}

fn line_comment(input: &str) -> IResult<&str, &str> {
    recognize(pair(tag("--"), take_till(|c| c == '\n')))(input)
}

fn lone_dash(input: &str) -> IResult<&str, &str> {
    map(char('-'), |_| "-")(input)
}

fn chunk(input: &str) -> IResult<&str, &str> {
    alt((
        quoted_string,
        map(line_comment, |_| ""),
        is_not(";'-"),
        lone_dash,
    ))(input)
}

fn statement_text(input: &str) -> IResult<&str, String> {
    map(many0(chunk), |parts: Vec<&str>| parts.concat())(input)
}

/// Split a script into individual statements: comments are dropped, single-quoted
/// string literals are treated as opaque (a `;` inside one does not split), and each
/// resulting statement is trimmed; empty statements are dropped.
pub fn split_statements(script: &str) -> crate::Result<Vec<String>> {
    let mut remaining = script;
    let mut out = Vec::new();
    while !remaining.is_empty() {
        let (rest, text) = statement_text(remaining)
            .map_err(|e| ErrorKind::ScriptParse(e.to_string()))?;
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
        remaining = match rest.strip_prefix(';') {
            Some(after) => after,
            None => {
                if rest.is_empty() {
                    rest
                } else {
                    return Err(
                        ErrorKind::ScriptParse(format!("unexpected trailing input: {rest:?}"))
                            .into(),
                    );
                }
            }
        };
    }
    Ok(out)
}
