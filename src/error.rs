//! Error taxonomy for the pack engine.
//!
//! Follows the same shape this crate uses everywhere else: a flat `ErrorKind` describing
//! *what* went wrong, wrapped in an `Error` that accumulates human-readable context as it
//! propagates up through `?`. Nothing here swallows a driver error or retries silently;
//! see `ContextualError`/`ContextualResult` for how callers attach context.

use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::num::ParseIntError;

use crate::{Oid, Tid};

#[derive(Debug)]
pub struct Error {
    context: Vec<String>,
    pub kind: ErrorKind,
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(e: E) -> Self {
        Error {
            context: vec![],
            kind: e.into(),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind)?;
        for ctx in &self.context {
            write!(f, "\n  {}", ctx)?;
        }
        Ok(())
    }
}

impl StdError for Error {}

pub trait ContextualError {
    fn with_context<S: Into<String>>(self, ctx: S) -> Error;
}
pub trait ContextualResult<T, E> {
    fn with_context<S: Into<String>>(self, ctx: S) -> Result<T, Error>;
}

impl<T> ContextualError for T
where
    T: Into<ErrorKind>,
{
    fn with_context<S: Into<String>>(self, ctx: S) -> Error {
        Error {
            context: vec![ctx.into()],
            kind: self.into(),
        }
    }
}

impl<T, E> ContextualResult<T, E> for Result<T, E>
where
    E: Into<ErrorKind>,
{
    fn with_context<S: Into<String>>(self, ctx: S) -> Result<T, Error> {
        self.map_err(|e| e.into().with_context(ctx))
    }
}

impl ContextualError for Error {
    fn with_context<S: Into<String>>(mut self, ctx: S) -> Error {
        self.context.push(ctx.into());
        self
    }
}

impl<T> ContextualResult<T, Error> for Result<T, Error> {
    fn with_context<S: Into<String>>(self, ctx: S) -> Result<T, Error> {
        self.map_err(|e| e.with_context(ctx))
    }
}

/// The kinds of failure surfaced by this crate: `NotFound`, `Disconnected`,
/// `CorruptedState`, `Conflict`, `Internal`, plus the wrapper variants needed to carry
/// driver/parsing/IO errors through `?`.
#[derive(Debug)]
pub enum ErrorKind {
    /// `iter_object_history` was asked about an oid with no `current_object` row.
    NotFound(Oid),
    /// A driver error was classified as connection-broken; the caller should retry
    /// after replica failover.
    Disconnected,
    /// `RefExtractor` failed to interpret a stored state at `(tid, zoid)`.
    CorruptedState { tid: Tid, zoid: Oid },
    /// Lock acquisition deadlocked or timed out; the caller may retry.
    Conflict,
    /// An invariant the algorithm depends on was violated, e.g. a `keep_tid` that is
    /// still `NULL` for a `keep = TRUE` row after the closure has reached a fixed point.
    Internal(String),
    /// A placeholder token (`%(name)s`) in an abstract SQL fragment has no matching
    /// parameter bound to it.
    UnboundPlaceholder(String),
    /// A SQL script could not be split into statements.
    ScriptParse(String),
    Postgres(postgres::Error),
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    InvalidNumber(ParseIntError),
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound(oid) => write!(f, "no such object: {oid}"),
            ErrorKind::Disconnected => write!(f, "connection to database lost"),
            ErrorKind::CorruptedState { tid, zoid } => {
                write!(f, "could not interpret state for zoid={zoid} tid={tid}")
            }
            ErrorKind::Conflict => write!(f, "lock acquisition conflicted"),
            ErrorKind::Internal(msg) => write!(f, "internal invariant violated: {msg}"),
            ErrorKind::UnboundPlaceholder(name) => write!(f, "unbound placeholder: {name}"),
            ErrorKind::ScriptParse(msg) => write!(f, "could not parse SQL script: {msg}"),
            ErrorKind::Postgres(e) => write!(f, "postgres error: {e}"),
            ErrorKind::Sqlite(e) => write!(f, "sqlite error: {e}"),
            ErrorKind::Io(e) => write!(f, "io error: {e}"),
            ErrorKind::InvalidNumber(e) => write!(f, "invalid number: {e}"),
        }
    }
}

impl From<postgres::Error> for ErrorKind {
    fn from(e: postgres::Error) -> Self {
        if is_postgres_disconnect(&e) {
            ErrorKind::Disconnected
        } else {
            ErrorKind::Postgres(e)
        }
    }
}

impl From<rusqlite::Error> for ErrorKind {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::CannotOpen =>
            {
                ErrorKind::Disconnected
            }
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                ErrorKind::Conflict
            }
            _ => ErrorKind::Sqlite(e),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Io(e)
    }
}

impl From<ParseIntError> for ErrorKind {
    fn from(e: ParseIntError) -> Self {
        ErrorKind::InvalidNumber(e)
    }
}

/// Classify a postgres driver error as connection-broken. The teacher let
/// `postgres::Error` bubble up raw; this crate's callers need to tell "go fail over to a
/// replica" apart from "this query is wrong", per the `DisconnectedError` contract.
fn is_postgres_disconnect(e: &postgres::Error) -> bool {
    e.is_closed()
        || StdError::source(e)
            .map(|s| s.to_string().to_lowercase().contains("connection"))
            .unwrap_or(false)
}
