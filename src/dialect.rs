//! SQL-dialect abstraction.
//!
//! Every SQL fragment the pack engine submits is written once, in a neutral template
//! syntax borrowed from the system this crate's algorithm is modelled on: literal tokens
//! `%(TRUE)s`, `%(FALSE)s`, `%(OCTET_LENGTH)s` for backend-specific SQL vocabulary, and
//! `%(name)s` tokens for bound parameters. A [`DialectProfile`] rewrites a template into
//! text a specific backend will accept, in two independent steps: literal substitution
//! (plain string replacement, never touches bound parameters) and placeholder rewriting
//! (turns `%(name)s` into whatever bind syntax the backend driver understands).
//!
//! Parameter *values* are never interpolated into the SQL text; only the placeholder
//! syntax changes. Values stay bound through the driver.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::Error;

/// How a backend expects bound parameters to be written once literal substitution has
/// happened. `Dollar` covers drivers that only support positional binding (e.g. the
/// `postgres` crate has no native named-parameter API); `Colon` covers drivers that bind
/// named parameters directly (e.g. `rusqlite`'s `:name` placeholders).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    Dollar,
    Colon,
}

/// Backend-specific knobs the pack algorithm needs but must not hardcode.
///
/// At minimum a profile fixes the literals `TRUE`, `FALSE`, `OCTET_LENGTH`, the
/// placeholder binding style, the DDL for a private per-session temp table, the
/// statement that acquires `commit_lock` in exclusive mode, and whether bulk-UPDATE
/// rowcounts are reliable enough to drive the closure loop's fixed-point test.
pub trait DialectProfile: Send + Sync {
    fn true_literal(&self) -> &'static str {
        "TRUE"
    }
    fn false_literal(&self) -> &'static str {
        "FALSE"
    }
    fn octet_length_fn(&self) -> &'static str {
        "OCTET_LENGTH"
    }

    fn placeholder_style(&self) -> PlaceholderStyle;

    /// DDL creating the unique-indexed, session-scoped `temp_pack_visit` working table.
    fn create_temp_visit_table_sql(&self) -> &'static str;

    /// Statement acquiring `commit_lock` in exclusive mode, blocking until it is free.
    fn acquire_commit_lock_sql(&self) -> &'static str;

    /// Non-blocking variant: surfaces an already-held lock as an error instead of
    /// waiting for it. Defaults to [`Self::acquire_commit_lock_sql`] for backends (like
    /// SQLite, below) whose blocking statement is already non-blocking in practice, so
    /// there is no distinct SQL text to suffix with a `NOWAIT`-style keyword.
    fn acquire_commit_lock_nowait_sql(&self) -> &'static str {
        self.acquire_commit_lock_sql()
    }

    /// Whether the driver reports an accurate affected-row count after a bulk UPDATE.
    /// When false, [`crate::pack::PackController`] falls back to [`Self::pending_count_sql`]
    /// to detect whether the closure loop made progress.
    fn reliable_rowcount(&self) -> bool {
        true
    }

    /// Query returning the number of `pack_object` rows still marked `keep = FALSE`.
    /// Only consulted when [`Self::reliable_rowcount`] is false.
    fn pending_count_sql(&self) -> &'static str {
        "SELECT COUNT(*) FROM pack_object WHERE keep = %(FALSE)s"
    }

    /// Whether `err` represents a large-object value that was truncated by the driver's
    /// default inline-fetch buffer, and should be retried with a streaming-output plan.
    fn is_truncated_blob_error(&self, _err: &Error) -> bool {
        false
    }

    /// Whether `err` represents a `NOWAIT` lock acquisition that found `commit_lock`
    /// already held by another session.
    fn is_lock_not_available(&self, _err: &Error) -> bool {
        false
    }
}

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"%\((\w+)\)s").unwrap());

/// Replace the three literal tokens with the profile's SQL vocabulary. Never touches
/// `%(name)s` parameter placeholders.
pub fn substitute_literals(profile: &dyn DialectProfile, sql: &str) -> String {
    sql.replace("%(TRUE)s", profile.true_literal())
        .replace("%(FALSE)s", profile.false_literal())
        .replace("%(OCTET_LENGTH)s", profile.octet_length_fn())
}

/// The result of rewriting a template's parameter placeholders: the rewritten SQL text,
/// and (for [`PlaceholderStyle::Dollar`]) the order in which placeholder names occur, so
/// a caller can build a positional argument list matching that order.
pub struct Rewritten {
    pub sql: String,
    pub order: Vec<String>,
}

/// Apply literal substitution, then rewrite `%(name)s` placeholders into the profile's
/// bind syntax.
pub fn rewrite(profile: &dyn DialectProfile, template: &str) -> Rewritten {
    let literal_free = substitute_literals(profile, template);
    let mut order = Vec::new();
    let sql = match profile.placeholder_style() {
        PlaceholderStyle::Colon => PLACEHOLDER_RE
            .replace_all(&literal_free, |caps: &Captures| {
                order.push(caps[1].to_string());
                format!(":{}", &caps[1])
            })
            .into_owned(),
        PlaceholderStyle::Dollar => PLACEHOLDER_RE
            .replace_all(&literal_free, |caps: &Captures| {
                order.push(caps[1].to_string());
                format!("${}", order.len())
            })
            .into_owned(),
    };
    Rewritten { sql, order }
}
