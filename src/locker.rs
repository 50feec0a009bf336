//! Commit-lock acquisition.
//!
//! Packing deletes rows that, to a transaction still in flight, may look like rows it is
//! about to reference. `commit_lock` exists purely to serialize packing against
//! concurrent committers: every committer takes a shared/row lock on it before writing,
//! and the pack transaction takes an exclusive lock before it starts deciding what is
//! reachable. Grounded on `_hold_commit_lock` in the system this algorithm is modelled
//! on, which issues `LOCK TABLE commit_lock IN EXCLUSIVE MODE` (optionally `NOWAIT`) as
//! the very first statement of the pack transaction.

use crate::error::ErrorKind;
use crate::script::{ParamMap, ScriptRunner};

/// Acquire `commit_lock` in exclusive mode for the lifetime of the current transaction.
///
/// With `nowait = false` this blocks until every in-flight commit has released the lock.
/// With `nowait = true` a held lock surfaces as [`ErrorKind::Conflict`] instead of
/// blocking, for callers that want to skip a pack cycle rather than wait behind a
/// long-running commit.
pub fn hold_commit_lock<R: ScriptRunner>(runner: &mut R, nowait: bool) -> crate::Result<()> {
    let sql = if nowait {
        runner.profile().acquire_commit_lock_nowait_sql()
    } else {
        runner.profile().acquire_commit_lock_sql()
    };
    match runner.execute(sql, &ParamMap::new()) {
        Ok(_) => Ok(()),
        Err(e) if runner.profile().is_lock_not_available(&e) => {
            Err(ErrorKind::Conflict.into())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sqlite::SqliteRunner;
    use crate::testutil::open_test_db;

    #[test]
    fn acquires_lock_inside_an_open_transaction() {
        let mut conn = open_test_db();
        let tx = conn.transaction().unwrap();
        let mut runner = SqliteRunner::new(&tx);
        hold_commit_lock(&mut runner, false).unwrap();
    }
}
