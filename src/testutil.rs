//! Disposable database setup for tests. Grounded on the teacher's
//! `generate_new_test_db` (`eugene/src/lib.rs`): a scratch database handed to each test
//! rather than sharing state across tests, tracked and reaped the same way.

use std::ops::{Deref, DerefMut};

use postgres::{Client, NoTls};
use rusqlite::Connection;
use tempfile::NamedTempFile;

pub const SCHEMA: &str = r#"
CREATE TABLE "transaction" (
    tid INTEGER PRIMARY KEY,
    packed INTEGER NOT NULL DEFAULT 0,
    username TEXT,
    description TEXT,
    extension BLOB
);

CREATE TABLE current_object (
    zoid INTEGER PRIMARY KEY,
    tid INTEGER NOT NULL REFERENCES "transaction"(tid)
);

CREATE TABLE object_state (
    zoid INTEGER NOT NULL,
    tid INTEGER NOT NULL REFERENCES "transaction"(tid),
    prev_tid INTEGER NOT NULL DEFAULT 0,
    state BLOB,
    PRIMARY KEY (zoid, tid)
);

CREATE TABLE object_ref (
    zoid INTEGER NOT NULL,
    tid INTEGER NOT NULL,
    to_zoid INTEGER NOT NULL,
    PRIMARY KEY (zoid, tid, to_zoid)
);

CREATE TABLE object_refs_added (
    tid INTEGER PRIMARY KEY
);

CREATE TABLE pack_object (
    zoid INTEGER PRIMARY KEY,
    keep INTEGER NOT NULL,
    keep_tid INTEGER
);

CREATE TABLE temp_pack_visit (
    zoid INTEGER NOT NULL PRIMARY KEY,
    keep_tid INTEGER
);

CREATE TABLE commit_lock (
    id INTEGER PRIMARY KEY,
    token INTEGER NOT NULL DEFAULT 0
);
INSERT INTO commit_lock(id, token) VALUES (1, 0);
"#;

/// Postgres flavour of [`SCHEMA`]: same tables, Postgres-native types, and a row lock
/// table `commit_lock` for `LOCK TABLE ... IN EXCLUSIVE MODE` to act on.
pub const PG_SCHEMA: &str = r#"
CREATE TABLE "transaction" (
    tid BIGINT PRIMARY KEY,
    packed BOOLEAN NOT NULL DEFAULT FALSE,
    username TEXT,
    description TEXT,
    extension BYTEA
);

CREATE TABLE current_object (
    zoid BIGINT PRIMARY KEY,
    tid BIGINT NOT NULL REFERENCES "transaction"(tid)
);

CREATE TABLE object_state (
    zoid BIGINT NOT NULL,
    tid BIGINT NOT NULL REFERENCES "transaction"(tid),
    prev_tid BIGINT NOT NULL DEFAULT 0,
    state BYTEA,
    PRIMARY KEY (zoid, tid)
);

CREATE TABLE object_ref (
    zoid BIGINT NOT NULL,
    tid BIGINT NOT NULL,
    to_zoid BIGINT NOT NULL,
    PRIMARY KEY (zoid, tid, to_zoid)
);

CREATE TABLE object_refs_added (
    tid BIGINT PRIMARY KEY
);

CREATE TABLE pack_object (
    zoid BIGINT PRIMARY KEY,
    keep BOOLEAN NOT NULL,
    keep_tid BIGINT
);

CREATE TABLE commit_lock (
    id INTEGER PRIMARY KEY
);
INSERT INTO commit_lock(id) VALUES (1);
"#;

/// A file-backed, disposable SQLite database. Wraps the temp file alongside the
/// connection so the file outlives every borrow taken from it; derefs to `Connection`
/// so call sites read exactly like they would against any other owned connection.
pub struct TestDb {
    conn: Connection,
    _file: NamedTempFile,
}

impl Deref for TestDb {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for TestDb {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Open a fresh, schema-loaded, file-backed SQLite database for one test. Grounded on
/// §10.5: SQLite needs no server, so the scratch instance is just a `tempfile`-backed
/// file rather than a spun-up server process.
pub fn open_test_db() -> TestDb {
    let file = NamedTempFile::new().expect("create temp sqlite file");
    let conn = Connection::open(file.path()).expect("open file-backed sqlite db");
    conn.execute_batch(SCHEMA).expect("apply sqlite schema");
    TestDb { conn, _file: file }
}

/// Open a fresh, schema-loaded, uniquely-named scratch Postgres database for one test.
///
/// Grounded directly on the teacher's `generate_new_test_db`: connects as the `postgres`
/// superuser to a local server, creates a database named with a `uuid` suffix, records it
/// in a `test_dbs` bookkeeping table, and reaps any scratch database older than 15
/// minutes left behind by a crashed prior run before creating this one. Requires a
/// Postgres server reachable at `host=localhost dbname=postgres password=postgres
/// user=postgres`; CI provisions one the same way the teacher's test suite expects.
pub fn open_test_pg_db() -> (Client, String) {
    let mut admin = Client::connect(
        "host=localhost dbname=postgres password=postgres user=postgres",
        NoTls,
    )
    .expect("connect to local postgres admin database");

    admin
        .execute(
            "CREATE TABLE IF NOT EXISTS test_dbs(\
                name text PRIMARY KEY, time timestamptz DEFAULT now())",
            &[],
        )
        .ok();

    let db_name = format!(
        "packbound_testdb_{}",
        uuid::Uuid::new_v4().to_string().replace('-', "_")
    );
    admin
        .execute(
            "INSERT INTO test_dbs(name) VALUES ($1)",
            &[&db_name.as_str()],
        )
        .expect("record scratch database");

    let stale = admin
        .query(
            "SELECT name FROM test_dbs WHERE time < now() - interval '15 minutes'",
            &[],
        )
        .expect("list stale scratch databases");
    for row in stale {
        let stale_name: String = row.get(0);
        admin
            .execute(&format!("DROP DATABASE IF EXISTS {stale_name}"), &[])
            .ok();
        admin
            .execute("DELETE FROM test_dbs WHERE name = $1", &[&stale_name.as_str()])
            .ok();
    }

    admin
        .execute(&format!("CREATE DATABASE {db_name}"), &[])
        .expect("create scratch database");

    let mut client = Client::connect(
        &format!("host=localhost dbname={db_name} password=postgres user=postgres"),
        NoTls,
    )
    .expect("connect to scratch database");
    client
        .batch_execute(PG_SCHEMA)
        .expect("apply postgres schema");
    (client, db_name)
}
