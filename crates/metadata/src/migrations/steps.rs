//! Registry schema history.
//!
//! Entries are append-only: a released migration is never edited or removed,
//! only followed by new ones.

use super::Migration;

/// Every migration, in apply order.
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000-initial",
        up: &[
            r#"
            CREATE TABLE verdaccio (
                key        BOOLEAN PRIMARY KEY DEFAULT TRUE,
                value      JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT verdaccio_single_row CHECK (key)
            )
            "#,
            r#"
            CREATE TABLE files (
                path       TEXT PRIMARY KEY,
                content    BYTEA,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ],
    },
    Migration {
        name: "001-large-object",
        up: &[
            "ALTER TABLE files ADD COLUMN temp OID",
            "UPDATE files SET temp = lo_from_bytea(0, content) WHERE content IS NOT NULL",
            "ALTER TABLE files DROP COLUMN content",
            "ALTER TABLE files RENAME COLUMN temp TO content",
        ],
    },
    Migration {
        name: "001-token",
        up: &[
            "DROP TABLE IF EXISTS tokens",
            r#"
            CREATE TABLE tokens (
                id       SERIAL PRIMARY KEY,
                "user"   TEXT        NOT NULL,
                token    TEXT        NOT NULL,
                key      TEXT        NOT NULL,
                cidr     TEXT[],
                readonly BOOLEAN     NOT NULL,
                created  TIMESTAMPTZ NOT NULL,
                updated  TIMESTAMPTZ
            )
            "#,
        ],
    },
    Migration {
        name: "002-local-package",
        up: &[r#"
            CREATE TABLE local_packages (
                name    TEXT PRIMARY KEY,
                created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#],
    },
    Migration {
        name: "003-secret",
        up: &[r#"
            CREATE TABLE secrets (
                name    TEXT PRIMARY KEY,
                value   TEXT,
                created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#],
    },
    Migration {
        name: "004-package",
        up: &[r#"
            CREATE TABLE packages (
                storage TEXT,
                name    TEXT,
                json    JSONB       NOT NULL,
                created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (storage, name)
            )
            "#],
    },
    Migration {
        name: "005-tarball",
        up: &[r#"
            CREATE TABLE tarball (
                storage TEXT,
                package TEXT,
                name    TEXT,
                file    OID         NOT NULL,
                created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (storage, package, name)
            )
            "#],
    },
    Migration {
        name: "006-remove-legacy",
        up: &[
            // Large objects are not owned by rows; unlink before the pointers go away.
            "SELECT lo_unlink(content) FROM files WHERE content IS NOT NULL",
            "DROP TABLE verdaccio",
            "DROP TABLE files",
        ],
    },
];
