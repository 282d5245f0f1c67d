use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, BASE_DB_VERSION,
    DEFAULT_TIMESTAMP,
};
use crate::user::*;
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::{
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::info;

const USER_TABLE_V_0: Table = Table {
    name: "user",
    columns: &[
        sqlite_column!(
            "id",
            &SqlType::Integer,
            is_primary_key = true,
            is_unique = true
        ),
        sqlite_column!("handle", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    unique_constraints: &[],
    indices: &[("idx_user_handle", "handle")],
};

const AUTH_TOKEN_TABLE_V_0: Table = Table {
    name: "auth_token",
    columns: &[
        sqlite_column!(
            "user_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "user",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("value", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("last_used", &SqlType::Integer),
    ],
    unique_constraints: &[],
    indices: &[("idx_auth_token_value", "value")],
};

const USER_PASSWORD_CREDENTIALS_V_0: Table = Table {
    name: "user_password_credentials",
    columns: &[
        sqlite_column!(
            "user_id",
            &SqlType::Integer,
            non_null = true,
            is_unique = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "user",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("salt", &SqlType::Text, non_null = true),
        sqlite_column!("hash", &SqlType::Text, non_null = true),
        sqlite_column!("hasher", &SqlType::Text, non_null = true),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("last_used", &SqlType::Integer),
    ],
    unique_constraints: &[],
    indices: &[],
};

pub const USER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        USER_TABLE_V_0,
        AUTH_TOKEN_TABLE_V_0,
        USER_PASSWORD_CREDENTIALS_V_0,
    ],
    migration: None,
}];

fn system_time_from_unix_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn unix_secs_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[derive(Clone)]
pub struct SqliteUserStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUserStore {
    pub fn new<T: AsRef<Path>>(db_path: T) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(db_path)?;
            USER_VERSIONED_SCHEMAS.last().unwrap().create(&conn)?;
            conn
        };

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "User database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        if version >= USER_VERSIONED_SCHEMAS.len() {
            bail!("User database version {} is too new", version);
        }
        USER_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteUserStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        USER_VERSIONED_SCHEMAS.last().unwrap().create(&conn)?;
        Ok(SqliteUserStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &Connection, version: usize) -> Result<()> {
        let mut latest_from = version;
        for schema in USER_VERSIONED_SCHEMAS.iter().skip(version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!(
                    "Migrating user db from version {} to {}",
                    latest_from, schema.version
                );
                migration_fn(conn)?;
                latest_from = schema.version;
            }
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
            [],
        )?;

        Ok(())
    }

    fn row_to_auth_token(row: &rusqlite::Row) -> rusqlite::Result<AuthToken> {
        Ok(AuthToken {
            user_id: row.get("user_id")?,
            value: AuthTokenValue(row.get("value")?),
            created: system_time_from_unix_secs(row.get("created")?),
            last_used: row
                .get::<_, Option<i64>>("last_used")?
                .map(system_time_from_unix_secs),
        })
    }
}

impl UserStore for SqliteUserStore {
    fn create_user(&self, user_handle: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user (handle) VALUES (?1)",
            params![user_handle],
        )
        .with_context(|| format!("Failed to create user {}", user_handle))?;
        Ok(conn.last_insert_rowid())
    }

    fn get_user_handle(&self, user_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let handle = conn
            .query_row(
                "SELECT handle FROM user WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(handle)
    }

    fn get_user_id(&self, user_handle: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row(
                "SELECT id FROM user WHERE handle = ?1",
                params![user_handle],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn get_all_user_handles(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT handle FROM user ORDER BY id")?;
        let handles = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(handles)
    }
}

impl UserAuthTokenStore for SqliteUserStore {
    fn get_user_auth_token(&self, value: &AuthTokenValue) -> Result<Option<AuthToken>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM auth_token WHERE value = ?1")?;
        let token = stmt
            .query_row(params![value.0], Self::row_to_auth_token)
            .optional()?;
        Ok(token)
    }

    fn delete_user_auth_token(&self, value: &AuthTokenValue) -> Result<Option<AuthToken>> {
        let token = match self.get_user_auth_token(value)? {
            Some(token) => token,
            None => return Ok(None),
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM auth_token WHERE value = ?1",
            params![token.value.0],
        )?;
        Ok(Some(token))
    }

    fn update_user_auth_token_last_used_timestamp(&self, token: &AuthTokenValue) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE auth_token SET last_used = ?1 WHERE value = ?2",
            params![unix_secs_now(), token.0],
        )?;
        Ok(())
    }

    fn add_user_auth_token(&self, token: AuthToken) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO auth_token (value, user_id) VALUES (?1, ?2)",
            params![token.value.0, token.user_id],
        )?;
        Ok(())
    }

    fn get_all_user_auth_tokens(&self, user_handle: &str) -> Result<Vec<AuthToken>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM auth_token WHERE user_id = (SELECT id FROM user WHERE handle = ?1)",
        )?;
        let tokens = stmt
            .query_map(params![user_handle], Self::row_to_auth_token)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tokens)
    }

    fn prune_unused_auth_tokens(&self, unused_for_days: u64) -> Result<usize> {
        let cutoff = unix_secs_now() - (unused_for_days as i64) * 24 * 60 * 60;
        let conn = self.conn.lock().unwrap();
        // Tokens that were never used count from their creation time
        let deleted = conn.execute(
            "DELETE FROM auth_token WHERE COALESCE(last_used, created) < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

impl UserAuthCredentialsStore for SqliteUserStore {
    fn get_user_auth_credentials(&self, user_handle: &str) -> Result<Option<UserAuthCredentials>> {
        let user_id = match self.get_user_id(user_handle)? {
            Some(id) => id,
            None => return Ok(None),
        };

        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM user_password_credentials WHERE user_id = ?1")?;
        let password_credentials = stmt
            .query_row(params![user_id], |row| {
                let hasher_name: String = row.get("hasher")?;
                let hasher = DocsmithHasher::from_str(&hasher_name).map_err(|_| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        format!("unknown hasher {}", hasher_name).into(),
                    )
                })?;
                Ok(UsernamePasswordCredentials {
                    user_id: row.get("user_id")?,
                    salt: row.get("salt")?,
                    hash: row.get("hash")?,
                    hasher,
                    created: system_time_from_unix_secs(row.get("created")?),
                    last_used: row
                        .get::<_, Option<i64>>("last_used")?
                        .map(system_time_from_unix_secs),
                })
            })
            .optional()?;

        Ok(Some(UserAuthCredentials {
            user_id,
            username_password: password_credentials,
        }))
    }

    fn update_user_auth_credentials(&self, credentials: UserAuthCredentials) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        match credentials.username_password.as_ref() {
            Some(password) => {
                conn.execute(
                    r#"INSERT INTO user_password_credentials (user_id, salt, hash, hasher)
                       VALUES (?1, ?2, ?3, ?4)
                       ON CONFLICT (user_id)
                       DO UPDATE SET salt = ?2, hash = ?3, hasher = ?4"#,
                    params![
                        credentials.user_id,
                        password.salt,
                        password.hash,
                        password.hasher.to_string()
                    ],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM user_password_credentials WHERE user_id = ?1",
                    params![credentials.user_id],
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> (SqliteUserStore, i64) {
        let store = SqliteUserStore::in_memory().unwrap();
        let user_id = store.create_user("ada").unwrap();
        (store, user_id)
    }

    #[test]
    fn test_create_and_lookup_user() {
        let (store, user_id) = seeded_store();

        assert_eq!(store.get_user_id("ada").unwrap(), Some(user_id));
        assert_eq!(
            store.get_user_handle(user_id).unwrap(),
            Some("ada".to_string())
        );
        assert_eq!(store.get_user_id("nobody").unwrap(), None);
        assert_eq!(store.get_user_handle(999).unwrap(), None);
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let (store, _) = seeded_store();
        assert!(store.create_user("ada").is_err());
    }

    #[test]
    fn test_get_all_user_handles() {
        let (store, _) = seeded_store();
        store.create_user("grace").unwrap();

        assert_eq!(
            store.get_all_user_handles().unwrap(),
            vec!["ada".to_string(), "grace".to_string()]
        );
    }

    #[test]
    fn test_auth_token_lifecycle() {
        let (store, user_id) = seeded_store();
        let token = AuthToken {
            user_id,
            value: AuthTokenValue::generate(),
            created: SystemTime::now(),
            last_used: None,
        };
        store.add_user_auth_token(token.clone()).unwrap();

        let loaded = store.get_user_auth_token(&token.value).unwrap().unwrap();
        assert_eq!(loaded.user_id, user_id);
        assert!(loaded.last_used.is_none());

        store
            .update_user_auth_token_last_used_timestamp(&token.value)
            .unwrap();
        let loaded = store.get_user_auth_token(&token.value).unwrap().unwrap();
        assert!(loaded.last_used.is_some());

        let deleted = store.delete_user_auth_token(&token.value).unwrap();
        assert!(deleted.is_some());
        assert!(store.get_user_auth_token(&token.value).unwrap().is_none());
        // Deleting again is a no-op
        assert!(store.delete_user_auth_token(&token.value).unwrap().is_none());
    }

    #[test]
    fn test_get_all_user_auth_tokens() {
        let (store, user_id) = seeded_store();
        for _ in 0..3 {
            store
                .add_user_auth_token(AuthToken {
                    user_id,
                    value: AuthTokenValue::generate(),
                    created: SystemTime::now(),
                    last_used: None,
                })
                .unwrap();
        }

        assert_eq!(store.get_all_user_auth_tokens("ada").unwrap().len(), 3);
        assert!(store.get_all_user_auth_tokens("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_prune_unused_auth_tokens() {
        let (store, user_id) = seeded_store();
        let stale = AuthTokenValue::generate();
        let fresh = AuthTokenValue::generate();
        store
            .add_user_auth_token(AuthToken {
                user_id,
                value: stale.clone(),
                created: SystemTime::now(),
                last_used: None,
            })
            .unwrap();
        store
            .add_user_auth_token(AuthToken {
                user_id,
                value: fresh.clone(),
                created: SystemTime::now(),
                last_used: None,
            })
            .unwrap();

        // Age the stale token far into the past
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE auth_token SET created = 1000 WHERE value = ?1",
                params![stale.0],
            )
            .unwrap();
        }

        let pruned = store.prune_unused_auth_tokens(30).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_user_auth_token(&stale).unwrap().is_none());
        assert!(store.get_user_auth_token(&fresh).unwrap().is_some());
    }

    #[test]
    fn test_credentials_roundtrip() {
        let (store, user_id) = seeded_store();

        // User exists but has no password yet
        let creds = store.get_user_auth_credentials("ada").unwrap().unwrap();
        assert!(creds.username_password.is_none());

        let hasher = DocsmithHasher::Argon2;
        let salt = hasher.generate_b64_salt();
        let hash = hasher.hash(b"secret", &salt).unwrap();
        store
            .update_user_auth_credentials(UserAuthCredentials {
                user_id,
                username_password: Some(UsernamePasswordCredentials {
                    user_id,
                    salt,
                    hash: hash.clone(),
                    hasher,
                    created: SystemTime::now(),
                    last_used: None,
                }),
            })
            .unwrap();

        let creds = store.get_user_auth_credentials("ada").unwrap().unwrap();
        let password = creds.username_password.unwrap();
        assert_eq!(password.hash, hash);

        // Clearing the password deletes the row
        store
            .update_user_auth_credentials(UserAuthCredentials {
                user_id,
                username_password: None,
            })
            .unwrap();
        let creds = store.get_user_auth_credentials("ada").unwrap().unwrap();
        assert!(creds.username_password.is_none());

        assert!(store.get_user_auth_credentials("nobody").unwrap().is_none());
    }

    #[test]
    fn test_reopen_validates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("user.db");

        {
            let store = SqliteUserStore::new(&db_path).unwrap();
            store.create_user("ada").unwrap();
        }

        let store = SqliteUserStore::new(&db_path).unwrap();
        assert!(store.get_user_id("ada").unwrap().is_some());
    }
}
