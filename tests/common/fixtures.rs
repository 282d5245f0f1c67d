//! Test fixture creation for the user database

use super::constants::*;
use anyhow::Result;
use docsmith_server::user::{SqliteUserStore, UserManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Creates the user database inside the given directory, seeded with the
/// two test users. Returns the database path.
pub fn create_test_db_with_users(dir: &Path) -> Result<PathBuf> {
    let db_path = dir.join("user.db");

    let store = Arc::new(SqliteUserStore::new(&db_path)?);
    let manager = UserManager::new(store);

    manager.add_user(TEST_USER)?;
    manager.create_password_credentials(TEST_USER, TEST_PASS.to_string())?;

    manager.add_user(OTHER_USER)?;
    manager.create_password_credentials(OTHER_USER, OTHER_PASS.to_string())?;

    Ok(db_path)
}
