use super::{
    auth::DocsmithHasher, AuthToken, AuthTokenValue, UserAuthCredentials, UserStore,
    UsernamePasswordCredentials,
};
use anyhow::{bail, Context, Result};
use std::{sync::Arc, time::SystemTime};

pub struct UserManager {
    user_store: Arc<dyn UserStore>,
}

impl UserManager {
    pub fn new(user_store: Arc<dyn UserStore>) -> Self {
        Self { user_store }
    }

    pub fn add_user<T: AsRef<str>>(&self, user_handle: T) -> Result<i64> {
        if user_handle.as_ref().is_empty() {
            bail!("The user handle cannot be empty.")
        }

        if self.user_store.get_user_id(user_handle.as_ref())?.is_some() {
            bail!("User handle already exists.");
        }

        self.user_store.create_user(user_handle.as_ref())
    }

    /// Verifies a handle/password pair and, on success, creates and stores
    /// a fresh session token. Returns None when the handle is unknown, has
    /// no password set, or the password does not match.
    pub fn login(&self, user_handle: &str, password: &str) -> Result<Option<AuthToken>> {
        let credentials = match self.user_store.get_user_auth_credentials(user_handle)? {
            Some(credentials) => credentials,
            None => return Ok(None),
        };
        let password_credentials = match &credentials.username_password {
            Some(password_credentials) => password_credentials,
            None => return Ok(None),
        };

        let verified = password_credentials.hasher.verify(
            password,
            password_credentials.hash.as_str(),
            password_credentials.salt.as_str(),
        )?;
        if !verified {
            return Ok(None);
        }

        Ok(Some(self.generate_auth_token(&credentials)?))
    }

    pub fn get_auth_token(&self, value: &AuthTokenValue) -> Result<Option<AuthToken>> {
        self.user_store.get_user_auth_token(value)
    }

    pub fn update_auth_token_last_used(&self, value: &AuthTokenValue) -> Result<()> {
        self.user_store
            .update_user_auth_token_last_used_timestamp(value)
    }

    pub fn generate_auth_token(&self, credentials: &UserAuthCredentials) -> Result<AuthToken> {
        let token = AuthToken {
            user_id: credentials.user_id,
            value: AuthTokenValue::generate(),
            created: SystemTime::now(),
            last_used: None,
        };
        self.user_store.add_user_auth_token(token.clone())?;
        Ok(token)
    }

    fn create_hashed_password(
        user_id: i64,
        password: String,
    ) -> Result<UsernamePasswordCredentials> {
        let hasher = DocsmithHasher::default_hasher();
        let salt = hasher.generate_b64_salt();
        let hash = hasher.hash(password.as_bytes(), &salt)?;
        Ok(UsernamePasswordCredentials {
            user_id,
            salt,
            hash,
            hasher,
            created: SystemTime::now(),
            last_used: None,
        })
    }

    pub fn create_password_credentials(&self, user_handle: &str, password: String) -> Result<()> {
        let user_id = self
            .user_store
            .get_user_id(user_handle)?
            .with_context(|| format!("User with handle {} not found.", user_handle))?;

        let mut credentials = self
            .user_store
            .get_user_auth_credentials(user_handle)?
            .unwrap_or(UserAuthCredentials {
                user_id,
                username_password: None,
            });
        if credentials.username_password.is_some() {
            bail!(
                "User with handle {} already has a password. Maybe you want to update it?",
                user_handle
            );
        }
        credentials.username_password = Some(Self::create_hashed_password(user_id, password)?);

        self.user_store.update_user_auth_credentials(credentials)
    }

    pub fn update_password_credentials(&self, user_handle: &str, password: String) -> Result<()> {
        let mut credentials = self
            .user_store
            .get_user_auth_credentials(user_handle)?
            .with_context(|| format!("User with handle {} not found.", user_handle))?;
        if credentials.username_password.is_none() {
            bail!(
                "Cannot update password of user with handle {} since it never had one.",
                user_handle
            );
        }
        credentials.username_password =
            Some(Self::create_hashed_password(credentials.user_id, password)?);
        self.user_store.update_user_auth_credentials(credentials)
    }

    pub fn delete_password_credentials(&self, user_handle: &str) -> Result<()> {
        let mut credentials = self
            .user_store
            .get_user_auth_credentials(user_handle)?
            .with_context(|| format!("User with handle {} not found.", user_handle))?;
        credentials.username_password = None;
        self.user_store.update_user_auth_credentials(credentials)
    }

    pub fn get_user_credentials(&self, user_handle: &str) -> Result<Option<UserAuthCredentials>> {
        self.user_store.get_user_auth_credentials(user_handle)
    }

    pub fn delete_auth_token(&self, user_id: i64, token_value: &AuthTokenValue) -> Result<()> {
        let removed = self.user_store.delete_user_auth_token(token_value)?;
        match removed {
            Some(removed) => {
                if removed.user_id == user_id {
                    Ok(())
                } else {
                    // Restore the token, it was not ours to delete
                    let _ = self.user_store.add_user_auth_token(removed.clone());
                    bail!(
                        "Tried to delete auth token of user {}, but the authenticated user {} is not its owner.",
                        removed.user_id,
                        user_id
                    )
                }
            }
            None => bail!("Did not find auth token {}", token_value.0),
        }
    }

    pub fn get_user_tokens(&self, user_handle: &str) -> Result<Vec<AuthToken>> {
        self.user_store.get_all_user_auth_tokens(user_handle)
    }

    pub fn get_all_user_handles(&self) -> Result<Vec<String>> {
        self.user_store.get_all_user_handles()
    }

    pub fn prune_unused_auth_tokens(&self, unused_for_days: u64) -> Result<usize> {
        self.user_store.prune_unused_auth_tokens(unused_for_days)
    }
}
