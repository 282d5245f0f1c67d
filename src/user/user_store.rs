use super::auth::{AuthToken, AuthTokenValue, UserAuthCredentials};
use anyhow::Result;

pub trait UserAuthCredentialsStore: Send + Sync {
    /// Returns the user's authentication credentials given the user handle.
    /// Returns Ok(None) if the user does not exist.
    fn get_user_auth_credentials(&self, user_handle: &str) -> Result<Option<UserAuthCredentials>>;

    /// Inserts or replaces the user's password credentials.
    fn update_user_auth_credentials(&self, credentials: UserAuthCredentials) -> Result<()>;
}

pub trait UserAuthTokenStore: Send + Sync {
    /// Returns a user's authentication token given an AuthTokenValue.
    /// Returns Ok(None) if the token does not exist.
    fn get_user_auth_token(&self, token: &AuthTokenValue) -> Result<Option<AuthToken>>;

    /// Deletes an auth token given the token value, returning the deleted
    /// token. Returns Ok(None) if the token does not exist.
    fn delete_user_auth_token(&self, token: &AuthTokenValue) -> Result<Option<AuthToken>>;

    /// Stamps the token with the current time as its last use.
    fn update_user_auth_token_last_used_timestamp(&self, token: &AuthTokenValue) -> Result<()>;

    /// Adds a new auth token.
    fn add_user_auth_token(&self, token: AuthToken) -> Result<()>;

    /// Returns all of a user's authentication tokens.
    fn get_all_user_auth_tokens(&self, user_handle: &str) -> Result<Vec<AuthToken>>;

    /// Prunes auth tokens that have not been used for the given number of
    /// days. Returns how many tokens were deleted.
    fn prune_unused_auth_tokens(&self, unused_for_days: u64) -> Result<usize>;
}

pub trait UserStore: UserAuthTokenStore + UserAuthCredentialsStore + Send + Sync {
    /// Creates a new user and returns the user id.
    fn create_user(&self, user_handle: &str) -> Result<i64>;

    /// Returns a user's handle given the user id.
    /// Returns Ok(None) if the user does not exist.
    fn get_user_handle(&self, user_id: i64) -> Result<Option<String>>;

    /// Returns a user's id given the user handle.
    /// Returns Ok(None) if the user does not exist.
    fn get_user_id(&self, user_handle: &str) -> Result<Option<i64>>;

    /// Returns all users' handles.
    fn get_all_user_handles(&self) -> Result<Vec<String>>;
}
