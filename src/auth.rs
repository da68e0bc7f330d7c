use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared cleartext password for every user and tenant.
#[derive(Debug)]
pub struct SlotlockAuthSource {
    password: String,
}

impl SlotlockAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotlockAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(
            "login user={:?} database={:?}",
            login.user(),
            login.database()
        );
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
