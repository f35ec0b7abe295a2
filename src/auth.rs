use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// One shared password for every login. The login user becomes the caller
/// identity, so the front end in charge of identity must connect as the
/// requester it has already verified.
#[derive(Debug)]
pub struct StationAuthSource {
    password: String,
}

impl StationAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for StationAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = login.user().unwrap_or_default(), "password login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
