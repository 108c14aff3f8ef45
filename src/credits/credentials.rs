use std::env;

use async_trait::async_trait;

use crate::credits::{
    error::{CreditsError, CreditsErrorKind},
    types::{CredentialRef, SessionCredential},
};

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, reference: &CredentialRef) -> Result<SessionCredential, CreditsError>;
}

#[derive(Default)]
pub struct EnvCredentialProvider;

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn resolve(&self, reference: &CredentialRef) -> Result<SessionCredential, CreditsError> {
        match reference {
            CredentialRef::Env { var } => {
                let token = env::var(var).map_err(|_| {
                    invalid_credential(format!(
                        "missing session token environment variable {}",
                        var
                    ))
                })?;
                if token.trim().is_empty() {
                    return Err(invalid_credential(format!(
                        "session token environment variable {} is empty",
                        var
                    )));
                }

                Ok(SessionCredential::bearer(token.trim()))
            }
            CredentialRef::InlineToken { token } => {
                if token.trim().is_empty() {
                    return Err(invalid_credential("inline session token cannot be empty"));
                }
                Ok(SessionCredential::bearer(token.trim()))
            }
            CredentialRef::None => Ok(SessionCredential::none()),
        }
    }
}

fn invalid_credential(message: impl Into<String>) -> CreditsError {
    CreditsError::new(CreditsErrorKind::Authentication, message).with_retryable(false)
}
