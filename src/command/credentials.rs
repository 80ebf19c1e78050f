//! Transport credentials
//!
//! Exactly one credential is applied to the NATS connection. mTLS is part
//! of the TLS stack, not the credential channel, and is rejected here.

use std::path::PathBuf;

use async_nats::ConnectOptions;

use crate::error::{code, AppError, AppResult};

/// Credential accepted by the command transport and event bus connections.
#[derive(Clone)]
pub enum NatsCredentials {
    Token(String),
    UserPassword { user: String, password: String },
    NKeySeed(String),
    /// Standard `.creds` file carrying a user JWT and its signing seed.
    JwtCredsFile(PathBuf),
    Mtls,
}

// Never print secret material
impl std::fmt::Debug for NatsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatsCredentials::Token(_) => write!(f, "NatsCredentials::Token(..)"),
            NatsCredentials::UserPassword { user, .. } => {
                write!(f, "NatsCredentials::UserPassword {{ user: {user:?}, .. }}")
            }
            NatsCredentials::NKeySeed(_) => write!(f, "NatsCredentials::NKeySeed(..)"),
            NatsCredentials::JwtCredsFile(path) => {
                write!(f, "NatsCredentials::JwtCredsFile({path:?})")
            }
            NatsCredentials::Mtls => write!(f, "NatsCredentials::Mtls"),
        }
    }
}

impl NatsCredentials {
    /// Fold this credential into the connection options.
    pub async fn apply(&self, options: ConnectOptions) -> AppResult<ConnectOptions> {
        match self {
            NatsCredentials::Token(token) => Ok(options.token(token.clone())),
            NatsCredentials::UserPassword { user, password } => {
                Ok(options.user_and_password(user.clone(), password.clone()))
            }
            NatsCredentials::NKeySeed(seed) => Ok(options.nkey(seed.clone())),
            NatsCredentials::JwtCredsFile(path) => {
                options.credentials_file(path).await.map_err(|e| {
                    AppError::new(code::TRANSPORT, format!("cannot read creds file: {e}"))
                })
            }
            NatsCredentials::Mtls => Err(AppError::new(
                code::TRANSPORT,
                "mTLS is not supported on the credentials channel",
            )
            .with_solution("configure client certificates on the TLS stack instead")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mtls_is_rejected() {
        let err = NatsCredentials::Mtls
            .apply(ConnectOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, code::TRANSPORT);
        assert!(err.solution.is_some());
    }

    #[tokio::test]
    async fn test_token_applies() {
        assert!(NatsCredentials::Token("secret".into())
            .apply(ConnectOptions::new())
            .await
            .is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", NatsCredentials::Token("super-secret".into()));
        assert!(!debug.contains("super-secret"));

        let debug = format!(
            "{:?}",
            NatsCredentials::UserPassword {
                user: "svc".into(),
                password: "hunter2".into()
            }
        );
        assert!(debug.contains("svc"));
        assert!(!debug.contains("hunter2"));
    }
}
