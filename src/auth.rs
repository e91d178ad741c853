use std::future::Future;

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Rejected(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct User {
    pub uid: String,
    pub email: Option<String>,
    pub id_token: String,
}

impl User {
    /// Key of the bus record owned by this driver.
    pub fn bus_id(&self) -> String {
        format!("bus_{}", self.uid)
    }
}

/// Email/password sign-in with an observable auth state.
pub trait Authenticator: Send + Sync + 'static {
    fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<User, AuthError>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), AuthError>> + Send;

    /// Yields the signed-in user, or `None` after sign-out.
    fn auth_state(&self) -> watch::Receiver<Option<User>>;
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Accepts exactly one email/password pair.
    pub struct StaticAuth {
        email: String,
        password: String,
        uid: String,
        state: watch::Sender<Option<User>>,
    }

    impl StaticAuth {
        pub fn new(email: &str, password: &str, uid: &str) -> Self {
            StaticAuth {
                email: email.into(),
                password: password.into(),
                uid: uid.into(),
                state: watch::channel(None).0,
            }
        }
    }

    impl Authenticator for StaticAuth {
        async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
            if email != self.email || password != self.password {
                return Err(AuthError::Rejected("INVALID_LOGIN_CREDENTIALS".into()));
            }
            let user = User {
                uid: self.uid.clone(),
                email: Some(email.to_string()),
                id_token: format!("token-{}", self.uid),
            };
            self.state.send_replace(Some(user.clone()));
            Ok(user)
        }

        async fn sign_out(&self) -> Result<(), AuthError> {
            self.state.send_replace(None);
            Ok(())
        }

        fn auth_state(&self) -> watch::Receiver<Option<User>> {
            self.state.subscribe()
        }
    }
}
