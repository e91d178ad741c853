use crate::auth::*;
use crate::config::IDENTITY_TOOLKIT_URL;
use crate::store::*;

use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

const AGENT: &str = "campus-bus-bot/0.1";

//////////////////////////////////////////////////////////
// Realtime database
//////////////////////////////////////////////////////////
#[derive(Clone)]
pub struct FirebaseDatabase {
    client: reqwest::Client,
    base_url: String,
    id_token: Option<String>,
}

impl FirebaseDatabase {
    pub fn new(base_url: &str) -> Self {
        FirebaseDatabase {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            id_token: None,
        }
    }

    fn url(&self, path: &str) -> String {
        let mut url = format!("{}/{}.json", self.base_url, path_segments(path).join("/"));
        if let Some(token) = &self.id_token {
            url = format!("{}?auth={}", url, token);
        }
        url
    }
}

impl RealtimeStore for FirebaseDatabase {
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.client
            .put(self.url(path))
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, AGENT)
            .json(&value)
            .send()
            .await?
            .error_for_status()?;
        log::debug!("PUT {path}");
        Ok(())
    }

    fn subscribe(&self, path: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = self
            .client
            .get(self.url(path))
            .header(ACCEPT, "text/event-stream")
            .header(USER_AGENT, AGENT);
        let label = path.to_string();

        let task = tokio::spawn(async move {
            if let Err(e) = stream_events(request, &tx).await {
                log::warn!("Subscription to {label} ended: {e}");
                let _ = tx.send(Err(e));
            }
        });

        Subscription::new(path, rx, Some(task))
    }

    fn with_auth(&self, id_token: &str) -> Self {
        FirebaseDatabase {
            id_token: Some(id_token.to_string()),
            ..self.clone()
        }
    }
}

async fn stream_events(
    request: reqwest::RequestBuilder,
    tx: &mpsc::UnboundedSender<SnapshotResult>,
) -> Result<(), StoreError> {
    let mut response = request.send().await?.error_for_status()?;
    let mut tree = StreamedTree::default();
    let mut buffer: Vec<u8> = vec![];

    while let Some(chunk) = response.chunk().await? {
        buffer.extend_from_slice(&chunk);
        while let Some(block) = take_event_block(&mut buffer) {
            let Some(event) = parse_event(&block)? else {
                continue;
            };
            if let Some(snapshot) = tree.apply(event)? {
                if tx.send(Ok(snapshot)).is_err() {
                    // Listener is gone
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

//////////////////////////////////////////////////////////
// Authentication
//////////////////////////////////////////////////////////
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    id_token: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct FirebaseAuth {
    client: reqwest::Client,
    api_key: String,
    state: watch::Sender<Option<User>>,
}

impl FirebaseAuth {
    pub fn new(api_key: &str) -> Self {
        let (state, _) = watch::channel(None);
        FirebaseAuth {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            state,
        }
    }
}

impl Authenticator for FirebaseAuth {
    async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let url = format!(
            "{}/accounts:signInWithPassword?key={}",
            IDENTITY_TOOLKIT_URL, self.api_key
        );

        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, AGENT)
            .json(&json!({ "email": email, "password": password, "returnSecureToken": true }))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| status.to_string());
            return Err(AuthError::Rejected(message));
        }

        let signed_in: SignInResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let user = User {
            uid: signed_in.local_id,
            email: signed_in.email,
            id_token: signed_in.id_token,
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
