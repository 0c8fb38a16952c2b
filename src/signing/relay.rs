//! Client for the session relay that ferries signing messages between parties.

use crate::error::SigningError;
use crate::types::KeysignResponse;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const MESSAGE_ID_HEADER: &str = "message_id";
const REGISTER_ATTEMPTS: u32 = 3;

/// One relayed protocol message. `body` is base64 of the encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub session_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub body: String,
    pub hash: String,
    #[serde(default)]
    pub sequence_no: i64,
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    base_url: String,
    http: reqwest::Client,
    retry_delay: Duration,
    poll_interval: Duration,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Delay between registration retries and between session-start polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.retry_delay = interval;
        self.poll_interval = interval;
        self
    }

    /// Open a session for the given parties. Done by the initiating party.
    pub async fn start_session(&self, session_id: &str, parties: &[String]) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/start/{session_id}", self.base_url))
            .json(parties)
            .send()
            .await
            .context("Failed to start relay session")?;
        if !resp.status().is_success() {
            return Err(SigningError::SessionStart(
                session_id.to_string(),
                resp.status().to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Join an existing session as `party`.
    pub async fn register_session(&self, session_id: &str, party: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/{session_id}", self.base_url))
            .json(&[party])
            .send()
            .await
            .context("Failed to register with relay session")?;
        if !resp.status().is_success() {
            bail!("Failed to register session {session_id}: {}", resp.status());
        }
        Ok(())
    }

    pub async fn register_session_with_retry(&self, session_id: &str, party: &str) -> Result<()> {
        let mut last = None;
        for attempt in 0..REGISTER_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.register_session(session_id, party).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(session = session_id, attempt, "Session registration failed: {e:#}");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| anyhow::anyhow!("Failed to register session {session_id}")))
    }

    /// Parties currently joined to the session.
    pub async fn session_parties(&self, session_id: &str) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(format!("{}/start/{session_id}", self.base_url))
            .send()
            .await
            .context("Failed to query relay session")?;
        if !resp.status().is_success() {
            bail!("Failed to query session {session_id}: {}", resp.status());
        }
        resp.json()
            .await
            .context("Failed to parse relay session parties")
    }

    /// Poll until at least two parties joined, or `timeout` elapses.
    pub async fn wait_for_session_start(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.session_parties(session_id).await {
                Ok(parties) if parties.len() >= 2 => return Ok(parties),
                Ok(parties) => debug!(session = session_id, joined = parties.len(), "Waiting for parties"),
                Err(e) => warn!(session = session_id, "Session poll failed: {e:#}"),
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(SigningError::SessionTimeout(session_id.to_string()).into());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Messages waiting for `party`, scoped to one signed message.
    pub async fn download_messages(
        &self,
        session_id: &str,
        party: &str,
        message_id: &str,
    ) -> Result<Vec<RelayMessage>> {
        let resp = self
            .http
            .get(format!("{}/message/{session_id}/{party}", self.base_url))
            .header(MESSAGE_ID_HEADER, message_id)
            .send()
            .await
            .context("Failed to download relay messages")?;
        if !resp.status().is_success() {
            bail!("Failed to download messages: {}", resp.status());
        }
        resp.json().await.context("Failed to parse relay messages")
    }

    pub async fn upload_message(&self, message: &RelayMessage, message_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/message/{}", self.base_url, message.session_id))
            .header(MESSAGE_ID_HEADER, message_id)
            .json(message)
            .send()
            .await
            .context("Failed to upload relay message")?;
        if !resp.status().is_success() {
            bail!("Failed to upload message: {}", resp.status());
        }
        Ok(())
    }

    pub async fn delete_message(
        &self,
        session_id: &str,
        party: &str,
        hash: &str,
        message_id: &str,
    ) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/message/{session_id}/{party}/{hash}", self.base_url))
            .header(MESSAGE_ID_HEADER, message_id)
            .send()
            .await
            .context("Failed to delete relay message")?;
        if !resp.status().is_success() {
            bail!("Failed to delete message {hash}: {}", resp.status());
        }
        Ok(())
    }

    /// Announce that `party` is done with the session.
    pub async fn complete_session(&self, session_id: &str, party: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/complete/{session_id}", self.base_url))
            .json(&[party])
            .send()
            .await
            .context("Failed to complete relay session")?;
        if !resp.status().is_success() {
            bail!("Failed to complete session {session_id}: {}", resp.status());
        }
        Ok(())
    }

    /// Publish a finished signature so a peer whose engine failed can pick it up.
    pub async fn mark_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &KeysignResponse,
    ) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/complete/{session_id}/keysign", self.base_url))
            .header(MESSAGE_ID_HEADER, message_id)
            .json(signature)
            .send()
            .await
            .context("Failed to mark keysign complete")?;
        if !resp.status().is_success() {
            bail!("Failed to mark keysign complete: {}", resp.status());
        }
        Ok(())
    }

    /// A signature published by a peer for this message, if any.
    pub async fn check_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<KeysignResponse>> {
        let resp = self
            .http
            .get(format!("{}/complete/{session_id}/keysign", self.base_url))
            .header(MESSAGE_ID_HEADER, message_id)
            .send()
            .await
            .context("Failed to check keysign completion")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("Failed to check keysign complete: {}", resp.status());
        }
        let signature = resp
            .json()
            .await
            .context("Failed to parse published signature")?;
        Ok(Some(signature))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory relay good enough for two parties in one process.
    #[derive(Default)]
    pub(crate) struct MockRelay {
        pub sessions: Mutex<HashMap<String, Vec<String>>>,
        /// (recipient, message id, message)
        pub inbox: Mutex<Vec<(String, String, RelayMessage)>>,
        pub deleted: Mutex<Vec<String>>,
        pub completed: Mutex<Vec<String>>,
        pub signatures: Mutex<HashMap<(String, String), KeysignResponse>>,
        pub register_failures: AtomicUsize,
        pub fail_deletes: AtomicBool,
        pub downloads: AtomicUsize,
    }

    type Shared = Arc<MockRelay>;

    fn message_id(headers: &HeaderMap) -> String {
        headers
            .get(MESSAGE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    async fn start(State(s): State<Shared>, Path(session): Path<String>, Json(parties): Json<Vec<String>>) -> StatusCode {
        s.sessions.lock().unwrap().insert(session, parties);
        StatusCode::CREATED
    }

    async fn parties(State(s): State<Shared>, Path(session): Path<String>) -> Json<Vec<String>> {
        Json(s.sessions.lock().unwrap().get(&session).cloned().unwrap_or_default())
    }

    async fn register(State(s): State<Shared>, Path(session): Path<String>, Json(parties): Json<Vec<String>>) -> StatusCode {
        let left = s.register_failures.load(Ordering::SeqCst);
        if left > 0 {
            s.register_failures.store(left - 1, Ordering::SeqCst);
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        let mut sessions = s.sessions.lock().unwrap();
        let joined = sessions.entry(session).or_default();
        for party in parties {
            if !joined.contains(&party) {
                joined.push(party);
            }
        }
        StatusCode::CREATED
    }

    async fn upload(State(s): State<Shared>, headers: HeaderMap, Json(message): Json<RelayMessage>) -> StatusCode {
        let id = message_id(&headers);
        let mut inbox = s.inbox.lock().unwrap();
        for to in &message.to {
            inbox.push((to.clone(), id.clone(), message.clone()));
        }
        StatusCode::ACCEPTED
    }

    async fn download(
        State(s): State<Shared>,
        Path((session, party)): Path<(String, String)>,
        headers: HeaderMap,
    ) -> Json<Vec<RelayMessage>> {
        s.downloads.fetch_add(1, Ordering::SeqCst);
        let id = message_id(&headers);
        let inbox = s.inbox.lock().unwrap();
        Json(
            inbox
                .iter()
                .filter(|(to, mid, m)| *to == party && *mid == id && m.session_id == session)
                .map(|(_, _, m)| m.clone())
                .collect(),
        )
    }

    async fn remove(
        State(s): State<Shared>,
        Path((_session, party, hash)): Path<(String, String, String)>,
    ) -> StatusCode {
        if s.fail_deletes.load(Ordering::SeqCst) {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        s.inbox
            .lock()
            .unwrap()
            .retain(|(to, _, m)| !(*to == party && m.hash == hash));
        s.deleted.lock().unwrap().push(hash);
        StatusCode::OK
    }

    async fn complete(State(s): State<Shared>, Path(session): Path<String>, Json(parties): Json<Vec<String>>) -> StatusCode {
        let mut completed = s.completed.lock().unwrap();
        for party in parties {
            completed.push(format!("{session}:{party}"));
        }
        StatusCode::OK
    }

    async fn mark_signed(
        State(s): State<Shared>,
        Path(session): Path<String>,
        headers: HeaderMap,
        Json(sig): Json<KeysignResponse>,
    ) -> StatusCode {
        s.signatures
            .lock()
            .unwrap()
            .insert((session, message_id(&headers)), sig);
        StatusCode::OK
    }

    async fn check_signed(State(s): State<Shared>, Path(session): Path<String>, headers: HeaderMap) -> Response {
        match s.signatures.lock().unwrap().get(&(session, message_id(&headers))) {
            Some(sig) => Json(sig.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    pub(crate) async fn spawn_relay() -> (String, Arc<MockRelay>) {
        let state = Arc::new(MockRelay::default());
        let app = Router::new()
            .route("/start/{session}", post(start).get(parties))
            .route("/{session}", post(register))
            .route("/message/{session}", post(upload))
            .route("/message/{session}/{party}", get(download))
            .route("/message/{session}/{party}/{hash}", axum::routing::delete(remove))
            .route("/complete/{session}", post(complete))
            .route("/complete/{session}/keysign", post(mark_signed).get(check_signed))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    pub(crate) fn client(url: &str) -> RelayClient {
        RelayClient::new(url).with_poll_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn session_starts_once_both_parties_join() {
        let (url, _relay) = spawn_relay().await;
        let leader = client(&url);
        let follower = client(&url);
        leader
            .start_session("s-1", &["1".to_string()])
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let leader = leader.clone();
            async move { leader.wait_for_session_start("s-1", Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        follower.register_session_with_retry("s-1", "2").await.unwrap();

        let parties = waiter.await.unwrap().unwrap();
        assert_eq!(parties, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn wait_times_out_with_single_party() {
        let (url, _relay) = spawn_relay().await;
        let c = client(&url);
        c.start_session("lonely", &["1".to_string()]).await.unwrap();
        let err = c
            .wait_for_session_start("lonely", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SigningError>(),
            Some(SigningError::SessionTimeout(s)) if s == "lonely"
        ));
    }

    #[tokio::test]
    async fn registration_retries_transient_failures() {
        let (url, relay) = spawn_relay().await;
        relay.register_failures.store(2, Ordering::SeqCst);
        client(&url).register_session_with_retry("s-2", "2").await.unwrap();
        assert_eq!(relay.sessions.lock().unwrap()["s-2"], vec!["2".to_string()]);

        relay.register_failures.store(5, Ordering::SeqCst);
        assert!(client(&url).register_session_with_retry("s-3", "2").await.is_err());
    }

    #[tokio::test]
    async fn messages_are_scoped_by_party_and_message_id() {
        let (url, relay) = spawn_relay().await;
        let c = client(&url);
        let message = RelayMessage {
            session_id: "s".into(),
            from: "1".into(),
            to: vec!["2".into()],
            body: "Ym9keQ==".into(),
            hash: "h1".into(),
            sequence_no: 0,
        };
        c.upload_message(&message, "m-1").await.unwrap();

        assert_eq!(c.download_messages("s", "2", "m-1").await.unwrap(), vec![message]);
        assert!(c.download_messages("s", "2", "m-2").await.unwrap().is_empty());
        assert!(c.download_messages("s", "1", "m-1").await.unwrap().is_empty());

        c.delete_message("s", "2", "h1", "m-1").await.unwrap();
        assert!(c.download_messages("s", "2", "m-1").await.unwrap().is_empty());
        assert_eq!(relay.deleted.lock().unwrap().as_slice(), ["h1"]);
    }

    #[tokio::test]
    async fn published_signature_can_be_recovered() {
        let (url, _relay) = spawn_relay().await;
        let c = client(&url);
        assert!(c.check_keysign_complete("s", "m").await.unwrap().is_none());

        let sig = KeysignResponse {
            msg: "bXNn".into(),
            r: "01".into(),
            s: "02".into(),
            der_signature: String::new(),
            recovery_id: "00".into(),
        };
        c.mark_keysign_complete("s", "m", &sig).await.unwrap();
        assert_eq!(c.check_keysign_complete("s", "m").await.unwrap(), Some(sig));
    }
}
