//! Polling backend for a spreadsheet-style action endpoint.
//!
//! Reads are `GET {base}?action=<name>&...&t=<millis>`; the timestamp defeats
//! intermediary caches. Writes are `POST {base}?action=<name>` with a
//! `text/plain` JSON body, which keeps browsers and script hosts from issuing
//! CORS preflights. The endpoint has no push channel.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::{TransportError, WriteError};
use crate::model::{EntryStatus, Event, EventPatch, NewEvent, Snapshot};
use crate::source::RemoteStateSource;

#[derive(Clone)]
pub struct HttpRemote {
    http: Client,
    base_url: String,
}

#[derive(Serialize)]
struct ActionBody<'a> {
    action: &'a str,
    payload: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct ActionReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T>(&self, action: &str, params: &[(&str, &str)]) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
    {
        let stamp = Utc::now().timestamp_millis().to_string();
        let mut query: Vec<(&str, &str)> = Vec::with_capacity(params.len() + 2);
        query.push(("action", action));
        query.extend_from_slice(params);
        query.push(("t", stamp.as_str()));

        let res = self.http.get(&self.base_url).query(&query).send().await?;
        let res = check_status(res)
            .await
            .map_err(|(status, body)| TransportError::UnexpectedStatus { status, body })?;
        let body = res.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn post(
        &self,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<ActionReply, WriteError> {
        let body = serde_json::to_string(&ActionBody { action, payload })?;
        let res = self
            .http
            .post(&self.base_url)
            .query(&[("action", action)])
            .header(CONTENT_TYPE, "text/plain;charset=utf-8")
            .body(body)
            .send()
            .await?;
        let res = check_status(res)
            .await
            .map_err(|(status, body)| WriteError::UnexpectedStatus { status, body })?;
        let text = res.text().await?;
        if text.trim().is_empty() {
            debug!(action, "empty reply treated as success");
            return Ok(ActionReply {
                ok: true,
                ..ActionReply::default()
            });
        }
        let reply: ActionReply = serde_json::from_str(&text)?;
        if !reply.ok {
            return Err(WriteError::Rejected(
                reply
                    .error
                    .unwrap_or_else(|| format!("{action} rejected by remote")),
            ));
        }
        Ok(reply)
    }
}

async fn check_status(res: Response) -> Result<Response, (reqwest::StatusCode, String)> {
    if res.status().is_success() {
        Ok(res)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err((status, body))
    }
}

fn client_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[async_trait]
impl RemoteStateSource for HttpRemote {
    async fn fetch_snapshot(&self, event_code: &str) -> Result<Snapshot, TransportError> {
        self.get("getState", &[("event", event_code)]).await
    }

    async fn find_event(&self, code: &str) -> Result<Option<Event>, TransportError> {
        self.get("getEvent", &[("code", code)]).await
    }

    async fn list_events(&self) -> Result<Vec<Event>, TransportError> {
        self.get("listEvents", &[]).await
    }

    async fn create_event(&self, draft: NewEvent) -> Result<Event, WriteError> {
        let id = client_id("evt");
        let reply = self
            .post(
                "createEvent",
                json!({
                    "id": id,
                    "code": draft.code,
                    "name": draft.name,
                    "visibility": draft.visibility,
                    "created_by": draft.created_by,
                }),
            )
            .await?;
        Ok(Event {
            id: reply.id.unwrap_or(id),
            code: draft.code,
            name: draft.name,
            visibility: draft.visibility,
            session_active: false,
            current_session_id: None,
            active_speaker_entry_id: None,
            created_by: draft.created_by,
        })
    }

    async fn create_queue_entry(
        &self,
        session_id: &str,
        event_code: &str,
        name: &str,
        business_name: Option<&str>,
    ) -> Result<String, WriteError> {
        let id = client_id("q");
        let reply = self
            .post(
                "raiseHand",
                json!({
                    "id": id,
                    "session_id": session_id,
                    "event_code": event_code,
                    "name": name,
                    "business_name": business_name,
                    "timestamp": Utc::now().timestamp_millis(),
                }),
            )
            .await?;
        Ok(reply.id.unwrap_or(id))
    }

    async fn update_entry_status(
        &self,
        entry_id: &str,
        status: EntryStatus,
    ) -> Result<(), WriteError> {
        self.post("updateEntryStatus", json!({"id": entry_id, "status": status}))
            .await
            .map(|_| ())
    }

    async fn open_session(&self, event_id: &str) -> Result<String, WriteError> {
        let id = client_id("s");
        let reply = self
            .post("startSession", json!({"event_id": event_id, "session_id": id}))
            .await?;
        Ok(reply.id.unwrap_or(id))
    }

    async fn close_session(&self, session_id: &str) -> Result<(), WriteError> {
        self.post("stopSession", json!({"session_id": session_id}))
            .await
            .map(|_| ())
    }

    async fn set_active_speaker(
        &self,
        event_id: &str,
        entry_id: Option<&str>,
    ) -> Result<(), WriteError> {
        self.post("selectSpeaker", json!({"event_id": event_id, "id": entry_id}))
            .await
            .map(|_| ())
    }

    async fn update_event(&self, event_id: &str, patch: EventPatch) -> Result<(), WriteError> {
        self.post("updateEvent", json!({"event_id": event_id, "fields": patch}))
            .await
            .map(|_| ())
    }
}
