//! HTTP inspection API over a [`MailStore`].
//!
//! `GET /api/emails` lists the captured messages (optionally filtered with
//! `?q=`, matched against the subject, the sender and the body),
//! `GET /api/emails/{id}` returns a single message with its raw content,
//! `DELETE /api/emails/{id}` removes it and `POST /api/emails/clear` empties
//! the store. `/ws` is a WebSocket pushing `UPDATE` on every change.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, ToSocketAddrs},
    sync::broadcast::{error::RecvError, Receiver},
};
use tracing::{debug, info};

use crate::{CapturedMail, MailStore, StoreEvent};

/// Text pushed to WebSocket clients whenever the store changes.
pub const UPDATE_EVENT: &str = "UPDATE";

/// A captured message as exposed by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailSummary {
    pub id: u64,
    /// `From` header, the envelope sender when the header is missing.
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: Option<String>,
    /// First text part, decoded.
    pub body: String,
    pub attachments: Vec<String>,
    pub size: usize,
    pub secure: bool,
    pub authenticated_as: Option<String>,
    pub received_at: String,
}

impl MailSummary {
    pub fn from_mail(mail: &CapturedMail) -> Self {
        let mut summary = Self {
            id: mail.id,
            from: mail.envelope_from.clone(),
            to: mail.envelope_to.clone(),
            subject: String::new(),
            date: None,
            body: String::new(),
            attachments: Vec::new(),
            size: mail.data.len(),
            secure: mail.secure,
            authenticated_as: mail.authenticated_as.clone(),
            received_at: mail.received_at.to_rfc3339(),
        };

        match parse_mail(&mail.data) {
            Ok(parsed) => {
                if let Some(from) = parsed.headers.get_first_value("From") {
                    summary.from = from;
                }
                summary.subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
                summary.date = parsed.headers.get_first_value("Date");
                summary.walk(&parsed);
            }
            Err(error) => {
                debug!(id = mail.id, error = %error, "Captured message is not valid MIME");
                summary.body = mail.text().into_owned();
            }
        }
        summary
    }

    /// Collects the body from the first text part and the names of the
    /// attached files.
    fn walk(&mut self, part: &ParsedMail) {
        let disposition = part.get_content_disposition();
        if matches!(disposition.disposition, DispositionType::Attachment) {
            let name = disposition
                .params
                .get("filename")
                .or_else(|| part.ctype.params.get("name"))
                .cloned()
                .unwrap_or_default();
            self.attachments.push(name);
            return;
        }

        if part.ctype.mimetype.starts_with("multipart/") {
            for subpart in &part.subparts {
                self.walk(subpart);
            }
        } else if part.ctype.mimetype.starts_with("text/") && self.body.is_empty() {
            self.body = part.get_body().unwrap_or_default();
        }
    }

    /// Case-insensitive search over the subject, the sender and the body.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        [&self.subject, &self.from, &self.body]
            .iter()
            .any(|field| field.to_lowercase().contains(&query))
    }
}

/// A single message, with its raw content.
#[derive(Debug, Clone, Serialize)]
pub struct MailDetail {
    #[serde(flatten)]
    pub summary: MailSummary,
    pub envelope_from: String,
    pub raw: String,
}

impl From<&CapturedMail> for MailDetail {
    fn from(mail: &CapturedMail) -> Self {
        Self {
            summary: MailSummary::from_mail(mail),
            envelope_from: mail.envelope_from.clone(),
            raw: mail.text().into_owned(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

pub fn inspect_router(store: MailStore) -> Router {
    Router::new()
        .route("/api/emails", get(list_mails))
        .route("/api/emails/clear", post(clear_mails))
        .route("/api/emails/:id", get(mail_detail).delete(delete_mail))
        .route("/ws", get(updates))
        .with_state(store)
}

/// Serves the inspection API until the listener fails.
pub async fn serve_inspect(addr: impl ToSocketAddrs, store: MailStore) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Inspection API listening");
    axum::serve(listener, inspect_router(store)).await
}

async fn list_mails(
    State(store): State<MailStore>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<MailSummary>> {
    let summaries = store
        .mails()
        .await
        .iter()
        .map(MailSummary::from_mail)
        .filter(|summary| match query.q.as_deref() {
            Some(q) if !q.is_empty() => summary.matches(q),
            _ => true,
        })
        .collect();
    Json(summaries)
}

async fn mail_detail(
    State(store): State<MailStore>,
    Path(id): Path<u64>,
) -> Result<Json<MailDetail>, StatusCode> {
    match store.get(id).await {
        Some(mail) => Ok(Json(MailDetail::from(&mail))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn delete_mail(State(store): State<MailStore>, Path(id): Path<u64>) -> StatusCode {
    if store.remove(id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn clear_mails(State(store): State<MailStore>) -> StatusCode {
    store.clear().await;
    StatusCode::NO_CONTENT
}

async fn updates(ws: WebSocketUpgrade, State(store): State<MailStore>) -> Response {
    let events = store.subscribe();
    ws.on_upgrade(move |socket| push_updates(socket, events))
}

async fn push_updates(mut socket: WebSocket, mut events: Receiver<StoreEvent>) {
    loop {
        match events.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => {
                if socket
                    .send(WsMessage::Text(UPDATE_EVENT.to_string()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("WebSocket client gone");
}
