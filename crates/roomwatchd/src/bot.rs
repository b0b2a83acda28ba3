//! Telegram alert delivery and classification callbacks.
//!
//! A single task owns the bot: it delivers batches handed over by the frame
//! loop and long-polls `getUpdates` for Known/Unknown button presses.

use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use reqwest::multipart::{Form, Part};
use roomwatch_core::{AlertBatch, AlertSink, Classification, TelegramSettings};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

const API_BASE: &str = "https://api.telegram.org";
const PROMPT_TEXT: &str = "Is this person known or unknown?";
const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Unanswered prompts older than this are forgotten.
const PENDING_MAX_AGE_SECS: i64 = 60 * 60;
/// Most prompts awaiting an answer at once; the oldest go first.
const PENDING_LIMIT: usize = 64;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram api: {0}")]
    Api(String),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, BotError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(BotError::Api(
                self.description.unwrap_or_else(|| "request rejected".to_string()),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub data: Option<String>,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// Thin Bot API client bound to one chat.
pub struct TelegramClient {
    http: reqwest::Client,
    base: String,
    chat_id: String,
}

impl TelegramClient {
    pub fn new(settings: &TelegramSettings) -> Result<Self, BotError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()?;
        Ok(Self {
            http,
            base: format!("{API_BASE}/bot{}", settings.bot_token),
            chat_id: settings.chat_id.clone(),
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, BotError> {
        let response: ApiResponse<T> = request.send().await?.json().await?;
        response.into_result()
    }

    fn method(&self, name: &str) -> String {
        format!("{}/{name}", self.base)
    }

    pub async fn send_photo(&self, jpeg: Vec<u8>, caption: String) -> Result<(), BotError> {
        let photo = Part::bytes(jpeg)
            .file_name("snapshot.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption)
            .part("photo", photo);
        self.send::<Value>(self.http.post(self.method("sendPhoto")).multipart(form))
            .await?;
        Ok(())
    }

    pub async fn send_prompt(&self, batch: Uuid) -> Result<(), BotError> {
        let body = prompt_payload(&self.chat_id, batch);
        self.send::<Value>(self.http.post(self.method("sendMessage")).json(&body))
            .await?;
        Ok(())
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, BotError> {
        let body = json!({
            "offset": offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["callback_query"],
        });
        self.send(self.http.post(self.method("getUpdates")).json(&body))
            .await
    }

    pub async fn answer_callback(&self, callback_id: &str) -> Result<(), BotError> {
        let body = json!({ "callback_query_id": callback_id });
        self.send::<bool>(self.http.post(self.method("answerCallbackQuery")).json(&body))
            .await?;
        Ok(())
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), BotError> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        self.send::<Value>(self.http.post(self.method("editMessageText")).json(&body))
            .await?;
        Ok(())
    }
}

/// `sendMessage` body carrying the Known / Unknown buttons for `batch`.
fn prompt_payload(chat_id: &str, batch: Uuid) -> Value {
    json!({
        "chat_id": chat_id,
        "text": PROMPT_TEXT,
        "reply_markup": {
            "inline_keyboard": [[
                { "text": "Known", "callback_data": Classification::Known.callback_data(batch) },
                { "text": "Unknown", "callback_data": Classification::Unknown.callback_data(batch) },
            ]]
        }
    })
}

fn snapshot_caption(index: usize) -> String {
    format!("Snapshot {} of intruder.", index + 1)
}

fn reply_text(classification: Classification) -> &'static str {
    match classification {
        Classification::Known => "Person marked as Known. Updating database...",
        Classification::Unknown => "Person marked as Unknown. Alert logged.",
    }
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    Ok(buf)
}

#[derive(Debug, PartialEq)]
enum CallbackResolution {
    Classified {
        classification: Classification,
        batch: Uuid,
        raised_at: DateTime<Utc>,
    },
    /// Well-formed, but for a batch that is not (or no longer) pending.
    Stale(Uuid),
    Malformed,
}

/// Match a button payload against the pending batches, resolving at most once.
fn resolve_callback(pending: &mut HashMap<Uuid, DateTime<Utc>>, data: &str) -> CallbackResolution {
    let Some((classification, batch)) = Classification::parse_callback(data) else {
        return CallbackResolution::Malformed;
    };
    match pending.remove(&batch) {
        Some(raised_at) => CallbackResolution::Classified {
            classification,
            batch,
            raised_at,
        },
        None => CallbackResolution::Stale(batch),
    }
}

/// Forget prompts past [`PENDING_MAX_AGE_SECS`], then the oldest beyond
/// [`PENDING_LIMIT`]. Returns how many were dropped.
fn evict_pending(pending: &mut HashMap<Uuid, DateTime<Utc>>, now: DateTime<Utc>) -> usize {
    let before = pending.len();
    let cutoff = now - chrono::Duration::seconds(PENDING_MAX_AGE_SECS);
    pending.retain(|_, raised_at| *raised_at >= cutoff);

    while pending.len() > PENDING_LIMIT {
        let Some(oldest) = pending.iter().min_by_key(|(_, at)| **at).map(|(id, _)| *id) else {
            break;
        };
        pending.remove(&oldest);
    }
    before - pending.len()
}

/// Deliver one batch: snapshots in order, then the prompt.
async fn deliver(client: &TelegramClient, batch: &AlertBatch) -> Result<(), BotError> {
    for (index, image) in batch.images.iter().enumerate() {
        let jpeg = encode_jpeg(image)?;
        client.send_photo(jpeg, snapshot_caption(index)).await?;
    }
    client.send_prompt(batch.id).await?;
    Ok(())
}

async fn handle_update(
    client: &TelegramClient,
    pending: &mut HashMap<Uuid, DateTime<Utc>>,
    update: Update,
) {
    let Some(query) = update.callback_query else {
        return;
    };

    if let Err(e) = client.answer_callback(&query.id).await {
        tracing::warn!(error = %e, "failed to acknowledge callback");
    }

    let data = query.data.unwrap_or_default();
    match resolve_callback(pending, &data) {
        CallbackResolution::Classified {
            classification,
            batch,
            raised_at,
        } => {
            tracing::info!(
                batch = %batch,
                classification = classification.as_str(),
                waited_secs = (Utc::now() - raised_at).num_seconds(),
                "user classified intruder"
            );
            if let Some(message) = query.message {
                if let Err(e) = client
                    .edit_message_text(
                        message.chat.id,
                        message.message_id,
                        reply_text(classification),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "failed to update prompt");
                }
            }
        }
        CallbackResolution::Stale(batch) => {
            tracing::info!(batch = %batch, "callback for an alert that is no longer pending");
        }
        CallbackResolution::Malformed => {
            tracing::warn!(data = %data, "ignoring unrecognized callback data");
        }
    }
}

/// Run the bot until the frame loop closes the alert channel.
pub async fn run(client: TelegramClient, mut alerts: mpsc::Receiver<AlertBatch>) {
    let mut pending: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    let mut offset = 0i64;

    tracing::info!("telegram bot started");
    loop {
        tokio::select! {
            batch = alerts.recv() => {
                let Some(batch) = batch else {
                    break;
                };
                match deliver(&client, &batch).await {
                    Ok(()) => {
                        tracing::info!(
                            batch = %batch.id,
                            snapshots = batch.images.len(),
                            "intruder alert sent"
                        );
                        pending.insert(batch.id, batch.raised_at);
                        let evicted = evict_pending(&mut pending, Utc::now());
                        if evicted > 0 {
                            tracing::info!(
                                evicted,
                                pending = pending.len(),
                                "dropped unanswered alert prompts"
                            );
                        }
                    }
                    Err(e) => tracing::error!(
                        batch = %batch.id,
                        error = %e,
                        "failed to send intruder alert"
                    ),
                }
            }
            updates = client.get_updates(offset) => {
                match updates {
                    Ok(updates) => {
                        for update in updates {
                            offset = offset.max(update.update_id + 1);
                            handle_update(&client, &mut pending, update).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "getUpdates failed; retrying");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        tracing::info!(unresolved = pending.len(), "alerts left unclassified at shutdown");
    }
    tracing::info!("telegram bot stopped");
}

/// Frame-loop side of the alert channel. Never blocks: a full queue drops
/// the batch.
pub struct AlertChannel {
    tx: mpsc::Sender<AlertBatch>,
}

impl AlertChannel {
    pub fn new(tx: mpsc::Sender<AlertBatch>) -> Self {
        Self { tx }
    }
}

impl AlertSink for AlertChannel {
    fn send_alert(&self, batch: AlertBatch) {
        match self.tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                tracing::warn!(batch = %batch.id, "alert queue full; dropping intruder alert");
            }
            Err(TrySendError::Closed(batch)) => {
                tracing::warn!(batch = %batch.id, "alert channel closed; dropping intruder alert");
            }
        }
    }
}

/// Used when no Telegram credentials are configured.
pub struct LogOnlySink;

impl AlertSink for LogOnlySink {
    fn send_alert(&self, batch: AlertBatch) {
        tracing::warn!(
            batch = %batch.id,
            snapshots = batch.images.len(),
            "intruder alert (telegram not configured, not sent)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_payload_buttons() {
        let batch = Uuid::new_v4();
        let body = prompt_payload("-1001", batch);
        assert_eq!(body["chat_id"], "-1001");
        assert_eq!(body["text"], PROMPT_TEXT);

        let row = &body["reply_markup"]["inline_keyboard"][0];
        assert_eq!(row[0]["text"], "Known");
        assert_eq!(row[0]["callback_data"], format!("known:{batch}"));
        assert_eq!(row[1]["text"], "Unknown");
        assert_eq!(row[1]["callback_data"], format!("unknown:{batch}"));
    }

    #[test]
    fn test_snapshot_captions_are_one_based() {
        assert_eq!(snapshot_caption(0), "Snapshot 1 of intruder.");
        assert_eq!(snapshot_caption(2), "Snapshot 3 of intruder.");
    }

    #[test]
    fn test_resolve_callback_once() {
        let batch = Uuid::new_v4();
        let raised_at = Utc::now();
        let mut pending = HashMap::from([(batch, raised_at)]);

        let data = Classification::Known.callback_data(batch);
        assert_eq!(
            resolve_callback(&mut pending, &data),
            CallbackResolution::Classified {
                classification: Classification::Known,
                batch,
                raised_at,
            }
        );
        assert!(pending.is_empty());
        assert_eq!(resolve_callback(&mut pending, &data), CallbackResolution::Stale(batch));
    }

    #[test]
    fn test_evict_pending_drops_expired_prompts() {
        let now = Utc::now();
        let fresh = Uuid::new_v4();
        let expired = Uuid::new_v4();
        let mut pending = HashMap::from([
            (fresh, now - chrono::Duration::seconds(30)),
            (expired, now - chrono::Duration::seconds(PENDING_MAX_AGE_SECS + 1)),
        ]);

        assert_eq!(evict_pending(&mut pending, now), 1);
        assert!(pending.contains_key(&fresh));

        let data = Classification::Unknown.callback_data(expired);
        assert_eq!(resolve_callback(&mut pending, &data), CallbackResolution::Stale(expired));
    }

    #[test]
    fn test_evict_pending_caps_size_oldest_first() {
        let now = Utc::now();
        let ids: Vec<Uuid> = (0..PENDING_LIMIT + 3).map(|_| Uuid::new_v4()).collect();
        // ids[0] is the oldest prompt.
        let mut pending: HashMap<Uuid, DateTime<Utc>> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, now - chrono::Duration::seconds((ids.len() - i) as i64)))
            .collect();

        assert_eq!(evict_pending(&mut pending, now), 3);
        assert_eq!(pending.len(), PENDING_LIMIT);
        assert!(ids[..3].iter().all(|id| !pending.contains_key(id)));
        assert!(ids[3..].iter().all(|id| pending.contains_key(id)));
    }

    #[test]
    fn test_resolve_callback_rejects_malformed() {
        let mut pending = HashMap::new();
        assert_eq!(resolve_callback(&mut pending, "known"), CallbackResolution::Malformed);
        assert_eq!(resolve_callback(&mut pending, ""), CallbackResolution::Malformed);
    }

    #[test]
    fn test_reply_texts() {
        assert_eq!(
            reply_text(Classification::Known),
            "Person marked as Known. Updating database..."
        );
        assert_eq!(
            reply_text(Classification::Unknown),
            "Person marked as Unknown. Alert logged."
        );
    }

    #[test]
    fn test_update_deserialization() {
        let raw = r#"{
            "ok": true,
            "result": [
                {"update_id": 7, "callback_query": {
                    "id": "abc", "data": "unknown:00000000-0000-0000-0000-000000000001",
                    "message": {"message_id": 55, "chat": {"id": -1001}, "text": "Is this person known or unknown?"}
                }},
                {"update_id": 8, "message": {"message_id": 56, "chat": {"id": 1}}}
            ]
        }"#;
        let response: ApiResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let updates = response.into_result().unwrap();
        assert_eq!(updates.len(), 2);

        let query = updates[0].callback_query.as_ref().unwrap();
        assert_eq!(query.id, "abc");
        let message = query.message.as_ref().unwrap();
        assert_eq!((message.message_id, message.chat.id), (55, -1001));
        assert!(updates[1].callback_query.is_none());
    }

    #[test]
    fn test_api_error_surfaces_description() {
        let raw = r#"{"ok": false, "error_code": 401, "description": "Unauthorized"}"#;
        let response: ApiResponse<Value> = serde_json::from_str(raw).unwrap();
        match response.into_result() {
            Err(BotError::Api(msg)) => assert_eq!(msg, "Unauthorized"),
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg() {
        let jpeg = encode_jpeg(&RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]))).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_alert_channel_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = AlertChannel::new(tx);
        let first = AlertBatch::new(vec![]);
        let first_id = first.id;

        sink.send_alert(first);
        sink.send_alert(AlertBatch::new(vec![]));

        assert_eq!(rx.try_recv().unwrap().id, first_id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_alert_channel_survives_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        AlertChannel::new(tx).send_alert(AlertBatch::new(vec![]));
    }
}
