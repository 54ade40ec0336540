//! Classifies raw frames into typed [`Message`]s and routes them by kind.
//!
//! Classification looks at which top-level keys a frame carries, checked in
//! a fixed order. Frames that are not a complete JSON object are decode
//! errors; they are counted and logged but never reach a consumer.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use tweetstream_core::{
    ContentItem, DirectNotification, LifecycleEvent, Message, MessageKind, RawFrame, StallWarning,
};
use tweetstream_telemetry::{names, MetricsRecorder};

const PREVIEW_BYTES: usize = 120;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Parse one frame.
pub fn parse_frame(frame: &RawFrame) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(frame.as_bytes())?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::NotAnObject);
    };
    Ok(classify(&obj))
}

fn classify(obj: &Map<String, Value>) -> Message {
    if obj.contains_key("text") || obj.contains_key("full_text") {
        return Message::Content(content_item(obj));
    }
    if let Some(dm) = obj.get("direct_message") {
        return Message::Direct(direct_notification(dm));
    }
    if let Some(event) = lifecycle_event(obj) {
        return Message::Lifecycle(event);
    }
    if let Some(warning) = obj.get("warning") {
        return Message::Warning(StallWarning {
            code: str_field(warning, "code").unwrap_or_default(),
            message: str_field(warning, "message").unwrap_or_default(),
            percent_full: warning
                .get("percent_full")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
        });
    }
    Message::Unknown
}

fn content_item(obj: &Map<String, Value>) -> ContentItem {
    // Long statuses carry the untruncated body under extended_tweet.
    let body = obj
        .get("extended_tweet")
        .and_then(|ext| str_field(ext, "full_text"))
        .or_else(|| obj.get("full_text").and_then(Value::as_str).map(String::from))
        .or_else(|| obj.get("text").and_then(Value::as_str).map(String::from))
        .unwrap_or_default();
    let user = obj.get("user");

    ContentItem {
        id: id_field(obj, "id"),
        author_id: user.and_then(|u| id_value(u, "id")),
        author_name: user.and_then(|u| str_field(u, "name")),
        author_handle: user.and_then(|u| str_field(u, "screen_name")),
        body,
        created_at: obj.get("created_at").and_then(Value::as_str).map(String::from),
    }
}

fn direct_notification(dm: &Value) -> DirectNotification {
    let sender = dm.get("sender");
    DirectNotification {
        id: id_value(dm, "id"),
        sender_id: id_value(dm, "sender_id").or_else(|| sender.and_then(|s| id_value(s, "id"))),
        sender_name: sender.and_then(|s| str_field(s, "name")),
        recipient_id: id_value(dm, "recipient_id"),
        body: str_field(dm, "text").unwrap_or_default(),
    }
}

fn lifecycle_event(obj: &Map<String, Value>) -> Option<LifecycleEvent> {
    if let Some(delete) = obj.get("delete") {
        let status = delete.get("status").unwrap_or(delete);
        return Some(LifecycleEvent::StatusDeletion {
            id: id_value(status, "id"),
            user_id: id_value(status, "user_id"),
        });
    }
    if let Some(scrub) = obj.get("scrub_geo") {
        return Some(LifecycleEvent::LocationDeletion {
            user_id: id_value(scrub, "user_id"),
            up_to_status_id: id_value(scrub, "up_to_status_id"),
        });
    }
    if let Some(limit) = obj.get("limit") {
        return Some(LifecycleEvent::Limit {
            undelivered: limit.get("track").and_then(Value::as_u64).unwrap_or(0),
        });
    }
    if let Some(withheld) = obj.get("status_withheld") {
        return Some(LifecycleEvent::StatusWithheld {
            id: id_value(withheld, "id"),
            user_id: id_value(withheld, "user_id"),
            countries: countries(withheld),
        });
    }
    if let Some(withheld) = obj.get("user_withheld") {
        return Some(LifecycleEvent::UserWithheld {
            id: id_value(withheld, "id"),
            countries: countries(withheld),
        });
    }
    if let Some(disconnect) = obj.get("disconnect") {
        return Some(LifecycleEvent::Disconnect {
            code: disconnect
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or(0),
            stream_name: str_field(disconnect, "stream_name"),
            reason: str_field(disconnect, "reason").unwrap_or_default(),
        });
    }
    if let Some(friends) = obj.get("friends").and_then(Value::as_array) {
        return Some(LifecycleEvent::FriendsList {
            friend_ids: friends.iter().filter_map(Value::as_u64).collect(),
        });
    }
    if let Some(event) = obj.get("event").and_then(Value::as_str) {
        return Some(LifecycleEvent::UserEvent {
            event: event.to_string(),
            source_id: obj.get("source").and_then(|s| id_value(s, "id")),
            target_id: obj.get("target").and_then(|t| id_value(t, "id")),
        });
    }
    None
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

fn id_value(value: &Value, key: &str) -> Option<String> {
    value.as_object().and_then(|obj| id_field(obj, key))
}

/// Prefer the `<key>_str` twin: numeric ids overflow JSON doubles.
fn id_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    if let Some(s) = obj.get(&format!("{key}_str")).and_then(Value::as_str) {
        return Some(s.to_string());
    }
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn countries(value: &Value) -> Vec<String> {
    value
        .get("withheld_in_countries")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default()
}

/// Frame decoder that records outcomes.
#[derive(Clone)]
pub struct Decoder {
    metrics: Arc<MetricsRecorder>,
}

impl Decoder {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self { metrics }
    }

    /// Decode a frame, or `None` if it is malformed.
    pub fn decode(&self, frame: &RawFrame) -> Option<Message> {
        match parse_frame(frame) {
            Ok(message) => {
                let kind = message.kind();
                self.metrics
                    .counter_inc(names::MESSAGES_DECODED, &[("kind", kind.as_str())], 1);
                Some(message)
            }
            Err(e) => {
                warn!(error = %e, len = frame.len(), preview = %frame.preview(PREVIEW_BYTES), "dropping undecodable frame");
                self.metrics.counter_inc(names::DECODE_ERRORS, &[], 1);
                None
            }
        }
    }
}

type Handler<T> = Box<dyn FnMut(T) + Send>;

/// Routes each decoded message to the consumer registered for its kind.
///
/// Kinds without a consumer are logged at debug level and dropped.
pub struct Demux {
    content: Option<Handler<ContentItem>>,
    direct: Option<Handler<DirectNotification>>,
    lifecycle: Option<Handler<LifecycleEvent>>,
    warning: Option<Handler<StallWarning>>,
}

impl Default for Demux {
    fn default() -> Self {
        Self::new()
    }
}

impl Demux {
    pub fn new() -> Self {
        Self {
            content: None,
            direct: None,
            lifecycle: None,
            warning: None,
        }
    }

    pub fn on_content(mut self, f: impl FnMut(ContentItem) + Send + 'static) -> Self {
        self.content = Some(Box::new(f));
        self
    }

    pub fn on_direct(mut self, f: impl FnMut(DirectNotification) + Send + 'static) -> Self {
        self.direct = Some(Box::new(f));
        self
    }

    pub fn on_lifecycle(mut self, f: impl FnMut(LifecycleEvent) + Send + 'static) -> Self {
        self.lifecycle = Some(Box::new(f));
        self
    }

    pub fn on_warning(mut self, f: impl FnMut(StallWarning) + Send + 'static) -> Self {
        self.warning = Some(Box::new(f));
        self
    }

    pub fn handle(&mut self, message: Message) {
        match message {
            Message::Content(item) => dispatch(&mut self.content, item, MessageKind::Content),
            Message::Direct(dm) => dispatch(&mut self.direct, dm, MessageKind::Direct),
            Message::Lifecycle(event) => {
                dispatch(&mut self.lifecycle, event, MessageKind::Lifecycle)
            }
            Message::Warning(w) => dispatch(&mut self.warning, w, MessageKind::Warning),
            Message::Unknown => debug!("ignoring unrecognized upstream message"),
        }
    }
}

fn dispatch<T>(handler: &mut Option<Handler<T>>, value: T, kind: MessageKind) {
    match handler {
        Some(f) => f(value),
        None => debug!(%kind, "no consumer registered, dropping message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn parse(json: &str) -> Message {
        parse_frame(&RawFrame::new(json.to_string())).unwrap()
    }

    #[test]
    fn status_becomes_content() {
        let msg = parse(
            r#"{"id":1050118621198921728,"id_str":"1050118621198921728","text":"hello",
                "created_at":"Wed Oct 10 20:19:24 +0000 2018",
                "user":{"id":6253282,"id_str":"6253282","name":"Dev","screen_name":"dev"}}"#,
        );
        let Message::Content(item) = msg else {
            panic!("expected content, got {msg:?}");
        };
        assert_eq!(item.id.as_deref(), Some("1050118621198921728"));
        assert_eq!(item.body, "hello");
        assert_eq!(item.author_id.as_deref(), Some("6253282"));
        assert_eq!(item.author_name.as_deref(), Some("Dev"));
        assert_eq!(item.author_handle.as_deref(), Some("dev"));
        assert_eq!(item.created_at.as_deref(), Some("Wed Oct 10 20:19:24 +0000 2018"));
    }

    #[test]
    fn extended_body_preferred() {
        let msg = parse(
            r#"{"text":"short…","truncated":true,"extended_tweet":{"full_text":"the whole thing"}}"#,
        );
        assert!(matches!(msg, Message::Content(ref c) if c.body == "the whole thing"));
    }

    #[test]
    fn full_text_alone_is_content() {
        let msg = parse(r#"{"full_text":"long form"}"#);
        assert!(matches!(msg, Message::Content(ref c) if c.body == "long form" && c.id.is_none()));
    }

    #[test]
    fn direct_message_classified() {
        let msg = parse(
            r#"{"direct_message":{"id_str":"9","text":"psst","sender_id_str":"1",
                "recipient_id_str":"2","sender":{"name":"A"}}}"#,
        );
        let Message::Direct(dm) = msg else {
            panic!("expected direct");
        };
        assert_eq!(dm.id.as_deref(), Some("9"));
        assert_eq!(dm.sender_id.as_deref(), Some("1"));
        assert_eq!(dm.sender_name.as_deref(), Some("A"));
        assert_eq!(dm.recipient_id.as_deref(), Some("2"));
        assert_eq!(dm.body, "psst");
    }

    #[test]
    fn lifecycle_notices_classified() {
        let cases = [
            (r#"{"delete":{"status":{"id":1,"id_str":"1","user_id":3,"user_id_str":"3"}}}"#, "status_deletion"),
            (r#"{"scrub_geo":{"user_id_str":"4","up_to_status_id_str":"5"}}"#, "location_deletion"),
            (r#"{"limit":{"track":1234}}"#, "limit"),
            (r#"{"status_withheld":{"id":7,"user_id":8,"withheld_in_countries":["DE"]}}"#, "status_withheld"),
            (r#"{"user_withheld":{"id":8,"withheld_in_countries":["DE","AR"]}}"#, "user_withheld"),
            (r#"{"disconnect":{"code":4,"stream_name":"x","reason":"duplicate"}}"#, "disconnect"),
            (r#"{"friends":[1,2,3]}"#, "friends_list"),
            (r#"{"event":"favorite","source":{"id_str":"1"},"target":{"id_str":"2"}}"#, "user_event"),
        ];
        for (json, name) in cases {
            match parse(json) {
                Message::Lifecycle(event) => assert_eq!(event.name(), name, "{json}"),
                other => panic!("{json} → {other:?}"),
            }
        }
    }

    #[test]
    fn limit_and_disconnect_fields() {
        assert_eq!(
            parse(r#"{"limit":{"track":42}}"#),
            Message::Lifecycle(LifecycleEvent::Limit { undelivered: 42 })
        );
        assert_eq!(
            parse(r#"{"disconnect":{"code":7,"stream_name":"s","reason":"admin logout"}}"#),
            Message::Lifecycle(LifecycleEvent::Disconnect {
                code: 7,
                stream_name: Some("s".into()),
                reason: "admin logout".into(),
            })
        );
    }

    #[test]
    fn stall_warning_classified() {
        let msg = parse(
            r#"{"warning":{"code":"FALLING_BEHIND","message":"behind","percent_full":60}}"#,
        );
        assert_eq!(
            msg,
            Message::Warning(StallWarning {
                code: "FALLING_BEHIND".into(),
                message: "behind".into(),
                percent_full: Some(60),
            })
        );
    }

    #[test]
    fn unrecognized_object_is_unknown() {
        assert_eq!(parse(r#"{"something":"else"}"#), Message::Unknown);
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(matches!(
            parse_frame(&RawFrame::new("{\"text\":\"trunc")),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            parse_frame(&RawFrame::new("[1,2]")),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn decoder_counts_outcomes() {
        let metrics = Arc::new(MetricsRecorder::new());
        let decoder = Decoder::new(Arc::clone(&metrics));

        assert!(decoder.decode(&RawFrame::new("{\"text\":\"a\"}")).is_some());
        assert!(decoder.decode(&RawFrame::new("{\"limit\":{\"track\":1}}")).is_some());
        assert!(decoder.decode(&RawFrame::new("not json")).is_none());

        assert_eq!(metrics.counter_get(names::MESSAGES_DECODED, &[("kind", "content")]), 1);
        assert_eq!(metrics.counter_get(names::MESSAGES_DECODED, &[("kind", "lifecycle")]), 1);
        assert_eq!(metrics.counter_total(names::DECODE_ERRORS), 1);
    }

    #[test]
    fn demux_routes_by_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let content_seen = Arc::clone(&seen);
        let lifecycle_seen = Arc::clone(&seen);

        let mut demux = Demux::new()
            .on_content(move |item| content_seen.lock().unwrap().push(format!("content:{}", item.body)))
            .on_lifecycle(move |event| lifecycle_seen.lock().unwrap().push(format!("lifecycle:{}", event.name())));

        demux.handle(parse(r#"{"text":"a"}"#));
        demux.handle(parse(r#"{"limit":{"track":3}}"#));
        // No consumer: silently dropped
        demux.handle(parse(r#"{"warning":{"code":"X","message":"m"}}"#));
        demux.handle(Message::Unknown);
        demux.handle(parse(r#"{"text":"b"}"#));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["content:a", "lifecycle:limit", "content:b"]
        );
    }
}
