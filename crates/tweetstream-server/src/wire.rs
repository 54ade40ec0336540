use serde::Serialize;
use tweetstream_core::ContentItem;

/// One unit written to a client connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    /// Keep-alive with no content.
    Heartbeat,
    /// Encoded content payload (see [`encode_content`]).
    Content(String),
}

#[derive(Serialize)]
struct TweetPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    item: &'a ContentItem,
}

/// JSON payload for one content item, as delivered to browsers.
pub fn encode_content(item: &ContentItem) -> Result<String, serde_json::Error> {
    serde_json::to_string(&TweetPayload {
        kind: "tweet",
        item,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn payload_carries_type_and_fields() {
        let item = ContentItem {
            id: Some("42".into()),
            author_id: Some("7".into()),
            author_name: Some("Dev".into()),
            author_handle: Some("dev".into()),
            body: "hello \"world\"\nline two".into(),
            created_at: Some("Wed Oct 10 20:19:24 +0000 2018".into()),
        };
        let json = encode_content(&item).unwrap();
        assert!(!json.contains('\n'), "payload must stay on one line: {json}");

        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "tweet");
        assert_eq!(value["id"], "42");
        assert_eq!(value["author_handle"], "dev");
        assert_eq!(value["body"], "hello \"world\"\nline two");
    }

    #[test]
    fn missing_fields_are_null() {
        let item = ContentItem {
            body: "x".into(),
            ..Default::default()
        };
        let value: Value = serde_json::from_str(&encode_content(&item).unwrap()).unwrap();
        assert_eq!(value["body"], "x");
        assert!(value["id"].is_null());
        assert!(value["created_at"].is_null());
    }
}
