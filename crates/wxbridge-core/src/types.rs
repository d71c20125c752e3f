use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized message kind. Anything the upstream sends outside these three
/// is dropped during sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgKind {
    Text,
    Image,
    File,
}

impl MsgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::Text => "text",
            MsgKind::Image => "image",
            MsgKind::File => "file",
        }
    }

    pub fn is_attachment(&self) -> bool {
        matches!(self, MsgKind::Image | MsgKind::File)
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MsgKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(MsgKind::Text),
            "image" => Ok(MsgKind::Image),
            "file" => Ok(MsgKind::File),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// The dispatcher's unit of work: one upstream message after normalization.
///
/// `id` is stable across duplicate deliveries; attachments carry a
/// placeholder in `text` (`[Image]` / `[File: name]`) until downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MsgKind,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub is_mine: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl InboundMessage {
    pub fn text(id: impl Into<String>, text: impl Into<String>, is_mine: bool) -> Self {
        Self {
            id: id.into(),
            kind: MsgKind::Text,
            text: text.into(),
            file_name: None,
            is_mine,
            file_path: None,
            file_size: None,
            reply_to: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_serde() {
        let json = serde_json::to_string(&MsgKind::Image).unwrap();
        assert_eq!(json, r#""image""#);
        let back: MsgKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MsgKind::Image);
    }

    #[test]
    fn inbound_message_omits_empty_fields() {
        let msg = InboundMessage::text("42", "/ping", false);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"text""#));
        assert!(!json.contains("file_name"));
        assert!(!json.contains("reply_to"));
    }
}
