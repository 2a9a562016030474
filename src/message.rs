//! Decodes the protocol's polymorphic message envelope into a uniform
//! [`NormalizedMessage`]. Parsing never fails: an
//! unrecognized or empty envelope simply yields `message_type = Unknown`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{MessageFlags, MessageSource, MessageType, NormalizedMessage};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaFields {
    pub caption: Option<String>,
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    /// The protocol's own (possibly ephemeral) encrypted blob reference; the
    /// media downloader resolves this into a public URL and overwrites it on success.
    pub url: Option<String>,
    pub media_key: Option<Vec<u8>>,
    pub file_sha256: Option<String>,
    pub file_length: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationFields {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactFields {
    pub vcard: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollFields {
    pub name: Option<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReactionFields {
    pub emoji: Option<String>,
    pub target_stanza_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextInfo {
    pub stanza_id: Option<String>,
    pub is_forwarded: bool,
}

/// The protocol's polymorphic envelope: exactly one (or zero) of these
/// variants is populated per message, protobuf-`oneof` style.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolEnvelope {
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
    pub image: Option<MediaFields>,
    pub video: Option<MediaFields>,
    pub audio: Option<MediaFields>,
    pub document: Option<MediaFields>,
    pub sticker: Option<MediaFields>,
    pub location: Option<LocationFields>,
    pub contact: Option<ContactFields>,
    pub poll_creation: Option<PollFields>,
    pub reaction: Option<ReactionFields>,
    pub protocol: Option<serde_json::Value>,
    pub view_once: Option<Box<ProtocolEnvelope>>,
    pub view_once_v2: Option<Box<ProtocolEnvelope>>,
    pub context_info: Option<ContextInfo>,
}

/// Metadata the protocol client attaches to an envelope that isn't part of
/// the envelope's own polymorphic body.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub message_id: String,
    pub chat_jid: String,
    pub sender_jid: String,
    pub sender_push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    pub is_broadcast: bool,
}

fn new_message(session_id: &str, info: &MessageInfo, source: MessageSource, raw: &ProtocolEnvelope) -> NormalizedMessage {
    NormalizedMessage {
        message_id: info.message_id.clone(),
        session_id: session_id.to_string(),
        chat_jid: info.chat_jid.clone(),
        sender_jid: info.sender_jid.clone(),
        sender_push_name: info.sender_push_name.clone(),
        message_type: MessageType::Unknown,
        text: None,
        caption: None,
        filename: None,
        mimetype: None,
        media_url: None,
        media_key: None,
        media_sha256: None,
        media_size: None,
        latitude: None,
        longitude: None,
        address: None,
        vcard: None,
        poll_name: None,
        poll_options: Vec::new(),
        reaction_emoji: None,
        reaction_target_id: None,
        flags: MessageFlags {
            is_from_me: info.is_from_me,
            is_forwarded: false,
            is_view_once: false,
            is_broadcast: info.is_broadcast,
        },
        quoted_message_id: None,
        timestamp: info.timestamp,
        source,
        raw_payload: serde_json::to_value(raw).unwrap_or(serde_json::Value::Null),
    }
}

fn fill_media(out: &mut NormalizedMessage, m: &MediaFields, ty: MessageType) {
    out.message_type = ty;
    out.caption = m.caption.clone();
    out.filename = m.filename.clone();
    out.mimetype = m.mimetype.clone();
    out.media_url = m.url.clone();
    out.media_key = m.media_key.clone();
    out.media_sha256 = m.file_sha256.clone();
    out.media_size = m.file_length;
}

/// Dispatch on the first non-empty variant in the documented fixed order.
/// `view_once`/`view_once_v2` are checked last and recurse into the inner
/// envelope (the wrapper only ever carries one real payload).
fn classify(envelope: &ProtocolEnvelope, out: &mut NormalizedMessage) {
    if let Some(text) = &envelope.conversation {
        out.message_type = if text.trim().is_empty() {
            MessageType::Unknown
        } else {
            out.text = Some(text.clone());
            MessageType::Text
        };
        return;
    }
    if let Some(text) = &envelope.extended_text {
        out.message_type = if text.trim().is_empty() {
            MessageType::Unknown
        } else {
            out.text = Some(text.clone());
            MessageType::Text
        };
        return;
    }
    if let Some(m) = &envelope.image {
        fill_media(out, m, MessageType::Image);
        return;
    }
    if let Some(m) = &envelope.video {
        fill_media(out, m, MessageType::Video);
        return;
    }
    if let Some(m) = &envelope.audio {
        fill_media(out, m, MessageType::Audio);
        return;
    }
    if let Some(m) = &envelope.document {
        fill_media(out, m, MessageType::Document);
        return;
    }
    if let Some(m) = &envelope.sticker {
        fill_media(out, m, MessageType::Sticker);
        return;
    }
    if let Some(l) = &envelope.location {
        out.message_type = MessageType::Location;
        out.latitude = l.latitude;
        out.longitude = l.longitude;
        out.address = l.address.clone();
        return;
    }
    if let Some(c) = &envelope.contact {
        out.message_type = MessageType::Contact;
        out.vcard = c.vcard.clone();
        return;
    }
    if let Some(p) = &envelope.poll_creation {
        out.message_type = MessageType::Poll;
        out.poll_name = p.name.clone();
        out.poll_options = p.options.clone();
        return;
    }
    if let Some(r) = &envelope.reaction {
        // Reactions with an empty target id or emoji stay type=reaction;
        // downstream validation flags them invalid, not this layer.
        out.message_type = MessageType::Reaction;
        out.reaction_emoji = r.emoji.clone();
        out.reaction_target_id = r.target_stanza_id.clone();
        return;
    }
    if envelope.protocol.is_some() {
        out.message_type = MessageType::Protocol;
        return;
    }
    if let Some(inner) = &envelope.view_once {
        out.flags.is_view_once = true;
        classify(inner, out);
        return;
    }
    if let Some(inner) = &envelope.view_once_v2 {
        out.flags.is_view_once = true;
        classify(inner, out);
        return;
    }
    out.message_type = MessageType::Unknown;
}

fn apply_context(out: &mut NormalizedMessage, envelope: &ProtocolEnvelope) {
    if let Some(ctx) = &envelope.context_info {
        out.quoted_message_id = ctx.stanza_id.clone();
        out.flags.is_forwarded = ctx.is_forwarded;
    }
}

/// `parse(session_id, info, envelope) -> NormalizedMessage`. Never fails;
/// nil/empty envelopes yield `message_type = Unknown`.
pub fn parse(session_id: &str, info: &MessageInfo, envelope: &ProtocolEnvelope) -> NormalizedMessage {
    let mut out = new_message(session_id, info, MessageSource::Realtime, envelope);
    classify(envelope, &mut out);
    apply_context(&mut out, envelope);
    out
}

/// `parse_history(session_id, chat_jid, envelope, info?)`: differs from
/// [`parse`] only in `source = History`; a missing `info` synthesizes
/// reasonable defaults (the exact history metadata shape is left to the
/// protocol client collaborator).
pub fn parse_history(
    session_id: &str,
    chat_jid: &str,
    envelope: &ProtocolEnvelope,
    info: Option<&MessageInfo>,
) -> NormalizedMessage {
    let synthesized;
    let info = match info {
        Some(i) => i,
        None => {
            synthesized = MessageInfo {
                message_id: uuid::Uuid::new_v4().to_string(),
                chat_jid: chat_jid.to_string(),
                sender_jid: chat_jid.to_string(),
                sender_push_name: None,
                timestamp: Utc::now(),
                is_from_me: false,
                is_broadcast: false,
            };
            &synthesized
        }
    };
    let mut out = new_message(session_id, info, MessageSource::History, envelope);
    out.chat_jid = chat_jid.to_string();
    classify(envelope, &mut out);
    apply_context(&mut out, envelope);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> MessageInfo {
        MessageInfo {
            message_id: "msg1".into(),
            chat_jid: "12025550123@s.whatsapp.net".into(),
            sender_jid: "12025550123@s.whatsapp.net".into(),
            sender_push_name: Some("Alice".into()),
            timestamp: Utc::now(),
            is_from_me: false,
            is_broadcast: false,
        }
    }

    #[test]
    fn empty_envelope_is_unknown_never_panics() {
        let out = parse("s1", &info(), &ProtocolEnvelope::default());
        assert_eq!(out.message_type, MessageType::Unknown);
    }

    #[test]
    fn whitespace_only_text_collapses_to_unknown() {
        let env = ProtocolEnvelope {
            conversation: Some("   \n\t ".into()),
            ..Default::default()
        };
        let out = parse("s1", &info(), &env);
        assert_eq!(out.message_type, MessageType::Unknown);
    }

    #[test]
    fn conversation_dispatches_before_extended_text() {
        let env = ProtocolEnvelope {
            conversation: Some("hi".into()),
            extended_text: Some("should not win".into()),
            ..Default::default()
        };
        let out = parse("s1", &info(), &env);
        assert_eq!(out.message_type, MessageType::Text);
        assert_eq!(out.text.as_deref(), Some("hi"));
    }

    #[test]
    fn view_once_sets_flag_and_recurses() {
        let inner = ProtocolEnvelope {
            image: Some(MediaFields {
                mimetype: Some("image/jpeg".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let env = ProtocolEnvelope {
            view_once: Some(Box::new(inner)),
            ..Default::default()
        };
        let out = parse("s1", &info(), &env);
        assert_eq!(out.message_type, MessageType::Image);
        assert!(out.flags.is_view_once);
    }

    #[test]
    fn context_info_sets_quote_and_forwarded() {
        let env = ProtocolEnvelope {
            conversation: Some("hi".into()),
            context_info: Some(ContextInfo {
                stanza_id: Some("parent-1".into()),
                is_forwarded: true,
            }),
            ..Default::default()
        };
        let out = parse("s1", &info(), &env);
        assert_eq!(out.quoted_message_id.as_deref(), Some("parent-1"));
        assert!(out.flags.is_forwarded);
    }

    #[test]
    fn reaction_with_empty_fields_still_typed_reaction() {
        let env = ProtocolEnvelope {
            reaction: Some(ReactionFields {
                emoji: Some(String::new()),
                target_stanza_id: None,
            }),
            ..Default::default()
        };
        let out = parse("s1", &info(), &env);
        assert_eq!(out.message_type, MessageType::Reaction);
        assert_eq!(out.reaction_target_id, None);
    }

    #[test]
    fn group_chat_jid_detected() {
        let mut i = info();
        i.chat_jid = "1234-5678@g.us".into();
        let env = ProtocolEnvelope {
            conversation: Some("hi".into()),
            ..Default::default()
        };
        let out = parse("s1", &i, &env);
        assert!(out.is_group());
    }

    #[test]
    fn parse_history_sets_source_and_chat_jid() {
        let env = ProtocolEnvelope {
            conversation: Some("old message".into()),
            ..Default::default()
        };
        let out = parse_history("s1", "555@g.us", &env, None);
        assert_eq!(out.source, MessageSource::History);
        assert_eq!(out.chat_jid, "555@g.us");
        assert_eq!(out.message_type, MessageType::Text);
    }

    #[test]
    fn round_trip_raw_payload_reparses_equal_modulo_raw(
    ) {
        let env = ProtocolEnvelope {
            conversation: Some("hi".into()),
            ..Default::default()
        };
        let out = parse("s1", &info(), &env);
        let reparsed_env: ProtocolEnvelope =
            serde_json::from_value(out.raw_payload.clone()).unwrap();
        let out2 = parse("s1", &info(), &reparsed_env);
        assert_eq!(out.message_type, out2.message_type);
        assert_eq!(out.text, out2.text);
    }
}
