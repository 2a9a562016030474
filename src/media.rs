//! Downloads attached media from the protocol, assigns an extension, and
//! persists it via the storage collaborator. Failures here are
//! logged, never propagated — the event proceeds with the protocol's
//! (possibly ephemeral) media reference already set by the message parser.

use crate::model::{MessageType, NormalizedMessage};
use crate::protocol::{MediaKind, MediaStorage, ProtocolClient};

fn default_mimetype(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image/jpeg",
        MediaKind::Video => "video/mp4",
        MediaKind::Audio => "audio/ogg",
        MediaKind::Document => "application/octet-stream",
        MediaKind::Sticker => "image/webp",
    }
}

fn extension_for(mimetype: &str) -> &'static str {
    match mimetype {
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "video/mp4" => ".mp4",
        "video/3gpp" => ".3gp",
        "audio/ogg" => ".ogg",
        "audio/mpeg" => ".mp3",
        "audio/aac" => ".aac",
        "application/pdf" => ".pdf",
        _ => ".bin",
    }
}

fn message_type_to_kind(ty: MessageType) -> Option<MediaKind> {
    match ty {
        MessageType::Image => Some(MediaKind::Image),
        MessageType::Video => Some(MediaKind::Video),
        MessageType::Audio => Some(MediaKind::Audio),
        MessageType::Document => Some(MediaKind::Document),
        MessageType::Sticker => Some(MediaKind::Sticker),
        _ => None,
    }
}

/// Resolve an extension for a media message: prefer the declared filename's
/// suffix for documents, else a MIME→extension table, else `.bin`.
fn resolve_extension(message_type: MessageType, mimetype: &str, filename: Option<&str>) -> String {
    if message_type == MessageType::Document {
        if let Some(name) = filename {
            if let Some(dot) = name.rfind('.') {
                let ext = &name[dot..];
                if !ext.is_empty() && ext.len() <= 10 {
                    return ext.to_lowercase();
                }
            }
        }
    }
    extension_for(mimetype).to_string()
}

/// Downloads, validates, and persists the media attached to `msg`, mutating
/// `media_url` on success. On any failure, logs and leaves `msg` untouched.
pub async fn process_media(
    msg: &mut NormalizedMessage,
    client: &dyn ProtocolClient,
    storage: &dyn MediaStorage,
) {
    let Some(kind) = message_type_to_kind(msg.message_type) else {
        return; // not a media-bearing message
    };
    let Some(media_url) = msg.media_url.clone() else {
        tracing::warn!(message_id = %msg.message_id, "media message has no protocol reference, skipping");
        return;
    };

    if let Some(size) = msg.media_size {
        let limit = storage.max_bytes();
        if size > limit {
            tracing::warn!(
                message_id = %msg.message_id,
                size,
                limit,
                "media exceeds configured size limit, keeping ephemeral reference"
            );
            return;
        }
    }

    let media_key = msg.media_key.clone().unwrap_or_default();
    let plaintext = match client.download(&media_url, &media_key).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(message_id = %msg.message_id, error = %e, "media download failed, keeping ephemeral reference");
            return;
        }
    };

    let mimetype = msg
        .mimetype
        .clone()
        .unwrap_or_else(|| default_mimetype(kind).to_string());
    let extension = resolve_extension(msg.message_type, &mimetype, msg.filename.as_deref());

    match storage
        .store(&msg.session_id, &msg.message_id, &mimetype, &extension, plaintext)
        .await
    {
        Ok(stored) => {
            msg.media_url = Some(stored.public_url);
            msg.mimetype = Some(mimetype);
        }
        Err(e) => {
            tracing::warn!(message_id = %msg.message_id, error = %e, "media storage failed, keeping ephemeral reference");
        }
    }
}
