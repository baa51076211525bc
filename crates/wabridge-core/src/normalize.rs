//! Raw event normalization.
//!
//! Maps a variably-shaped raw event into an [`InboundMessage`] or skips it.
//! Content precedence, first match wins:
//!
//! 1. plain text
//! 2. extended (quoted / link preview) text
//! 3. captioned image, video or document (skipped without a caption)
//! 4. audio, as a fixed placeholder
//!
//! Everything else is skipped.

use crate::raw::{Media, MessageContent, RawEvent, UpsertKind};
use crate::types::InboundMessage;

/// Address suffix used by group conversations.
pub const GROUP_SUFFIX: &str = "@g.us";

/// Reserved conversation carrying status (story) updates.
pub const STATUS_BROADCAST: &str = "status@broadcast";

/// Placeholder content for voice and audio messages.
pub const VOICE_PLACEHOLDER: &str = "[Voice Message]";

/// Whether a conversation address is a group.
#[must_use]
pub fn is_group(jid: &str) -> bool {
    jid.ends_with(GROUP_SUFFIX)
}

/// Strip the device part from an address (`123:4@s.whatsapp.net` -> `123@s.whatsapp.net`).
#[must_use]
pub fn bare_address(jid: &str) -> String {
    match jid.split_once('@') {
        Some((user, server)) => {
            let user = user.split_once(':').map_or(user, |(u, _)| u);
            format!("{user}@{server}")
        }
        None => jid.split_once(':').map_or(jid, |(u, _)| u).to_string(),
    }
}

/// Normalize one raw event.
///
/// `own_id` is the bridge's own address once the session has opened; events
/// sent from it are skipped even when the `fromMe` flag is missing.
#[must_use]
pub fn extract(raw: &RawEvent, own_id: Option<&str>) -> Option<InboundMessage> {
    if raw.key.from_me {
        return None;
    }
    let remote = raw.key.remote_jid.as_deref().filter(|jid| !jid.is_empty())?;
    if remote == STATUS_BROADCAST {
        return None;
    }
    if let Some(own) = own_id {
        let own = bare_address(own);
        let author = raw.key.participant.as_deref().unwrap_or(remote);
        if bare_address(author) == own {
            return None;
        }
    }

    let content = extract_content(raw.message.as_ref()?)?;
    let group = is_group(remote);

    Some(InboundMessage {
        id: raw.key.id.clone().unwrap_or_default(),
        sender: remote.to_string(),
        content,
        timestamp: raw.timestamp_secs(),
        is_group: group,
        push_name: raw.push_name.clone().filter(|name| !name.is_empty()),
        participant: if group {
            raw.key.participant.clone()
        } else {
            None
        },
    })
}

/// Normalize a delivered batch. Only live (`notify`) batches produce messages.
#[must_use]
pub fn extract_batch(
    kind: UpsertKind,
    events: &[RawEvent],
    own_id: Option<&str>,
) -> Vec<InboundMessage> {
    if kind != UpsertKind::Notify {
        tracing::debug!(?kind, count = events.len(), "skipping non-live batch");
        return Vec::new();
    }
    events.iter().filter_map(|raw| extract(raw, own_id)).collect()
}

/// Extract text content from a message body by precedence.
#[must_use]
pub fn extract_content(message: &MessageContent) -> Option<String> {
    if let Some(text) = &message.conversation {
        return Some(text.clone());
    }
    if let Some(extended) = &message.extended_text_message {
        return extended.text.clone();
    }
    let media = [
        ("Image", &message.image_message),
        ("Video", &message.video_message),
        ("Document", &message.document_message),
    ];
    if let Some((kind, Some(media))) = media.into_iter().find(|(_, m)| m.is_some()) {
        return captioned(kind, media);
    }
    if message.audio_message.is_some() {
        return Some(VOICE_PLACEHOLDER.to_string());
    }
    None
}

fn captioned(kind: &str, media: &Media) -> Option<String> {
    media
        .caption
        .as_deref()
        .filter(|caption| !caption.is_empty())
        .map(|caption| format!("[{kind}] {caption}"))
}
