use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use super::mapping::{MappingStore, SecondaryRecord};
use super::pacing;
use crate::config::{DelayRange, PacingConfig};
use crate::platform::{
    InboundMessage, MessageKind, Outgoing, SecondaryBot, SecondaryPayload, SentMessage,
    SourceConnection,
};
use crate::store::ChatSelection;

/// Source-platform contact ids are phone numbers with this suffix
const CONTACT_ID_SUFFIX: &str = "@c.us";
const CONTACT_NAME_FIELD: &str = "FN:";
const CONTACT_ID_FIELD: &str = "TEL;type=Mobile;waid=";

/// Everything a strategy needs to forward one message
pub struct ForwardContext<'a> {
    pub connection: &'a dyn SourceConnection,
    pub bot: Option<&'a dyn SecondaryBot>,
    pub selection: &'a ChatSelection,
    pub secondary_targets: &'a [i64],
    pub suffix: Option<&'a str>,
    pub pacing: &'a PacingConfig,
    pub mapping: &'a mut MappingStore,
}

/// Forwarding strategy for one inbound message, chosen by its kind
#[derive(Debug, Clone, PartialEq)]
pub enum Forwarder {
    TextMedia(InboundMessage),
    Location(InboundMessage),
    Poll(InboundMessage),
    ContactCard(InboundMessage),
}

impl Forwarder {
    /// Pick the strategy for a message. Kinds without a dedicated strategy
    /// are forwarded as text/media.
    pub fn for_message(message: InboundMessage) -> Self {
        match message.kind {
            MessageKind::Location => Forwarder::Location(message),
            MessageKind::PollCreation => Forwarder::Poll(message),
            MessageKind::ContactCard => Forwarder::ContactCard(message),
            MessageKind::Standard(_) => Forwarder::TextMedia(message),
        }
    }

    pub fn message(&self) -> &InboundMessage {
        match self {
            Forwarder::TextMedia(m)
            | Forwarder::Location(m)
            | Forwarder::Poll(m)
            | Forwarder::ContactCard(m) => m,
        }
    }

    pub async fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        match self {
            Forwarder::TextMedia(m) => forward_text_media(ctx, m).await,
            Forwarder::Location(m) => forward_location(ctx, m).await,
            Forwarder::Poll(m) => forward_poll(ctx, m).await,
            Forwarder::ContactCard(m) => forward_contact_card(ctx, m).await,
        }
    }
}

fn with_suffix(body: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) if !suffix.is_empty() => format!("{}\n\n{}", body, suffix),
        _ => body.to_string(),
    }
}

fn map_link(latitude: f64, longitude: f64) -> String {
    format!("https://www.google.com/maps?q={},{}", latitude, longitude)
}

/// Display name and numeric id from a contact card
fn contact_card_fields(vcard: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut id = None;
    for line in vcard.lines() {
        if name.is_none() {
            if let Some(pos) = line.find(CONTACT_NAME_FIELD) {
                let value = line[pos + CONTACT_NAME_FIELD.len()..].trim();
                if !value.is_empty() {
                    name = Some(value.to_string());
                }
            }
        }
        if id.is_none() {
            if let Some(pos) = line.find(CONTACT_ID_FIELD) {
                let digits: String = line[pos + CONTACT_ID_FIELD.len()..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if !digits.is_empty() {
                    id = Some(digits);
                }
            }
        }
    }
    (name, id)
}

/// Send `content` to every source-platform target and record the copies
async fn send_to_source_targets(
    ctx: &mut ForwardContext<'_>,
    message: &InboundMessage,
    pace: DelayRange,
    content: &Outgoing,
) {
    let selection = ctx.selection;
    let mut copies: Vec<SentMessage> = Vec::new();

    for chat in &selection.target_chats {
        let options = ctx.mapping.resolve_quote(message, chat);
        pacing::pause(pace).await;
        match ctx
            .connection
            .send_message(chat, content.clone(), options)
            .await
        {
            Ok(sent) => {
                info!("Forwarded {} to {}", message.id, chat);
                copies.push(sent);
            }
            Err(e) => error!("Failed to forward {} to {}: {:#}", message.id, chat, e),
        }
    }

    ctx.mapping.record_source(&message.id, copies);
}

/// Secondary-platform sends get one retry after a fixed delay
async fn send_with_retry(
    bot: &dyn SecondaryBot,
    chat_id: i64,
    payload: &SecondaryPayload,
    retry_delay: Duration,
) -> Result<i32> {
    match bot.send(chat_id, payload).await {
        Ok(id) => Ok(id),
        Err(first) => {
            warn!("Send to secondary chat {} failed, retrying: {:#}", chat_id, first);
            tokio::time::sleep(retry_delay).await;
            bot.send(chat_id, payload)
                .await
                .with_context(|| format!("Send to secondary chat {} failed twice", chat_id))
        }
    }
}

/// Mirror `payload` to every secondary target, if the user has a bot
async fn send_to_secondary_targets(
    ctx: &mut ForwardContext<'_>,
    message: &InboundMessage,
    payload: &SecondaryPayload,
) {
    let Some(bot) = ctx.bot else {
        return;
    };
    if ctx.secondary_targets.is_empty() {
        return;
    }

    let targets = ctx.secondary_targets;
    let mut copies = Vec::new();
    for &chat_id in targets {
        pacing::pause(ctx.pacing.text_send).await;
        match send_with_retry(bot, chat_id, payload, ctx.pacing.secondary_retry_delay()).await {
            Ok(message_id) => {
                info!("Mirrored {} to secondary chat {}", message.id, chat_id);
                copies.push(SecondaryRecord {
                    chat_id,
                    message_id,
                });
            }
            Err(e) => error!("{:#}", e),
        }
    }

    ctx.mapping.record_secondary(&message.id, copies);
}

async fn forward_text_media(ctx: &mut ForwardContext<'_>, message: &InboundMessage) -> Result<()> {
    let body = with_suffix(&message.body, ctx.suffix);
    let text_pace = ctx.pacing.text_send;
    let media_pace = ctx.pacing.media_send;

    if !message.has_media {
        info!("Forwarding text message {}", message.id);
        let content = Outgoing::Text {
            body: body.clone(),
            link_preview: false,
        };
        send_to_source_targets(ctx, message, text_pace, &content).await;
        send_to_secondary_targets(ctx, message, &SecondaryPayload::Text { text: body }).await;
        return Ok(());
    }

    info!("Downloading media of message {}", message.id);
    let media = ctx
        .connection
        .download_media(message)
        .await
        .with_context(|| format!("Failed to download media of {}", message.id))?;

    let content = Outgoing::Media {
        media: media.clone(),
        caption: body.clone(),
    };
    send_to_source_targets(ctx, message, media_pace, &content).await;

    if ctx.bot.is_none() || ctx.secondary_targets.is_empty() {
        return Ok(());
    }
    let payload = if media.mimetype.starts_with("image/") {
        SecondaryPayload::Photo {
            data: media.bytes()?,
            caption: body,
        }
    } else if media.mimetype.starts_with("video/") {
        SecondaryPayload::Video {
            data: media.bytes()?,
            caption: body,
        }
    } else {
        warn!(
            "Not mirroring {}: unsupported media type {}",
            message.id, media.mimetype
        );
        return Ok(());
    };
    send_to_secondary_targets(ctx, message, &payload).await;
    Ok(())
}

async fn forward_location(ctx: &mut ForwardContext<'_>, message: &InboundMessage) -> Result<()> {
    let Some(location) = message.location else {
        error!("Message {} does not contain a location", message.id);
        return Ok(());
    };

    info!("Forwarding location {}", message.id);
    let link = map_link(location.latitude, location.longitude);
    let content = Outgoing::Text {
        body: link.clone(),
        link_preview: true,
    };
    let pace = ctx.pacing.text_send;
    send_to_source_targets(ctx, message, pace, &content).await;
    send_to_secondary_targets(ctx, message, &SecondaryPayload::Text { text: link }).await;
    Ok(())
}

async fn forward_poll(ctx: &mut ForwardContext<'_>, message: &InboundMessage) -> Result<()> {
    let (MessageKind::PollCreation, Some(poll)) = (&message.kind, &message.poll) else {
        error!("Message {} is not a poll creation", message.id);
        return Ok(());
    };

    let allow_multiple_answers = poll.allow_multiple_answers.unwrap_or(false);
    info!(
        "Forwarding poll {} ({} options, multiple answers: {})",
        message.id,
        poll.options.len(),
        allow_multiple_answers
    );

    let content = Outgoing::Poll {
        name: poll.name.clone(),
        options: poll.options.clone(),
        allow_multiple_answers,
    };
    let pace = ctx.pacing.text_send;
    send_to_source_targets(ctx, message, pace, &content).await;

    let payload = SecondaryPayload::Poll {
        question: poll.name.clone(),
        options: poll.options.clone(),
        allow_multiple_answers,
    };
    send_to_secondary_targets(ctx, message, &payload).await;
    Ok(())
}

/// Contact cards are only forwarded on the source platform
async fn forward_contact_card(
    ctx: &mut ForwardContext<'_>,
    message: &InboundMessage,
) -> Result<()> {
    if message.kind != MessageKind::ContactCard {
        error!("Message {} is not a contact card", message.id);
        return Ok(());
    }

    let (name, id) = contact_card_fields(&message.body);
    let name = name.unwrap_or_else(|| "Unknown Contact".to_string());
    let Some(id) = id else {
        error!("Contact card {} ({}) has no contact id", message.id, name);
        return Ok(());
    };

    let contact = ctx
        .connection
        .get_contact_by_id(&format!("{}{}", id, CONTACT_ID_SUFFIX))
        .await
        .with_context(|| format!("Failed to look up contact {}", id))?;
    info!(
        "Forwarding contact card {} ({})",
        name,
        contact.name.as_deref().unwrap_or("Unknown Contact")
    );

    let pace = ctx.pacing.text_send;
    send_to_source_targets(ctx, message, pace, &Outgoing::Contact { contact }).await;
    Ok(())
}

/// How many forwarded copies a retraction removed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Retraction {
    pub source_deleted: usize,
    pub secondary_deleted: usize,
}

/// Delete every forwarded copy of `message`.
///
/// Stops at the first failure per platform; copies not yet deleted stay
/// tracked under the message's key.
pub async fn retract(
    connection: &dyn SourceConnection,
    bot: Option<&dyn SecondaryBot>,
    pacing: &PacingConfig,
    mapping: &mut MappingStore,
    message: &InboundMessage,
) -> Retraction {
    let mut result = Retraction::default();

    let copies = mapping.take_source(&message.id);
    if copies.is_empty() {
        info!("No forwarded copies of {} to delete", message.id);
    }
    let mut pending = copies.into_iter();
    while let Some(copy) = pending.next() {
        pacing::pause(pacing.delete_item).await;
        if let Err(e) = connection.delete_message(&copy, true).await {
            error!("Failed to delete copy {} in {}: {:#}", copy.id, copy.chat, e);
            let mut remaining = vec![copy];
            remaining.extend(pending);
            mapping.restore_source(&message.id, remaining);
            break;
        }
        result.source_deleted += 1;
    }

    if message.kind == MessageKind::ContactCard {
        return result;
    }
    let Some(bot) = bot else {
        return result;
    };

    let mut pending = mapping.take_secondary(&message.id).into_iter();
    while let Some(copy) = pending.next() {
        pacing::pause(pacing.delete_item).await;
        if let Err(e) = bot.delete_message(copy.chat_id, copy.message_id).await {
            error!(
                "Failed to delete secondary copy {} in {}: {:#}",
                copy.message_id, copy.chat_id, e
            );
            let mut remaining = vec![copy];
            remaining.extend(pending);
            mapping.restore_secondary(&message.id, remaining);
            break;
        }
        result.secondary_deleted += 1;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Location, Media, MessageId, PollSpec, QuotedRef};
    use crate::testing::{instant_pacing, text_message, FakeBot, FakeConnection};
    use std::sync::atomic::Ordering;

    fn selection(targets: &[&str]) -> ChatSelection {
        ChatSelection {
            main_chat: "main@g.us".into(),
            target_chats: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    struct Harness {
        connection: std::sync::Arc<FakeConnection>,
        bot: std::sync::Arc<FakeBot>,
        selection: ChatSelection,
        secondary: Vec<i64>,
        suffix: Option<String>,
        pacing: PacingConfig,
        mapping: MappingStore,
        with_bot: bool,
    }

    impl Harness {
        fn new(targets: &[&str]) -> Self {
            Self {
                connection: FakeConnection::new(),
                bot: FakeBot::new(),
                selection: selection(targets),
                secondary: vec![],
                suffix: None,
                pacing: instant_pacing(),
                mapping: MappingStore::new(),
                with_bot: false,
            }
        }

        fn with_secondary(mut self, chats: &[i64]) -> Self {
            self.with_bot = true;
            self.secondary = chats.to_vec();
            self
        }

        async fn forward(&mut self, message: InboundMessage) -> Result<()> {
            let bot: Option<&dyn SecondaryBot> = if self.with_bot {
                Some(self.bot.as_ref())
            } else {
                None
            };
            let mut ctx = ForwardContext {
                connection: self.connection.as_ref(),
                bot,
                selection: &self.selection,
                secondary_targets: &self.secondary,
                suffix: self.suffix.as_deref(),
                pacing: &self.pacing,
                mapping: &mut self.mapping,
            };
            Forwarder::for_message(message).forward(&mut ctx).await
        }

        async fn retract(&mut self, message: &InboundMessage) -> Retraction {
            let bot: Option<&dyn SecondaryBot> = if self.with_bot {
                Some(self.bot.as_ref())
            } else {
                None
            };
            retract(
                self.connection.as_ref(),
                bot,
                &self.pacing,
                &mut self.mapping,
                message,
            )
            .await
        }
    }

    #[test]
    fn test_dispatch_by_kind() {
        let mut m = text_message("m", "x");
        assert!(matches!(Forwarder::for_message(m.clone()), Forwarder::TextMedia(_)));
        m.kind = MessageKind::Location;
        assert!(matches!(Forwarder::for_message(m.clone()), Forwarder::Location(_)));
        m.kind = MessageKind::PollCreation;
        assert!(matches!(Forwarder::for_message(m.clone()), Forwarder::Poll(_)));
        m.kind = MessageKind::ContactCard;
        assert!(matches!(Forwarder::for_message(m.clone()), Forwarder::ContactCard(_)));
        m.kind = MessageKind::Standard("sticker".into());
        let f = Forwarder::for_message(m.clone());
        assert!(matches!(f, Forwarder::TextMedia(_)));
        assert_eq!(f.message(), &m);
    }

    #[test]
    fn test_contact_card_fields() {
        let card = "BEGIN:VCARD\nVERSION:3.0\nN:;Ada;;;\nFN:Ada Lovelace\nTEL;type=CELL;type=VOICE;type=Mobile;waid=447700900123:+44 7700 900123\nEND:VCARD";
        let (name, id) = contact_card_fields(card);
        assert_eq!(name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(id, None, "waid must directly follow type=Mobile");

        let card = "BEGIN:VCARD\nFN:Ada\nitem1.TEL;type=Mobile;waid=447700900123:+44\nEND:VCARD";
        let (name, id) = contact_card_fields(card);
        assert_eq!(name.as_deref(), Some("Ada"));
        assert_eq!(id.as_deref(), Some("447700900123"));
    }

    #[tokio::test]
    async fn test_text_two_targets_no_suffix_no_bot() {
        let mut h = Harness::new(&["a@g.us", "b@g.us"]);
        let message = text_message("m1", "hello");
        h.forward(message.clone()).await.unwrap();

        let sent = h.connection.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].1,
            Outgoing::Text {
                body: "hello".into(),
                link_preview: false
            }
        );
        assert_eq!(h.mapping.source_copies(&message.id).unwrap().len(), 2);
        assert!(h.mapping.secondary_copies(&message.id).is_none());
        assert_eq!(h.mapping.secondary_len(), 0);
    }

    #[tokio::test]
    async fn test_suffix_and_secondary_mirror() {
        let mut h = Harness::new(&["a@g.us"]).with_secondary(&[-100, 42]);
        h.suffix = Some("via relay".into());
        let message = text_message("m1", "hello");
        h.forward(message.clone()).await.unwrap();

        let expected = "hello\n\nvia relay".to_string();
        assert_eq!(
            h.connection.sent()[0].1,
            Outgoing::Text {
                body: expected.clone(),
                link_preview: false
            }
        );
        let mirrored = h.bot.sent();
        assert_eq!(mirrored.len(), 2);
        assert_eq!(mirrored[1], (42, SecondaryPayload::Text { text: expected }));
        let records = h.mapping.secondary_copies(&message.id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].chat_id, -100);
    }

    #[tokio::test]
    async fn test_failed_source_target_is_skipped() {
        let mut h = Harness::new(&["a@g.us", "down@g.us", "c@g.us"]);
        h.connection
            .failing_chats
            .lock()
            .unwrap()
            .insert("down@g.us".into());
        let message = text_message("m1", "hello");
        h.forward(message.clone()).await.unwrap();

        let copies = h.mapping.source_copies(&message.id).unwrap();
        let chats: Vec<&str> = copies.iter().map(|c| c.chat.as_str()).collect();
        assert_eq!(chats, vec!["a@g.us", "c@g.us"]);
    }

    #[tokio::test]
    async fn test_secondary_send_retried_once() {
        let mut h = Harness::new(&[]).with_secondary(&[7]);
        h.bot.failures.store(1, Ordering::SeqCst);
        h.forward(text_message("m1", "hi")).await.unwrap();
        assert_eq!(h.bot.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.bot.sent().len(), 1);

        h.bot.failures.store(2, Ordering::SeqCst);
        h.forward(text_message("m2", "hi")).await.unwrap();
        assert_eq!(h.bot.attempts.load(Ordering::SeqCst), 4);
        assert!(h.mapping.secondary_copies(&MessageId("m2".into())).is_none());
    }

    #[tokio::test]
    async fn test_pdf_not_mirrored_but_forwarded_on_source() {
        let mut h = Harness::new(&["a@g.us"]).with_secondary(&[7]);
        *h.connection.media.lock().unwrap() = Some(Media {
            mimetype: "application/pdf".into(),
            data: "JVBERi0=".into(),
            filename: Some("doc.pdf".into()),
        });
        let mut message = text_message("m1", "report");
        message.has_media = true;
        h.forward(message.clone()).await.unwrap();

        let sent = h.connection.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].1, Outgoing::Media { caption, .. } if caption == "report"));
        assert!(h.bot.sent().is_empty());
        assert!(h.mapping.secondary_copies(&message.id).is_none());
    }

    #[tokio::test]
    async fn test_image_mirrored_as_photo() {
        let mut h = Harness::new(&["a@g.us"]).with_secondary(&[7]);
        *h.connection.media.lock().unwrap() = Some(Media {
            mimetype: "image/jpeg".into(),
            data: "aGVsbG8=".into(),
            filename: None,
        });
        let mut message = text_message("m1", "look");
        message.has_media = true;
        h.forward(message).await.unwrap();

        assert_eq!(
            h.bot.sent(),
            vec![(
                7,
                SecondaryPayload::Photo {
                    data: b"hello".to_vec(),
                    caption: "look".into()
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_media_download_failure_is_an_error() {
        let mut h = Harness::new(&["a@g.us"]);
        let mut message = text_message("m1", "look");
        message.has_media = true;
        assert!(h.forward(message).await.is_err());
        assert!(h.connection.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reply_reference_attached_per_target() {
        let mut h = Harness::new(&["a@g.us", "b@g.us"]);
        let original = text_message("orig", "question");
        h.forward(original).await.unwrap();
        let copies = h.mapping.source_copies(&MessageId("orig".into())).unwrap().to_vec();

        let mut reply = text_message("reply", "answer");
        reply.quoted = Some(QuotedRef {
            id: MessageId("orig".into()),
            timestamp: 1,
        });
        h.forward(reply).await.unwrap();

        let sent = h.connection.sent();
        assert_eq!(sent[2].2.quoted_message_id, Some(copies[0].id.clone()));
        assert_eq!(sent[3].2.quoted_message_id, Some(copies[1].id.clone()));
    }

    #[tokio::test]
    async fn test_location_as_map_link() {
        let mut h = Harness::new(&["a@g.us"]).with_secondary(&[7]);
        let mut message = text_message("loc", "");
        message.kind = MessageKind::Location;
        message.location = Some(Location {
            latitude: 52.52,
            longitude: 13.405,
        });
        h.forward(message).await.unwrap();

        let link = "https://www.google.com/maps?q=52.52,13.405".to_string();
        assert!(matches!(&h.connection.sent()[0].1, Outgoing::Text { body, .. } if *body == link));
        assert_eq!(h.bot.sent(), vec![(7, SecondaryPayload::Text { text: link })]);
    }

    #[tokio::test]
    async fn test_location_missing_coordinates_skipped() {
        let mut h = Harness::new(&["a@g.us"]);
        let mut message = text_message("loc", "");
        message.kind = MessageKind::Location;
        h.forward(message).await.unwrap();
        assert!(h.connection.sent().is_empty());
    }

    #[tokio::test]
    async fn test_poll_defaults_to_single_answer() {
        let mut h = Harness::new(&["a@g.us"]).with_secondary(&[7]);
        let mut message = text_message("poll", "");
        message.kind = MessageKind::PollCreation;
        message.poll = Some(PollSpec {
            name: "Lunch?".into(),
            options: vec!["Pizza".into(), "Sushi".into()],
            allow_multiple_answers: None,
        });
        h.forward(message).await.unwrap();

        assert_eq!(
            h.connection.sent()[0].1,
            Outgoing::Poll {
                name: "Lunch?".into(),
                options: vec!["Pizza".into(), "Sushi".into()],
                allow_multiple_answers: false,
            }
        );
        assert_eq!(
            h.bot.sent()[0].1,
            SecondaryPayload::Poll {
                question: "Lunch?".into(),
                options: vec!["Pizza".into(), "Sushi".into()],
                allow_multiple_answers: false,
            }
        );
    }

    #[tokio::test]
    async fn test_contact_card_source_only() {
        let mut h = Harness::new(&["a@g.us", "b@g.us"]).with_secondary(&[7]);
        let mut message = text_message("card", "BEGIN:VCARD\nFN:Ada\nTEL;type=Mobile;waid=4915112345:+49\nEND:VCARD");
        message.kind = MessageKind::ContactCard;
        h.forward(message.clone()).await.unwrap();

        assert_eq!(
            *h.connection.contact_lookups.lock().unwrap(),
            vec!["4915112345@c.us".to_string()]
        );
        assert_eq!(h.connection.sent().len(), 2);
        assert!(h.bot.sent().is_empty());
        assert_eq!(h.mapping.source_copies(&message.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_contact_card_without_id_sends_nothing() {
        let mut h = Harness::new(&["a@g.us"]);
        let mut message = text_message("card", "BEGIN:VCARD\nFN:Ada\nEND:VCARD");
        message.kind = MessageKind::ContactCard;
        h.forward(message).await.unwrap();
        assert!(h.connection.sent().is_empty());
        assert!(h.connection.contact_lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retract_removes_all_copies() {
        let mut h = Harness::new(&["a@g.us", "b@g.us"]).with_secondary(&[7]);
        let message = text_message("m1", "oops");
        h.forward(message.clone()).await.unwrap();

        let result = h.retract(&message).await;
        assert_eq!(
            result,
            Retraction {
                source_deleted: 2,
                secondary_deleted: 1
            }
        );
        assert!(h.mapping.source_copies(&message.id).is_none());
        assert!(h.mapping.secondary_copies(&message.id).is_none());
        assert_eq!(h.bot.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retract_unknown_message_is_noop() {
        let mut h = Harness::new(&["a@g.us"]);
        let result = h.retract(&text_message("ghost", "")).await;
        assert_eq!(result, Retraction::default());
        assert!(h.connection.log().is_empty());
    }
}
