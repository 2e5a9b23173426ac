use crate::model::{
    Attachment, AttachmentField, ChatAttachmentPayload, ConsumedEnvelope, FormattedMessage,
    KillmailEvent, Perspective, StructuralError,
};

pub const DEFAULT_KILLBOARD_URL: &str = "https://zkillboard.com";
pub const DEFAULT_IMAGE_SERVER_URL: &str = "https://images.evetech.net";

const THUMBNAIL_SIZE: u32 = 64;

/// Slack attachment colors.
const COLOR_GOOD: &str = "good";
const COLOR_DANGER: &str = "danger";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Type,
    Character,
    Corporation,
    Alliance,
}

/// Builds image URLs for game entities.
pub trait ImageLinkBuilder: Send + Sync {
    fn link(&self, id: u64, kind: ImageKind, size: u32) -> String;
}

/// Links against the public EVE image server.
#[derive(Debug, Clone)]
pub struct EveImageServer {
    base_url: String,
}

impl EveImageServer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for EveImageServer {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_SERVER_URL)
    }
}

impl ImageLinkBuilder for EveImageServer {
    fn link(&self, id: u64, kind: ImageKind, size: u32) -> String {
        let path = match kind {
            ImageKind::Type => format!("types/{id}/icon"),
            ImageKind::Character => format!("characters/{id}/portrait"),
            ImageKind::Corporation => format!("corporations/{id}/logo"),
            ImageKind::Alliance => format!("alliances/{id}/logo"),
        };
        format!("{}/{path}?size={size}", self.base_url)
    }
}

/// Turns killmail events into Slack attachment messages.
///
/// Formatting is deterministic: the same event and perspective always produce the
/// same payload.
#[derive(Debug, Clone)]
pub struct KillmailTransformer<I = EveImageServer> {
    images: I,
    killboard_url: String,
}

impl Default for KillmailTransformer {
    fn default() -> Self {
        Self::new(EveImageServer::default(), DEFAULT_KILLBOARD_URL)
    }
}

impl<I: ImageLinkBuilder> KillmailTransformer<I> {
    pub fn new(images: I, killboard_url: impl Into<String>) -> Self {
        Self {
            images,
            killboard_url: killboard_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Wraps the formatted payload together with the envelope's webhook.
    ///
    /// # Errors
    /// Propagates [`StructuralError`] from [`Self::format`].
    pub fn transform(
        &self,
        envelope: &ConsumedEnvelope,
    ) -> Result<FormattedMessage, StructuralError> {
        let message = self.format(&envelope.zkb_data, envelope.perspective())?;
        Ok(FormattedMessage {
            webhook: envelope.webhook.clone(),
            message,
        })
    }

    /// # Errors
    /// Returns [`StructuralError::NoAttackers`] when the killmail lists no attackers.
    pub fn format(
        &self,
        event: &KillmailEvent,
        perspective: Perspective,
    ) -> Result<ChatAttachmentPayload, StructuralError> {
        let killmail = &event.killmail;
        let attacker = event.primary_attacker()?;

        let victim = killmail.victim.identity();
        let victim_corp = &killmail.victim.corporation.name;
        let killer = attacker.identity();
        let killer_corp = attacker.affiliation();

        let (title, color) = match perspective {
            Perspective::Kill => (
                format!(
                    "{} ({}) killed {} ({})",
                    killer.display_name(),
                    killer_corp.display_name(),
                    victim.display_name(),
                    victim_corp
                ),
                COLOR_GOOD,
            ),
            Perspective::Loss => (
                format!(
                    "{} ({}) got killed by {} ({})",
                    victim.display_name(),
                    victim_corp,
                    killer.display_name(),
                    killer_corp.display_name()
                ),
                COLOR_DANGER,
            ),
        };

        let system = &killmail.solar_system;
        let fields = vec![
            AttachmentField::short("Damage taken", group_thousands(killmail.victim.damage_taken)),
            AttachmentField::short("Pilots involved", killmail.attacker_count),
            AttachmentField::short("Value", format_isk(event.zkb.total_value)),
            AttachmentField::short("Ship", killmail.victim.ship_type.name.as_str()),
            AttachmentField::short(
                "Location",
                format!("<{}/system/{}/|{}>", self.killboard_url, system.id, system.name),
            ),
        ];

        Ok(ChatAttachmentPayload {
            attachments: vec![Attachment {
                fallback: title.clone(),
                title,
                title_link: format!("{}/kill/{}/", self.killboard_url, event.kill_id),
                color: color.to_string(),
                thumb_url: self.images.link(
                    killmail.victim.ship_type.id,
                    ImageKind::Type,
                    THUMBNAIL_SIZE,
                ),
                fields,
            }],
        })
    }
}

/// `1234567` -> `"1,234,567"`.
pub fn group_thousands(n: u64) -> String {
    insert_separators(&n.to_string())
}

/// `1234567.5` -> `"1,234,567.50 ISK"`.
pub fn format_isk(value: f64) -> String {
    if !value.is_finite() {
        return format!("{value} ISK");
    }
    let fixed = format!("{:.2}", value.abs());
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let sign = if value.is_sign_negative() && fixed != "0.00" {
        "-"
    } else {
        ""
    };
    format!("{sign}{}.{fraction} ISK", insert_separators(whole))
}

fn insert_separators(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
