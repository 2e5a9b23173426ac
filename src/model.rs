use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder shown when neither a pilot nor a hull (or corporation nor faction)
/// can be resolved for an attacker.
pub const UNKNOWN: &str = "Unknown";

/// A killmail record that is well-formed JSON but cannot be rendered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructuralError {
    #[error("killmail {kill_id} has no attackers")]
    NoAttackers { kill_id: u64 },
}

/// Message body consumed from the formatter queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumedEnvelope {
    pub zkb_data: KillmailEvent,
    pub kill: bool,
    pub webhook: String,
}

impl ConsumedEnvelope {
    pub fn perspective(&self) -> Perspective {
        Perspective::from(self.kill)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KillmailEvent {
    #[serde(rename = "killID")]
    pub kill_id: u64,
    pub killmail: Killmail,
    pub zkb: ZkbMeta,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Killmail {
    pub victim: Victim,
    #[serde(default)]
    pub attackers: Vec<Attacker>,
    pub solar_system: SolarSystem,
    pub attacker_count: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Victim {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<Named>,
    pub corporation: Named,
    pub ship_type: ShipType,
    pub damage_taken: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attacker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<Named>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_type: Option<Named>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corporation: Option<Named>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction: Option<Named>,
}

/// Any entity reference where only the display name matters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Named {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShipType {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SolarSystem {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZkbMeta {
    pub total_value: f64,
}

/// Who is shown as the victim or killer of a kill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Pilot(String),
    Hull(String),
    Unknown,
}

impl Identity {
    pub fn display_name(&self) -> &str {
        match self {
            Identity::Pilot(name) | Identity::Hull(name) => name,
            Identity::Unknown => UNKNOWN,
        }
    }
}

/// The group a killer is credited to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affiliation {
    Corporation(String),
    Faction(String),
    Unknown,
}

impl Affiliation {
    pub fn display_name(&self) -> &str {
        match self {
            Affiliation::Corporation(name) | Affiliation::Faction(name) => name,
            Affiliation::Unknown => UNKNOWN,
        }
    }
}

impl Victim {
    /// Victims always resolve: a pilot name when present, the hull otherwise.
    pub fn identity(&self) -> Identity {
        match &self.character {
            Some(character) => Identity::Pilot(character.name.clone()),
            None => Identity::Hull(self.ship_type.name.clone()),
        }
    }
}

impl Attacker {
    pub fn identity(&self) -> Identity {
        if let Some(character) = &self.character {
            Identity::Pilot(character.name.clone())
        } else if let Some(ship_type) = &self.ship_type {
            Identity::Hull(ship_type.name.clone())
        } else {
            Identity::Unknown
        }
    }

    pub fn affiliation(&self) -> Affiliation {
        if let Some(corporation) = &self.corporation {
            Affiliation::Corporation(corporation.name.clone())
        } else if let Some(faction) = &self.faction {
            Affiliation::Faction(faction.name.clone())
        } else {
            Affiliation::Unknown
        }
    }
}

impl KillmailEvent {
    /// The first attacker in the list is the one credited on the message.
    ///
    /// # Errors
    /// Returns [`StructuralError::NoAttackers`] when the attacker list is empty.
    pub fn primary_attacker(&self) -> Result<&Attacker, StructuralError> {
        self.killmail
            .attackers
            .first()
            .ok_or(StructuralError::NoAttackers {
                kill_id: self.kill_id,
            })
    }
}

/// Whether the subscriber sees this kill as one of theirs or as a loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Kill,
    Loss,
}

impl From<bool> for Perspective {
    fn from(kill: bool) -> Self {
        if kill {
            Perspective::Kill
        } else {
            Perspective::Loss
        }
    }
}

/// Message published for the webhook sender.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FormattedMessage {
    pub webhook: String,
    pub message: ChatAttachmentPayload,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatAttachmentPayload {
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Attachment {
    pub title: String,
    pub fallback: String,
    pub title_link: String,
    pub color: String,
    pub thumb_url: String,
    pub fields: Vec<AttachmentField>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AttachmentField {
    pub title: String,
    pub value: FieldValue,
    pub short: bool,
}

impl AttachmentField {
    pub fn short(title: &str, value: impl Into<FieldValue>) -> Self {
        Self {
            title: title.to_string(),
            value: value.into(),
            short: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Count(u64),
    Text(String),
}

impl From<u64> for FieldValue {
    fn from(count: u64) -> Self {
        FieldValue::Count(count)
    }
}

impl From<String> for FieldValue {
    fn from(text: String) -> Self {
        FieldValue::Text(text)
    }
}

impl From<&str> for FieldValue {
    fn from(text: &str) -> Self {
        FieldValue::Text(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope_json() -> serde_json::Value {
        json!({
            "zkb_data": {
                "killID": 58_112_391,
                "killmail": {
                    "victim": {
                        "character": { "id": 90_000_001, "name": "Alice" },
                        "corporation": { "id": 98_000_001, "name": "Victim Corp" },
                        "shipType": { "id": 587, "name": "Rifter" },
                        "damageTaken": 1_234_567
                    },
                    "attackers": [
                        {
                            "character": { "name": "Bob" },
                            "corporation": { "name": "Killer Corp" },
                            "shipType": { "name": "Thrasher" }
                        }
                    ],
                    "solarSystem": { "id": 30_002_187, "name": "Amarr" },
                    "attackerCount": 3,
                    "killTime": "2017.01.01 12:00:00"
                },
                "zkb": { "totalValue": 1_234_567.5, "points": 10 }
            },
            "kill": true,
            "webhook": "https://hooks.slack.com/services/T000/B000/XXXX"
        })
    }

    #[test]
    fn envelope_deserializes_and_ignores_extra_fields() {
        let envelope: ConsumedEnvelope = serde_json::from_value(envelope_json()).unwrap();

        assert_eq!(envelope.zkb_data.kill_id, 58_112_391);
        assert_eq!(envelope.perspective(), Perspective::Kill);
        assert_eq!(envelope.zkb_data.killmail.victim.damage_taken, 1_234_567);
        assert_eq!(envelope.zkb_data.killmail.attacker_count, 3);
        assert_eq!(envelope.zkb_data.killmail.solar_system.name, "Amarr");
    }

    #[test]
    fn missing_victim_ship_type_is_a_decode_error() {
        let mut value = envelope_json();
        value["zkb_data"]["killmail"]["victim"]
            .as_object_mut()
            .unwrap()
            .remove("shipType");

        let err = serde_json::from_value::<ConsumedEnvelope>(value).unwrap_err();
        assert!(err.to_string().contains("shipType"));
    }

    #[test]
    fn missing_webhook_is_a_decode_error() {
        let mut value = envelope_json();
        value.as_object_mut().unwrap().remove("webhook");

        assert!(serde_json::from_value::<ConsumedEnvelope>(value).is_err());
    }

    #[test]
    fn victim_prefers_pilot_over_hull() {
        let envelope: ConsumedEnvelope = serde_json::from_value(envelope_json()).unwrap();
        let mut victim = envelope.zkb_data.killmail.victim;
        assert_eq!(victim.identity(), Identity::Pilot("Alice".into()));

        victim.character = None;
        assert_eq!(victim.identity(), Identity::Hull("Rifter".into()));
        assert_eq!(victim.identity().display_name(), "Rifter");
    }

    #[test]
    fn attacker_identity_falls_back_to_hull_then_unknown() {
        let hull_only = Attacker {
            ship_type: Some(Named {
                name: "Sansha's Tyrant".into(),
            }),
            ..Attacker::default()
        };
        assert_eq!(hull_only.identity(), Identity::Hull("Sansha's Tyrant".into()));

        let nothing = Attacker::default();
        assert_eq!(nothing.identity(), Identity::Unknown);
        assert_eq!(nothing.identity().display_name(), "Unknown");
    }

    #[test]
    fn attacker_affiliation_falls_back_to_faction_then_unknown() {
        let faction_only = Attacker {
            faction: Some(Named {
                name: "Sansha's Nation".into(),
            }),
            ..Attacker::default()
        };
        assert_eq!(
            faction_only.affiliation(),
            Affiliation::Faction("Sansha's Nation".into())
        );

        let both = Attacker {
            corporation: Some(Named {
                name: "Killer Corp".into(),
            }),
            ..faction_only
        };
        assert_eq!(both.affiliation().display_name(), "Killer Corp");

        assert_eq!(Attacker::default().affiliation(), Affiliation::Unknown);
    }

    #[test]
    fn empty_attackers_is_structural_error() {
        let mut value = envelope_json();
        value["zkb_data"]["killmail"]["attackers"] = json!([]);
        let envelope: ConsumedEnvelope = serde_json::from_value(value).unwrap();

        assert_eq!(
            envelope.zkb_data.primary_attacker().unwrap_err(),
            StructuralError::NoAttackers {
                kill_id: 58_112_391
            }
        );
    }

    #[test]
    fn pilots_involved_serializes_as_number() {
        let field = AttachmentField::short("Pilots involved", 7u64);
        assert_eq!(
            serde_json::to_value(field).unwrap(),
            json!({ "title": "Pilots involved", "value": 7, "short": true })
        );
    }
}
