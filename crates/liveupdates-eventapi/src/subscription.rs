//! Subscription topics and their Subscribe/Unsubscribe wire encoding.
//!
//! A [`Subscription`] names one topic on the EventAPI: a
//! [`SubscriptionType`] plus a [`Condition`] selecting the object it applies
//! to. Two subscriptions are equal iff both parts are equal, which is what
//! lets a connection deduplicate joins.

use std::fmt;

use serde::Serialize;
use serde_json::json;

use crate::message::Opcode;

/// Kind of event a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionType {
    /// `emote_set.update`: emotes added, renamed or removed in a set.
    UpdateEmoteSet,
    /// `user.update`: a user's connections (and their active emote set) changed.
    UpdateUser,
    /// `emote_set.create`.
    CreateEmoteSet,
    /// `cosmetic.create`: badge/paint definitions in a channel.
    CreateCosmetic,
    /// `entitlement.create`: a cosmetic was granted to a user.
    CreateEntitlement,
    /// `entitlement.delete`: a cosmetic was revoked from a user.
    DeleteEntitlement,
    /// `entitlement.reset`.
    ResetEntitlement,
    /// Unknown type. Encodes as an empty name.
    Invalid,
}

impl SubscriptionType {
    const NAMED: [SubscriptionType; 7] = [
        Self::UpdateEmoteSet,
        Self::UpdateUser,
        Self::CreateEmoteSet,
        Self::CreateCosmetic,
        Self::CreateEntitlement,
        Self::DeleteEntitlement,
        Self::ResetEntitlement,
    ];

    /// Wire name of this type.
    pub fn name(self) -> &'static str {
        match self {
            Self::UpdateEmoteSet => "emote_set.update",
            Self::UpdateUser => "user.update",
            Self::CreateEmoteSet => "emote_set.create",
            Self::CreateCosmetic => "cosmetic.create",
            Self::CreateEntitlement => "entitlement.create",
            Self::DeleteEntitlement => "entitlement.delete",
            Self::ResetEntitlement => "entitlement.reset",
            Self::Invalid => "",
        }
    }

    /// Case-sensitive lookup by wire name. Unknown names map to [`Self::Invalid`].
    pub fn from_name(name: &str) -> Self {
        Self::NAMED
            .into_iter()
            .find(|ty| ty.name() == name)
            .unwrap_or(Self::Invalid)
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Object selector of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    /// A 7TV object (emote set, user) by id.
    ObjectId(String),
    /// Everything happening in a Twitch channel, by Twitch user id.
    Channel(String),
}

#[derive(Serialize)]
#[serde(untagged)]
enum ConditionBody<'a> {
    ObjectId {
        object_id: &'a str,
    },
    Channel {
        ctx: &'static str,
        platform: &'static str,
        id: &'a str,
    },
}

impl Condition {
    fn body(&self) -> ConditionBody<'_> {
        match self {
            Self::ObjectId(id) => ConditionBody::ObjectId { object_id: id },
            Self::Channel(id) => ConditionBody::Channel {
                ctx: "channel",
                platform: "TWITCH",
                id,
            },
        }
    }

    /// Decode a condition object as sent back in Ack/Error frames.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use crate::json::JsonExt;

        let object_id = value.str_or_empty("object_id");
        if !object_id.is_empty() {
            return Some(Self::ObjectId(object_id.to_string()));
        }
        if value.str_or_empty("ctx") == "channel" {
            let id = value.str_or_empty("id");
            if !id.is_empty() {
                return Some(Self::Channel(id.to_string()));
            }
        }
        None
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectId(id) => write!(f, "object_id={id}"),
            Self::Channel(id) => write!(f, "channel={id}"),
        }
    }
}

/// One EventAPI topic. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    ty: SubscriptionType,
    condition: Condition,
}

impl Subscription {
    /// Build a subscription from its parts.
    pub fn new(ty: SubscriptionType, condition: Condition) -> Self {
        Self { ty, condition }
    }

    /// Subscription on a 7TV object id.
    pub fn object(ty: SubscriptionType, object_id: impl Into<String>) -> Self {
        Self::new(ty, Condition::ObjectId(object_id.into()))
    }

    /// Subscription on a Twitch channel.
    pub fn channel(ty: SubscriptionType, twitch_id: impl Into<String>) -> Self {
        Self::new(ty, Condition::Channel(twitch_id.into()))
    }

    pub fn ty(&self) -> SubscriptionType {
        self.ty
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    /// Encode the Subscribe frame for this topic.
    pub fn encode_subscribe(&self) -> String {
        self.encode(Opcode::Subscribe)
    }

    /// Encode the Unsubscribe frame for this topic.
    pub fn encode_unsubscribe(&self) -> String {
        self.encode(Opcode::Unsubscribe)
    }

    fn encode(&self, op: Opcode) -> String {
        json!({
            "op": op.code(),
            "d": {
                "type": self.ty.name(),
                "condition": self.condition.body(),
            },
        })
        .to_string()
    }

    /// Decode a `{type, condition}` object, as found in request frames and
    /// in the `data` of Ack/Error replies.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use crate::json::JsonExt;

        let ty = SubscriptionType::from_name(value.str_or_empty("type"));
        let condition = Condition::from_json(value.field("condition"))?;
        Some(Self::new(ty, condition))
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.ty, self.condition)
    }
}
