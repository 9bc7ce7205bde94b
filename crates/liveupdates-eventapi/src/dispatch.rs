//! Typed dispatch records decoded from Dispatch frames.
//!
//! Decoding never fails: fields are read with the lenient accessors from
//! [`crate::json`], so a malformed payload produces a record with empty
//! fields. Callers must check `validate()` before acting on a record.

use serde_json::{Map, Value};

use crate::json::JsonExt;
use crate::subscription::SubscriptionType;

/// Base record of every Dispatch frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Topic type the event belongs to.
    pub ty: SubscriptionType,
    /// Event body (empty object if absent).
    pub body: Value,
    /// Id of the changed object (`body.id`).
    pub id: String,
    /// Display name of the user who made the change. Empty for system changes.
    pub actor_name: String,
}

impl From<&Value> for Dispatch {
    fn from(data: &Value) -> Self {
        let body = Value::Object(data.object_or_empty("body").clone());
        let id = body.str_or_empty("id").to_string();
        let actor_name = body.field("actor").str_or_empty("display_name").to_string();
        Self {
            ty: SubscriptionType::from_name(data.str_or_empty("type")),
            body,
            id,
            actor_name,
        }
    }
}

/// An emote was added to an emote set.
#[derive(Debug, Clone, PartialEq)]
pub struct EmoteAddDispatch {
    pub emote_set_id: String,
    pub actor_name: String,
    pub emote_id: String,
    /// The active-emote object as sent by the server.
    pub emote_json: Map<String, Value>,
}

impl EmoteAddDispatch {
    pub fn new(dispatch: &Dispatch, emote: &Map<String, Value>) -> Self {
        Self {
            emote_set_id: dispatch.id.clone(),
            actor_name: dispatch.actor_name.clone(),
            emote_id: emote.str_or_empty("id").to_string(),
            emote_json: emote.clone(),
        }
    }

    pub fn validate(&self) -> bool {
        if self.emote_set_id.is_empty() || self.emote_json.is_empty() {
            return false;
        }
        let emote = &self.emote_json;
        if !(emote.has("id") && emote.has("name") && emote.has("data")) {
            return false;
        }
        let data = emote.object_or_empty("data");
        data.has("name") && data.has("host") && data.has("owner")
    }
}

/// An emote was removed from an emote set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteRemoveDispatch {
    pub emote_set_id: String,
    pub actor_name: String,
    pub emote_name: String,
    pub emote_id: String,
}

impl EmoteRemoveDispatch {
    pub fn new(dispatch: &Dispatch, old_emote: &Map<String, Value>) -> Self {
        Self {
            emote_set_id: dispatch.id.clone(),
            actor_name: dispatch.actor_name.clone(),
            emote_name: old_emote.str_or_empty("name").to_string(),
            emote_id: old_emote.str_or_empty("id").to_string(),
        }
    }

    pub fn validate(&self) -> bool {
        !self.emote_set_id.is_empty() && !self.emote_name.is_empty() && !self.emote_id.is_empty()
    }
}

/// An emote in a set was renamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteUpdateDispatch {
    pub emote_set_id: String,
    pub actor_name: String,
    pub emote_id: String,
    pub old_emote_name: String,
    pub emote_name: String,
}

impl EmoteUpdateDispatch {
    pub fn new(dispatch: &Dispatch, old_value: &Map<String, Value>, value: &Map<String, Value>) -> Self {
        Self {
            emote_set_id: dispatch.id.clone(),
            actor_name: dispatch.actor_name.clone(),
            emote_id: value.str_or_empty("id").to_string(),
            old_emote_name: old_value.str_or_empty("name").to_string(),
            emote_name: value.str_or_empty("name").to_string(),
        }
    }

    /// A rename to the same name is a no-op and is rejected.
    pub fn validate(&self) -> bool {
        !self.emote_set_id.is_empty()
            && !self.emote_id.is_empty()
            && !self.old_emote_name.is_empty()
            && !self.emote_name.is_empty()
            && self.old_emote_name != self.emote_name
    }
}

/// The emote set linked to one of a user's platform connections changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConnectionUpdateDispatch {
    pub user_id: String,
    pub actor_name: String,
    pub old_emote_set_id: String,
    pub emote_set_id: String,
    /// Index of the changed connection in the user's connection list.
    pub connection_index: usize,
}

impl UserConnectionUpdateDispatch {
    pub fn new(dispatch: &Dispatch, update: &Map<String, Value>, connection_index: usize) -> Self {
        Self {
            user_id: dispatch.id.clone(),
            actor_name: dispatch.actor_name.clone(),
            old_emote_set_id: update.field("old_value").str_or_empty("id").to_string(),
            emote_set_id: update.field("value").str_or_empty("id").to_string(),
            connection_index,
        }
    }

    pub fn validate(&self) -> bool {
        !self.user_id.is_empty() && !self.old_emote_set_id.is_empty() && !self.emote_set_id.is_empty()
    }
}

/// Kind of cosmetic referenced by cosmetic and entitlement dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CosmeticKind {
    Badge,
    Paint,
    Avatar,
    Invalid,
}

impl CosmeticKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "BADGE" => Self::Badge,
            "PAINT" => Self::Paint,
            "AVATAR" => Self::Avatar,
            _ => Self::Invalid,
        }
    }
}

/// A cosmetic (badge, paint) was defined.
#[derive(Debug, Clone, PartialEq)]
pub struct CosmeticCreateDispatch {
    pub kind: CosmeticKind,
    /// Cosmetic definition, passed through untouched.
    pub data: Map<String, Value>,
}

impl From<&Dispatch> for CosmeticCreateDispatch {
    fn from(dispatch: &Dispatch) -> Self {
        let object = dispatch.body.field("object");
        Self {
            kind: CosmeticKind::from_name(object.str_or_empty("kind")),
            data: object.object_or_empty("data").clone(),
        }
    }
}

impl CosmeticCreateDispatch {
    pub fn validate(&self) -> bool {
        !self.data.is_empty() && self.kind != CosmeticKind::Invalid
    }
}

/// A cosmetic was granted to or revoked from a Twitch user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementCreateDeleteDispatch {
    /// Id of the cosmetic.
    pub ref_id: String,
    pub kind: CosmeticKind,
    /// Twitch id of the user.
    pub user_id: String,
    /// Twitch login of the user.
    pub user_name: String,
}

impl From<&Dispatch> for EntitlementCreateDeleteDispatch {
    fn from(dispatch: &Dispatch) -> Self {
        let object = dispatch.body.field("object");
        let twitch = object
            .field("user")
            .array_or_empty("connections")
            .iter()
            .find(|c| c.str_or_empty("platform") == "TWITCH");

        Self {
            ref_id: object.str_or_empty("ref_id").to_string(),
            kind: CosmeticKind::from_name(object.str_or_empty("kind")),
            user_id: twitch.map(|c| c.str_or_empty("id").to_string()).unwrap_or_default(),
            user_name: twitch
                .map(|c| c.str_or_empty("username").to_string())
                .unwrap_or_default(),
        }
    }
}

impl EntitlementCreateDeleteDispatch {
    pub fn validate(&self) -> bool {
        !self.user_id.is_empty()
            && !self.user_name.is_empty()
            && !self.ref_id.is_empty()
            && self.kind != CosmeticKind::Invalid
    }
}

/// A decoded, validated event ready for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    EmoteAdded(EmoteAddDispatch),
    EmoteUpdated(EmoteUpdateDispatch),
    EmoteRemoved(EmoteRemoveDispatch),
    UserUpdated(UserConnectionUpdateDispatch),
    CosmeticCreated(CosmeticCreateDispatch),
    EntitlementCreated(EntitlementCreateDeleteDispatch),
    EntitlementDeleted(EntitlementCreateDeleteDispatch),
}

/// Result of expanding one Dispatch into events.
#[derive(Debug, Default)]
pub struct Decoded {
    /// Records that passed validation, in body order.
    pub events: Vec<Event>,
    /// Records that were built but failed validation.
    pub dropped: usize,
}

impl Decoded {
    fn push(&mut self, valid: bool, event: Event) {
        if valid {
            self.events.push(event);
        } else {
            tracing::debug!(?event, "Dropping invalid dispatch");
            self.dropped += 1;
        }
    }
}

/// Expand a dispatch into its validated events.
///
/// `emote_set.update` bodies carry `pushed`, `updated` and `pulled` change
/// lists; only entries keyed `emotes` are considered. `user.update` bodies
/// carry `updated` entries keyed `connections` whose `value` list holds
/// `emote_set` changes.
pub fn decode_events(dispatch: &Dispatch) -> Decoded {
    let mut out = Decoded::default();

    match dispatch.ty {
        SubscriptionType::UpdateEmoteSet => {
            for pushed in changes(dispatch, "pushed", "emotes") {
                let added = EmoteAddDispatch::new(dispatch, pushed.object_or_empty("value"));
                out.push(added.validate(), Event::EmoteAdded(added));
            }
            for updated in changes(dispatch, "updated", "emotes") {
                let update = EmoteUpdateDispatch::new(
                    dispatch,
                    updated.object_or_empty("old_value"),
                    updated.object_or_empty("value"),
                );
                out.push(update.validate(), Event::EmoteUpdated(update));
            }
            for pulled in changes(dispatch, "pulled", "emotes") {
                let removed = EmoteRemoveDispatch::new(dispatch, pulled.object_or_empty("old_value"));
                out.push(removed.validate(), Event::EmoteRemoved(removed));
            }
        }
        SubscriptionType::UpdateUser => {
            for updated in changes(dispatch, "updated", "connections") {
                let index = usize::try_from(updated.i64_or_zero("index")).unwrap_or_default();
                for value in updated.array_or_empty("value") {
                    if value.str_or_empty("key") != "emote_set" {
                        continue;
                    }
                    let update = UserConnectionUpdateDispatch::new(
                        dispatch,
                        value.as_object().unwrap_or(&Map::new()),
                        index,
                    );
                    out.push(update.validate(), Event::UserUpdated(update));
                }
            }
        }
        SubscriptionType::CreateCosmetic => {
            let cosmetic = CosmeticCreateDispatch::from(dispatch);
            out.push(cosmetic.validate(), Event::CosmeticCreated(cosmetic));
        }
        SubscriptionType::CreateEntitlement => {
            let entitlement = EntitlementCreateDeleteDispatch::from(dispatch);
            out.push(entitlement.validate(), Event::EntitlementCreated(entitlement));
        }
        SubscriptionType::DeleteEntitlement => {
            let entitlement = EntitlementCreateDeleteDispatch::from(dispatch);
            out.push(entitlement.validate(), Event::EntitlementDeleted(entitlement));
        }
        SubscriptionType::ResetEntitlement | SubscriptionType::CreateEmoteSet => {
            tracing::trace!(ty = %dispatch.ty, "Ignoring unhandled dispatch type");
        }
        SubscriptionType::Invalid => {
            tracing::debug!(body = %dispatch.body, "Unknown dispatch type");
        }
    }

    out
}

fn changes<'a>(dispatch: &'a Dispatch, list: &str, key: &'a str) -> impl Iterator<Item = &'a Value> {
    dispatch
        .body
        .array_or_empty(list)
        .iter()
        .filter(move |entry| entry.str_or_empty("key") == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatch(ty: &str, body: Value) -> Dispatch {
        Dispatch::from(&json!({ "type": ty, "body": body }))
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn emote_set(id: &str) -> Dispatch {
        dispatch("emote_set.update", json!({"id": id, "actor": {"display_name": "nerixyz"}}))
    }

    #[test]
    fn test_base_dispatch_fields() {
        let d = emote_set("set1");
        assert_eq!(d.ty, SubscriptionType::UpdateEmoteSet);
        assert_eq!(d.id, "set1");
        assert_eq!(d.actor_name, "nerixyz");
    }

    #[test]
    fn test_missing_actor_is_empty() {
        let d = dispatch("user.update", json!({"id": "u"}));
        assert_eq!(d.actor_name, "");
        assert_eq!(d.id, "u");
    }

    #[test]
    fn test_unknown_type_is_invalid() {
        let d = dispatch("emote.update", json!({}));
        assert_eq!(d.ty, SubscriptionType::Invalid);
        assert!(decode_events(&d).events.is_empty());
    }

    #[test]
    fn test_emote_update_same_name_is_invalid() {
        let d = emote_set("set");
        let same = EmoteUpdateDispatch::new(
            &d,
            &obj(json!({"id": "e", "name": "X"})),
            &obj(json!({"id": "e", "name": "X"})),
        );
        assert!(!same.validate());

        let renamed = EmoteUpdateDispatch::new(
            &d,
            &obj(json!({"id": "e", "name": "X"})),
            &obj(json!({"id": "e", "name": "Y"})),
        );
        assert!(renamed.validate());
    }

    #[test]
    fn test_emote_add_requires_nested_data() {
        let d = emote_set("set");
        let full = json!({
            "id": "621d13967cc2d4e1953838ed",
            "name": "Chatterino",
            "data": {"name": "Chatterino", "host": {"url": "//cdn"}, "owner": null},
        });
        assert!(EmoteAddDispatch::new(&d, &obj(full)).validate());

        let no_host = json!({"id": "e", "name": "n", "data": {"name": "n", "owner": {}}});
        assert!(!EmoteAddDispatch::new(&d, &obj(no_host)).validate());

        let no_data = json!({"id": "e", "name": "n"});
        assert!(!EmoteAddDispatch::new(&d, &obj(no_data)).validate());

        let no_set = emote_set("");
        let emote = json!({"id": "e", "name": "n", "data": {"name": "n", "host": {}, "owner": {}}});
        assert!(!EmoteAddDispatch::new(&no_set, &obj(emote)).validate());
    }

    #[test]
    fn test_emote_remove_requires_all_fields() {
        let d = emote_set("set");
        assert!(EmoteRemoveDispatch::new(&d, &obj(json!({"id": "e", "name": "n"}))).validate());
        assert!(!EmoteRemoveDispatch::new(&d, &obj(json!({"id": "e"}))).validate());
        assert!(!EmoteRemoveDispatch::new(&d, &obj(json!({"name": "n"}))).validate());
    }

    #[test]
    fn test_user_connection_update_fields() {
        let d = dispatch("user.update", json!({"id": "user1"}));
        let update = UserConnectionUpdateDispatch::new(
            &d,
            &obj(json!({"key": "emote_set", "old_value": {"id": "old"}, "value": {"id": "new"}})),
            2,
        );
        assert!(update.validate());
        assert_eq!(update.old_emote_set_id, "old");
        assert_eq!(update.emote_set_id, "new");
        assert_eq!(update.connection_index, 2);

        let missing_old =
            UserConnectionUpdateDispatch::new(&d, &obj(json!({"value": {"id": "new"}})), 0);
        assert!(!missing_old.validate());
    }

    #[test]
    fn test_emote_set_body_fan_out() {
        let emote = json!({"id": "a", "name": "A", "data": {"name": "A", "host": {}, "owner": {}}});
        let d = dispatch(
            "emote_set.update",
            json!({
                "id": "set",
                "pushed": [
                    {"key": "emotes", "index": 0, "value": emote},
                    {"key": "name", "value": "ignored"},
                ],
                "updated": [
                    {"key": "emotes", "old_value": {"id": "b", "name": "B"}, "value": {"id": "b", "name": "B2"}},
                    {"key": "emotes", "old_value": {"id": "c", "name": "C"}, "value": {"id": "c", "name": "C"}},
                ],
                "pulled": [
                    {"key": "emotes", "old_value": {"id": "d", "name": "D"}},
                ],
            }),
        );

        let decoded = decode_events(&d);
        assert_eq!(decoded.dropped, 1, "no-op rename is dropped");
        assert_eq!(decoded.events.len(), 3);
        assert!(matches!(&decoded.events[0], Event::EmoteAdded(e) if e.emote_id == "a"));
        assert!(matches!(&decoded.events[1], Event::EmoteUpdated(e) if e.emote_name == "B2"));
        assert!(matches!(&decoded.events[2], Event::EmoteRemoved(e) if e.emote_name == "D"));
    }

    #[test]
    fn test_user_body_fan_out() {
        let d = dispatch(
            "user.update",
            json!({
                "id": "user",
                "actor": {"display_name": "mod"},
                "updated": [{
                    "key": "connections",
                    "index": 1,
                    "value": [
                        {"key": "emote_set", "old_value": {"id": "s1"}, "value": {"id": "s2"}},
                        {"key": "emote_capacity", "old_value": 300, "value": 600},
                    ],
                }],
            }),
        );

        let decoded = decode_events(&d);
        assert_eq!(decoded.events.len(), 1);
        match &decoded.events[0] {
            Event::UserUpdated(u) => {
                assert_eq!(u.user_id, "user");
                assert_eq!(u.actor_name, "mod");
                assert_eq!(u.emote_set_id, "s2");
                assert_eq!(u.connection_index, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_cosmetic_create() {
        let d = dispatch(
            "cosmetic.create",
            json!({"object": {"kind": "BADGE", "data": {"id": "badge1", "name": "Admin"}}}),
        );
        let cosmetic = CosmeticCreateDispatch::from(&d);
        assert!(cosmetic.validate());
        assert_eq!(cosmetic.kind, CosmeticKind::Badge);

        let unknown = dispatch("cosmetic.create", json!({"object": {"kind": "HAT", "data": {"id": "x"}}}));
        assert!(!CosmeticCreateDispatch::from(&unknown).validate());
    }

    #[test]
    fn test_entitlement_uses_twitch_connection() {
        let d = dispatch(
            "entitlement.create",
            json!({"object": {
                "ref_id": "badge1",
                "kind": "BADGE",
                "user": {"connections": [
                    {"platform": "YOUTUBE", "id": "yt", "username": "ytname"},
                    {"platform": "TWITCH", "id": "123", "username": "forsen"},
                ]},
            }}),
        );
        let entitlement = EntitlementCreateDeleteDispatch::from(&d);
        assert!(entitlement.validate());
        assert_eq!(entitlement.user_id, "123");
        assert_eq!(entitlement.user_name, "forsen");

        let decoded = decode_events(&d);
        assert!(matches!(decoded.events[0], Event::EntitlementCreated(_)));
    }

    #[test]
    fn test_entitlement_without_twitch_is_invalid() {
        let d = dispatch(
            "entitlement.delete",
            json!({"object": {"ref_id": "b", "kind": "BADGE", "user": {"connections": []}}}),
        );
        let decoded = decode_events(&d);
        assert!(decoded.events.is_empty());
        assert_eq!(decoded.dropped, 1);
    }
}
