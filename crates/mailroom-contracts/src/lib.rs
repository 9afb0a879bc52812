use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire code for an email activity (`TYPE_ID`).
pub const EMAIL_ACTIVITY_TYPE: i64 = 4;

/// Title given to a lead created from an email with no subject.
pub const DEFAULT_LEAD_TITLE: &str = "Untitled project";

/// `SOURCE_ID` stamped on every lead this service creates.
pub const LEAD_SOURCE_EMAIL: &str = "EMAIL";

/// The two entity kinds an email activity can be routed onto.
///
/// The remote CRM speaks raw owner-type codes (1 = lead, 2 = deal); those
/// codes exist only at the gateway boundary, everything else passes this
/// enum around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Lead,
    Deal,
}

impl EntityKind {
    pub fn owner_code(self) -> i64 {
        match self {
            EntityKind::Lead => 1,
            EntityKind::Deal => 2,
        }
    }

    pub fn from_owner_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(EntityKind::Lead),
            2 => Some(EntityKind::Deal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Lead => "lead",
            EntityKind::Deal => "deal",
        }
    }
}

/// A CRM email activity as the remote system returns it.
///
/// The CRM serializes ids and numeric codes as either JSON numbers or
/// strings depending on the endpoint; both forms are accepted and
/// normalized to `i64`. Unknown fields are ignored — the remote owns this
/// shape, not us.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Activity {
    #[serde(deserialize_with = "wire::id")]
    pub id: i64,
    #[serde(default, deserialize_with = "wire::opt_id")]
    pub owner_type_id: Option<i64>,
    #[serde(default, deserialize_with = "wire::opt_id")]
    pub owner_id: Option<i64>,
    #[serde(default, deserialize_with = "wire::opt_id")]
    pub type_id: Option<i64>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_id")]
    pub description_type: Option<i64>,
    /// Nested settings blob; `EMAIL_META.from` carries the sender mailbox.
    #[serde(default)]
    pub settings: Option<Value>,
    #[serde(default)]
    pub completed: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_id")]
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "wire::opt_id")]
    pub direction: Option<i64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_id")]
    pub author_id: Option<i64>,
    #[serde(default, deserialize_with = "wire::opt_id")]
    pub responsible_id: Option<i64>,
}

impl Activity {
    /// The entity kind this activity is currently bound to, if any.
    pub fn owner_kind(&self) -> Option<EntityKind> {
        self.owner_type_id.and_then(EntityKind::from_owner_code)
    }

    /// An activity already owned by the target must not be re-migrated.
    pub fn is_bound_to(&self, kind: EntityKind, entity_id: i64) -> bool {
        self.owner_kind() == Some(kind) && self.owner_id == Some(entity_id)
    }

    /// Raw sender mailbox from `SETTINGS.EMAIL_META.from`, e.g.
    /// `"Jane Doe <jane@example.com>"`.
    pub fn email_from(&self) -> Option<&str> {
        self.settings
            .as_ref()?
            .get("EMAIL_META")?
            .get("from")?
            .as_str()
    }
}

/// Fields for `crm.activity.add`, built by the migrator when cloning.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct NewActivity {
    pub owner_type_id: i64,
    pub owner_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_id: Option<i64>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_type: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    pub communications: Vec<Communication>,
    pub created: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<i64>,
    pub completed: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responsible_id: Option<i64>,
    pub sanitize_on_view: i64,
}

/// One entry of a new activity's communications list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Communication {
    pub value: String,
    pub value_type: String,
    pub entity_type_id: i64,
}

impl Communication {
    pub fn work_email(address: String) -> Self {
        Self {
            value: address,
            value_type: "WORK".to_string(),
            entity_type_id: 1,
        }
    }
}

/// A lead or deal listing row. Leads and deals are structurally identical
/// for subject matching — an id and a free-text title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EntityRef {
    #[serde(deserialize_with = "wire::id")]
    pub id: i64,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Contact {
    #[serde(deserialize_with = "wire::id")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Some CRM endpoints return the email as a multi-field structure
    /// rather than a plain string; anything non-string reads as `None`.
    #[serde(default, deserialize_with = "wire::opt_loose_string")]
    pub email: Option<String>,
}

/// The webhook body the CRM posts when an activity is recorded. Only the
/// triggering activity id and the application token are consumed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookTrigger {
    #[serde(default)]
    pub data: Option<TriggerData>,
    #[serde(default)]
    pub auth: Option<TriggerAuth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerData {
    #[serde(default, rename = "FIELDS")]
    pub fields: Option<TriggerFields>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerFields {
    #[serde(default, rename = "ID", deserialize_with = "wire::opt_id")]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerAuth {
    #[serde(default)]
    pub application_token: Option<String>,
}

impl WebhookTrigger {
    pub fn activity_id(&self) -> Option<i64> {
        self.data
            .as_ref()?
            .fields
            .as_ref()?
            .id
            .filter(|id| *id > 0)
    }

    pub fn application_token(&self) -> Option<&str> {
        self.auth.as_ref()?.application_token.as_deref()
    }
}

/// Definite outcome of one routing invocation, returned to the webhook
/// caller and logged. Every invocation ends in exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    Done {
        target_kind: EntityKind,
        target_id: i64,
        /// `None` when the activity was already bound and nothing moved.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_activity_id: Option<i64>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
    Busy,
}

mod wire {
    //! The CRM serializes ids as `123` or `"123"` depending on the
    //! endpoint; normalize both to `i64`.

    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Num(i64),
        Str(String),
    }

    fn normalize<E: Error>(repr: IdRepr) -> Result<i64, E> {
        match repr {
            IdRepr::Num(n) => Ok(n),
            IdRepr::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid id: {s:?}"))),
        }
    }

    pub fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        normalize(IdRepr::deserialize(deserializer)?)
    }

    pub fn opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        match Option::<IdRepr>::deserialize(deserializer)? {
            Some(repr) => normalize(repr).map(Some),
            None => Ok(None),
        }
    }

    pub fn opt_loose_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => Ok(Some(s)),
            _ => Ok(None),
        }
    }
}
