//! Instance-level OIDC settings and password-age policy.
//!
//! Lifetimes set here override the system defaults when greater than zero.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use keyward_core::{AggregateRef, DomainError, TenantId};
use keyward_events::{DomainEvent, EventQuery, StoredEvent, WriteModel, WriteModelState};

pub const AGGREGATE_TYPE: &str = "instance";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InstanceEvent {
    #[serde(rename = "instance.oidc.settings.added")]
    OidcSettingsAdded {
        access_token_lifetime_secs: i64,
        refresh_token_expiration_secs: i64,
        refresh_token_idle_expiration_secs: i64,
    },

    /// Only the changed values are present.
    #[serde(rename = "instance.oidc.settings.changed")]
    OidcSettingsChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token_lifetime_secs: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token_expiration_secs: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token_idle_expiration_secs: Option<i64>,
    },

    #[serde(rename = "instance.policy.password.age.added")]
    PasswordAgePolicyAdded { expire_warn_days: u64, max_age_days: u64 },

    /// Only the changed values are present.
    #[serde(rename = "instance.policy.password.age.changed")]
    PasswordAgePolicyChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expire_warn_days: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_age_days: Option<u64>,
    },
}

impl DomainEvent for InstanceEvent {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPES: &'static [&'static str] = &[
        "instance.oidc.settings.added",
        "instance.oidc.settings.changed",
        "instance.policy.password.age.added",
        "instance.policy.password.age.changed",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            InstanceEvent::OidcSettingsAdded { .. } => "instance.oidc.settings.added",
            InstanceEvent::OidcSettingsChanged { .. } => "instance.oidc.settings.changed",
            InstanceEvent::PasswordAgePolicyAdded { .. } => "instance.policy.password.age.added",
            InstanceEvent::PasswordAgePolicyChanged { .. } => "instance.policy.password.age.changed",
        }
    }
}

/// Every model of the instance aggregate reads all of its events, so the
/// sequence it expects on push is the aggregate's latest.
fn instance_query(base: &WriteModelState) -> Result<EventQuery, DomainError> {
    Ok(EventQuery::builder()
        .tenant(base.tenant_id)
        .add_query()
        .aggregate_types([AGGREGATE_TYPE])
        .aggregate_ids([base.aggregate_id.as_str()])
        .event_types(InstanceEvent::EVENT_TYPES.iter().copied())
        .build()?)
}

/// Token lifetimes; a zero duration means "not configured".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLifetimes {
    pub access_token: Duration,
    pub refresh_token: Duration,
    pub refresh_token_idle: Duration,
}

impl TokenLifetimes {
    /// Configured values win over `defaults` when greater than zero.
    pub fn resolve(&self, defaults: &TokenLifetimes) -> TokenLifetimes {
        let pick = |own: Duration, default: Duration| if own > Duration::zero() { own } else { default };
        TokenLifetimes {
            access_token: pick(self.access_token, defaults.access_token),
            refresh_token: pick(self.refresh_token, defaults.refresh_token),
            refresh_token_idle: pick(self.refresh_token_idle, defaults.refresh_token_idle),
        }
    }
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            access_token: Duration::zero(),
            refresh_token: Duration::zero(),
            refresh_token_idle: Duration::zero(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceOidcSettingsWriteModel {
    base: WriteModelState,
    pub configured: bool,
    pub lifetimes: TokenLifetimes,
}

impl InstanceOidcSettingsWriteModel {
    pub fn new(tenant_id: TenantId) -> Self {
        let instance_id = tenant_id.instance_id();
        let resource_owner = instance_id.to_string();
        Self {
            base: WriteModelState::new(tenant_id, instance_id, resource_owner),
            configured: false,
            lifetimes: TokenLifetimes::default(),
        }
    }

    pub fn aggregate(&self) -> AggregateRef {
        self.base.aggregate(AGGREGATE_TYPE)
    }

    /// Event moving the settings to `wanted`, or `None` if nothing changes.
    pub fn change_event(&self, wanted: &TokenLifetimes) -> Option<InstanceEvent> {
        if !self.configured {
            return Some(InstanceEvent::OidcSettingsAdded {
                access_token_lifetime_secs: wanted.access_token.num_seconds(),
                refresh_token_expiration_secs: wanted.refresh_token.num_seconds(),
                refresh_token_idle_expiration_secs: wanted.refresh_token_idle.num_seconds(),
            });
        }
        let diff = |current: Duration, wanted: Duration| (current != wanted).then(|| wanted.num_seconds());
        let access = diff(self.lifetimes.access_token, wanted.access_token);
        let refresh = diff(self.lifetimes.refresh_token, wanted.refresh_token);
        let idle = diff(self.lifetimes.refresh_token_idle, wanted.refresh_token_idle);
        if access.is_none() && refresh.is_none() && idle.is_none() {
            return None;
        }
        Some(InstanceEvent::OidcSettingsChanged {
            access_token_lifetime_secs: access,
            refresh_token_expiration_secs: refresh,
            refresh_token_idle_expiration_secs: idle,
        })
    }
}

impl WriteModel for InstanceOidcSettingsWriteModel {
    fn query(&self) -> Result<EventQuery, DomainError> {
        instance_query(&self.base)
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), DomainError> {
        match event.decode::<InstanceEvent>()? {
            InstanceEvent::OidcSettingsAdded {
                access_token_lifetime_secs,
                refresh_token_expiration_secs,
                refresh_token_idle_expiration_secs,
            } => {
                self.configured = true;
                self.lifetimes = TokenLifetimes {
                    access_token: Duration::seconds(access_token_lifetime_secs),
                    refresh_token: Duration::seconds(refresh_token_expiration_secs),
                    refresh_token_idle: Duration::seconds(refresh_token_idle_expiration_secs),
                };
            }
            InstanceEvent::OidcSettingsChanged {
                access_token_lifetime_secs,
                refresh_token_expiration_secs,
                refresh_token_idle_expiration_secs,
            } => {
                if let Some(secs) = access_token_lifetime_secs {
                    self.lifetimes.access_token = Duration::seconds(secs);
                }
                if let Some(secs) = refresh_token_expiration_secs {
                    self.lifetimes.refresh_token = Duration::seconds(secs);
                }
                if let Some(secs) = refresh_token_idle_expiration_secs {
                    self.lifetimes.refresh_token_idle = Duration::seconds(secs);
                }
            }
            InstanceEvent::PasswordAgePolicyAdded { .. } | InstanceEvent::PasswordAgePolicyChanged { .. } => {}
        }
        Ok(())
    }

    fn state(&self) -> &WriteModelState {
        &self.base
    }

    fn state_mut(&mut self) -> &mut WriteModelState {
        &mut self.base
    }
}

/// Password expiry rules. A `max_age_days` of zero disables expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PasswordAgePolicy {
    pub expire_warn_days: u64,
    pub max_age_days: u64,
}

impl PasswordAgePolicy {
    fn days(days: u64) -> Option<Duration> {
        i64::try_from(days).ok().and_then(Duration::try_days)
    }

    /// `None` when passwords never expire.
    pub fn expires_at(&self, changed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.max_age_days == 0 {
            return None;
        }
        Self::days(self.max_age_days).and_then(|age| changed_at.checked_add_signed(age))
    }

    pub fn is_expired(&self, changed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.expires_at(changed_at).is_some_and(|expiry| now >= expiry)
    }

    /// Whether `now` falls in the warning window before expiry.
    pub fn should_warn(&self, changed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.expires_at(changed_at) {
            Some(expiry) if self.expire_warn_days > 0 && now < expiry => Self::days(self.expire_warn_days)
                .and_then(|warn| expiry.checked_sub_signed(warn))
                .is_none_or(|start| now >= start),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePasswordAgePolicyWriteModel {
    base: WriteModelState,
    pub configured: bool,
    pub policy: PasswordAgePolicy,
}

impl InstancePasswordAgePolicyWriteModel {
    pub fn new(tenant_id: TenantId) -> Self {
        let instance_id = tenant_id.instance_id();
        let resource_owner = instance_id.to_string();
        Self {
            base: WriteModelState::new(tenant_id, instance_id, resource_owner),
            configured: false,
            policy: PasswordAgePolicy::default(),
        }
    }

    pub fn aggregate(&self) -> AggregateRef {
        self.base.aggregate(AGGREGATE_TYPE)
    }

    /// Event moving the policy to `wanted`, or `None` if nothing changes.
    pub fn change_event(&self, wanted: &PasswordAgePolicy) -> Option<InstanceEvent> {
        if !self.configured {
            return Some(InstanceEvent::PasswordAgePolicyAdded {
                expire_warn_days: wanted.expire_warn_days,
                max_age_days: wanted.max_age_days,
            });
        }
        let warn = (self.policy.expire_warn_days != wanted.expire_warn_days).then_some(wanted.expire_warn_days);
        let max_age = (self.policy.max_age_days != wanted.max_age_days).then_some(wanted.max_age_days);
        if warn.is_none() && max_age.is_none() {
            return None;
        }
        Some(InstanceEvent::PasswordAgePolicyChanged {
            expire_warn_days: warn,
            max_age_days: max_age,
        })
    }
}

impl WriteModel for InstancePasswordAgePolicyWriteModel {
    fn query(&self) -> Result<EventQuery, DomainError> {
        instance_query(&self.base)
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), DomainError> {
        match event.decode::<InstanceEvent>()? {
            InstanceEvent::PasswordAgePolicyAdded {
                expire_warn_days,
                max_age_days,
            } => {
                self.configured = true;
                self.policy = PasswordAgePolicy {
                    expire_warn_days,
                    max_age_days,
                };
            }
            InstanceEvent::PasswordAgePolicyChanged {
                expire_warn_days,
                max_age_days,
            } => {
                if let Some(days) = expire_warn_days {
                    self.policy.expire_warn_days = days;
                }
                if let Some(days) = max_age_days {
                    self.policy.max_age_days = days;
                }
            }
            InstanceEvent::OidcSettingsAdded { .. } | InstanceEvent::OidcSettingsChanged { .. } => {}
        }
        Ok(())
    }

    fn state(&self) -> &WriteModelState {
        &self.base
    }

    fn state_mut(&mut self) -> &mut WriteModelState {
        &mut self.base
    }
}
