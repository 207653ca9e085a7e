use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Premium,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Premium => "premium",
            Role::Admin => "admin",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub credits: i64,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub referred_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            name: None,
            credits: 0,
            role: Role::User,
            email_verified: false,
            referred_by: None,
            created_at: Utc::now(),
        }
    }

    /// Role after a billing event asked for `requested`. Admins keep their role.
    pub fn resolve_role(&self, requested: Role) -> Role {
        if self.role == Role::Admin {
            Role::Admin
        } else {
            requested
        }
    }
}

/// A single credit/role mutation, applied atomically by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreditGrant {
    pub credits: i64,
    pub role: Option<Role>,
}

impl CreditGrant {
    pub fn credits(credits: i64) -> Self {
        Self {
            credits,
            role: None,
        }
    }

    pub fn role(role: Role) -> Self {
        Self {
            credits: 0,
            role: Some(role),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Subscription,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub amount_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    #[serde(default)]
    pub credits: i64,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub package_id: Option<String>,
    #[serde(default)]
    pub billing_period: Option<String>,
    pub stripe_event_id: String,
    #[serde(default)]
    pub stripe_object_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Transaction fields supplied by the caller; id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub kind: TransactionKind,
    pub amount_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub credits: i64,
    pub plan_id: Option<String>,
    pub package_id: Option<String>,
    pub billing_period: Option<String>,
    pub stripe_event_id: String,
    pub stripe_object_id: Option<String>,
}

impl NewTransaction {
    pub fn into_transaction(self) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            kind: self.kind,
            amount_cents: self.amount_cents,
            currency: self.currency,
            status: self.status,
            credits: self.credits,
            plan_id: self.plan_id,
            package_id: self.package_id,
            billing_period: self.billing_period,
            stripe_event_id: self.stripe_event_id,
            stripe_object_id: self.stripe_object_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Referral {
    pub user_id: Uuid,
    pub code: String,
    #[serde(default)]
    pub clicks: i64,
    #[serde(default)]
    pub signups: i64,
    #[serde(default)]
    pub conversions: i64,
    #[serde(default)]
    pub commission_cents: i64,
    pub updated_at: DateTime<Utc>,
}

/// Commission paid to a referrer, as a percentage of the converted payment.
pub const REFERRAL_COMMISSION_PERCENT: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferralAction {
    Click,
    Signup,
    Conversion { amount_cents: i64 },
}

impl ReferralAction {
    pub fn name(&self) -> &'static str {
        match self {
            ReferralAction::Click => "click",
            ReferralAction::Signup => "signup",
            ReferralAction::Conversion { .. } => "conversion",
        }
    }

    pub fn amount_cents(&self) -> i64 {
        match self {
            ReferralAction::Conversion { amount_cents } => *amount_cents,
            _ => 0,
        }
    }
}

impl Referral {
    pub fn apply(&mut self, action: ReferralAction) {
        match action {
            ReferralAction::Click => self.clicks += 1,
            ReferralAction::Signup => self.signups += 1,
            ReferralAction::Conversion { amount_cents } => {
                self.conversions += 1;
                self.commission_cents += amount_cents.max(0) * REFERRAL_COMMISSION_PERCENT / 100;
            }
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn referral() -> Referral {
        Referral {
            user_id: Uuid::new_v4(),
            code: "ABCD1234".into(),
            clicks: 0,
            signups: 0,
            conversions: 0,
            commission_cents: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn referral_counters_and_commission() {
        let mut r = referral();
        r.apply(ReferralAction::Click);
        r.apply(ReferralAction::Click);
        r.apply(ReferralAction::Signup);
        r.apply(ReferralAction::Conversion { amount_cents: 4900 });
        assert_eq!(r.clicks, 2);
        assert_eq!(r.signups, 1);
        assert_eq!(r.conversions, 1);
        assert_eq!(r.commission_cents, 980);
    }

    #[test]
    fn admin_role_is_sticky() {
        let mut user = User::new("boss@pixelift.ai");
        user.role = Role::Admin;
        assert_eq!(user.resolve_role(Role::User), Role::Admin);
        let plain = User::new("someone@pixelift.ai");
        assert_eq!(plain.resolve_role(Role::Premium), Role::Premium);
    }

    #[test]
    fn transaction_serializes_type_field() {
        let tx = NewTransaction {
            user_id: Uuid::new_v4(),
            kind: TransactionKind::Purchase,
            amount_cents: 4900,
            currency: "usd".into(),
            status: TransactionStatus::Completed,
            credits: 500,
            plan_id: None,
            package_id: Some("credits_500".into()),
            billing_period: None,
            stripe_event_id: "evt_1".into(),
            stripe_object_id: None,
        }
        .into_transaction();
        let value = serde_json::to_value(&tx).expect("serialize");
        assert_eq!(value["type"], "purchase");
        assert_eq!(value["status"], "completed");
        assert!(value.get("plan_id").is_none());
    }
}
