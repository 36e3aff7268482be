use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Privilege tier a user holds on one account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving a caller against an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Admin,
    Viewer,
    Denied,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// ISO 4217 code, display only. The engine never converts currencies.
    pub currency: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Subject identifier handed out by the identity provider.
    pub external_id: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Membership {
    pub id: String,
    pub account_id: String,
    pub user_id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One cost-sharing occasion. `income` and `saving` are amounts in the
/// account currency's smallest unit; per-payee shares are derived from the
/// attached payments, never stored.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Event {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub description: Option<String>,
    pub income: i64,
    pub saving: i64,
    pub delivery: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A party entitled to a share. Linking to a membership is optional, a payee
/// does not have to be a platform user.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Payee {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub membership_id: Option<String>,
}

/// One payee's stake in one event: `factor` counts weighted shares, `extra`
/// is a fixed add-on in the smallest currency unit.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Payment {
    pub id: String,
    pub account_id: String,
    pub event_id: String,
    pub payee_id: String,
    pub factor: i64,
    pub extra: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
