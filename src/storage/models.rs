//! Customer and ticket records.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Closed string enumerations stored as TEXT columns.
macro_rules! text_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Validation(format!(
                        "{} must be one of {}, got '{}'",
                        $what,
                        [$($text),+].join(", "),
                        other
                    ))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum!(CustomerStatus, "status", {
    Active => "active",
    Disabled => "disabled",
});

text_enum!(TicketStatus, "status", {
    Open => "open",
    InProgress => "in_progress",
    Resolved => "resolved",
});

text_enum!(Priority, "priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

impl TicketStatus {
    /// Open and in-progress tickets both count as unresolved.
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, TicketStatus::Resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: CustomerStatus,
    /// RFC 3339
    pub created_at: String,
    /// RFC 3339, advanced on every successful mutation
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub customer_id: i64,
    pub issue: String,
    pub status: TicketStatus,
    pub priority: Priority,
    pub created_at: String,
}

/// An open ticket joined with its customer's contact details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTicket {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub customer_name: String,
    pub customer_email: Option<String>,
}

/// A partial customer update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomerUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CustomerStatus>,
}

impl CustomerUpdate {
    /// Parse a JSON object of fields, rejecting unknown fields and enum violations.
    pub fn from_fields(fields: &Value) -> Result<Self> {
        if !fields.is_object() {
            return Err(Error::Validation("fields must be an object".to_string()));
        }
        let update: CustomerUpdate = serde_json::from_value(fields.clone())
            .map_err(|e| Error::Validation(format!("invalid customer fields: {}", e)))?;

        if update.is_empty() {
            return Err(Error::Validation(
                "No fields to update. Provide at least one of: name, email, phone, status"
                    .to_string(),
            ));
        }
        if matches!(update.name.as_deref(), Some(n) if n.trim().is_empty()) {
            return Err(Error::Validation("name must not be empty".to_string()));
        }
        Ok(update)
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none() && self.status.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_parsing() {
        assert_eq!("in_progress".parse::<TicketStatus>().unwrap(), TicketStatus::InProgress);
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);

        let err = "urgent".parse::<Priority>().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("low, medium, high"));
    }

    #[test]
    fn test_update_from_fields() {
        let update = CustomerUpdate::from_fields(&json!({"email": "new@email.com"})).unwrap();
        assert_eq!(update.email.as_deref(), Some("new@email.com"));
        assert!(update.name.is_none());
    }

    #[test]
    fn test_update_rejects_unknown_field() {
        let err = CustomerUpdate::from_fields(&json!({"tier": "gold"})).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_update_rejects_bad_status() {
        assert!(CustomerUpdate::from_fields(&json!({"status": "banned"})).is_err());
        assert!(CustomerUpdate::from_fields(&json!({"status": "disabled"})).is_ok());
    }

    #[test]
    fn test_update_rejects_empty() {
        assert!(CustomerUpdate::from_fields(&json!({})).is_err());
        assert!(CustomerUpdate::from_fields(&json!("email")).is_err());
    }

    #[test]
    fn test_open_ticket_flattens() {
        let open = OpenTicket {
            ticket: Ticket {
                id: 1,
                customer_id: 5,
                issue: "Email notifications not being received".into(),
                status: TicketStatus::Open,
                priority: Priority::Medium,
                created_at: "2026-01-01T00:00:00.000Z".into(),
            },
            customer_name: "Test User 5".into(),
            customer_email: None,
        };
        let value = serde_json::to_value(&open).unwrap();
        assert_eq!(value["customer_id"], 5);
        assert_eq!(value["customer_name"], "Test User 5");
    }
}
