//! Query classification: free text → one or more (intent, entities) pairs.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Intent reported when no rule matches.
pub const UNCLASSIFIED: &str = "unclassified";

/// Words that ask for a customer record outright.
const LOOKUP_TERMS: &[&str] = &["information", "info", "details", "profile", "who is"];

/// Values pulled out of the query text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_term: Option<String>,
}

/// One sub-intent of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    pub entities: Entities,
    /// The clause this sub-intent was read from
    pub text: String,
}

/// Turns query text into sub-intents. More than one result means a
/// multi-intent query.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Vec<Classification>>;
}

/// Deterministic keyword classifier.
pub struct KeywordClassifier {
    clause_split: Regex,
    customer_id: Regex,
    email: Regex,
    phone: Regex,
    name: Regex,
    search: Regex,
}

impl KeywordClassifier {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::Config(format!("classifier pattern: {}", e)))
        };
        Ok(Self {
            clause_split: compile(r"(?i)\s*;\s*|,?\s+and\s+(?:also\s+|then\s+)?")?,
            customer_id: compile(
                r"(?i)\b(?:customer|id|account|user)\b(?:\s+(?:id|number|no\.?))?\s*[:#]?\s*(\d+)|#(\d+)",
            )?,
            email: compile(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")?,
            phone: compile(r"\+?\d[\d().\s-]{6,}\d")?,
            name: compile(r"\b(?i:named|name to|name is)\s+([A-Z][\w'-]*(?:\s+[A-Z][\w'-]*)*)")?,
            search: compile(r#"(?i)\b(?:search(?:\s+for)?|matching|containing|find)\s+(?:customers?\s+)?["']?([^\s"',?!]+)"#)?,
        })
    }

    fn extract(&self, text: &str) -> Entities {
        let lower = text.to_lowercase();

        let customer_id = self.customer_id.captures(text).and_then(|cap| {
            cap.get(1)
                .or_else(|| cap.get(2))
                .and_then(|m| m.as_str().parse().ok())
        });

        let email = self.email.find(text).map(|m| m.as_str().to_string());

        let phone = if has_any(&lower, &["phone", "number", "mobile"]) {
            self.phone.find(text).map(|m| m.as_str().trim().to_string())
        } else {
            None
        };

        let name = self
            .name
            .captures(text)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().to_string());

        let status = if has_word(&lower, "disabled") || has_word(&lower, "inactive") {
            Some("disabled".to_string())
        } else if has_word(&lower, "active") {
            Some("active".to_string())
        } else {
            None
        };

        let search_term = name.clone().or_else(|| email.clone()).or_else(|| {
            self.search
                .captures(text)
                .and_then(|cap| cap.get(1))
                .map(|m| m.as_str().to_string())
        });

        Entities {
            customer_id,
            email,
            phone,
            name,
            status,
            search_term,
        }
    }

    fn infer_intent(&self, text: &str, entities: &Entities) -> &'static str {
        let m = text.to_lowercase();
        let updating = has_any(&m, &["update", "change", "set ", "replace", "new "]);

        if m.contains("open ticket") && has_any(&m, &["customers", "who has", "who have", "which"]) {
            return "open_ticket_customers";
        }
        if has_any(&m, &["upgrad", "downgrad", "change my plan", "subscription"]) {
            return "upgrade_request";
        }
        if has_any(&m, &["history", "past tickets", "previous tickets", "my tickets", "all tickets"]) {
            return "history_lookup";
        }
        if has_any(
            &m,
            &[
                "help", "issue", "problem", "refund", "charged", "not working", "broken",
                "complaint", "ticket", "urgent", "support", "error", "fail",
            ],
        ) {
            return "support_request";
        }
        if updating && (entities.email.is_some() || m.contains("email")) {
            return "update_email";
        }
        if updating && (entities.phone.is_some() || m.contains("phone")) {
            return "update_phone";
        }
        if updating && (entities.name.is_some() || has_any(&m, &["my name", "status"])) {
            return "update_customer";
        }
        if m.contains("premium") {
            return "premium_customers";
        }
        if has_any(&m, &["search", "find", "matching", "named"]) {
            return "search_customers";
        }
        if has_any(&m, &["list", "all customers", "show customers", "active customers", "disabled customers"]) {
            return "list_customers";
        }
        if has_any(&m, &["overview", "everything about", "full profile", "summary"]) {
            return "account_overview";
        }
        if entities.customer_id.is_some() || m.contains("account") || has_any(&m, LOOKUP_TERMS) {
            return "account_lookup";
        }
        UNCLASSIFIED
    }

    fn classify_clause(&self, clause: &str) -> Classification {
        let entities = self.extract(clause);
        let intent = self.infer_intent(clause, &entities);
        Classification {
            intent: intent.to_string(),
            entities,
            text: clause.to_string(),
        }
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Vec<Classification>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let clauses: Vec<&str> = self
            .clause_split
            .split(text)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();

        // Only treat the query as multi-intent when every clause stands on its
        // own. A clause that merely identifies the customer ("I'm customer 5")
        // is context, not an intent.
        if clauses.len() > 1 {
            let whole = self.extract(text);
            let mut parts: Vec<Classification> = clauses
                .iter()
                .map(|c| self.classify_clause(c))
                .filter(|p| !is_identity_only(p))
                .collect();
            if parts.len() > 1 && parts.iter().all(|p| p.intent != UNCLASSIFIED) {
                for part in &mut parts {
                    if part.entities.customer_id.is_none() {
                        part.entities.customer_id = whole.customer_id;
                    }
                }
                tracing::debug!("Classified {} sub-intents", parts.len());
                return Ok(parts);
            }
        }

        Ok(vec![self.classify_clause(text)])
    }
}

fn is_identity_only(part: &Classification) -> bool {
    part.intent == "account_lookup" && !has_any(&part.text.to_lowercase(), LOOKUP_TERMS)
}

fn has_any(message: &str, terms: &[&str]) -> bool {
    terms.iter().any(|term| message.contains(term))
}

fn has_word(message: &str, word: &str) -> bool {
    message
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}
