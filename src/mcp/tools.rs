//! The tool registry and the customer-service tool catalog.
//!
//! Each tool declares its parameters as a JSON Schema (draft 2020-12),
//! compiled once when the tool is registered.

use jsonschema::Validator;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{CustomerStatus, CustomerUpdate, Priority, Store};

/// Tool handler. Runs synchronously against the store on a blocking thread.
pub type ToolHandler = Arc<dyn Fn(&Store, &Value) -> Result<Value> + Send + Sync>;

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u64 = 100;

#[derive(Clone)]
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    validator: Arc<Validator>,
    handler: ToolHandler,
}

impl ToolDef {
    /// Check arguments against the input schema.
    ///
    /// On failure returns one `{path, message}` entry per violation.
    pub fn validate(&self, params: &Value) -> std::result::Result<(), Vec<Value>> {
        let violations: Vec<Value> = self
            .validator
            .iter_errors(params)
            .map(|e| json!({"path": e.instance_path().to_string(), "message": e.to_string()}))
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    pub fn invoke(&self, store: &Store, params: &Value) -> Result<Value> {
        (self.handler)(store, params)
    }

    /// Listing entry for `tools/list`.
    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

/// Fixed method name → tool map, listed in name order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Fails when `input_schema` is not a valid JSON Schema.
    pub fn register<F>(
        &mut self,
        name: &'static str,
        description: &'static str,
        input_schema: Value,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&Store, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        let validator = jsonschema::draft202012::new(&input_schema)
            .map_err(|e| Error::Config(format!("invalid input schema for '{}': {}", name, e)))?;
        self.tools.insert(
            name,
            ToolDef {
                name,
                description,
                input_schema,
                validator: Arc::new(validator),
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDef> {
        self.tools.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDef> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The customer-service catalog.
    pub fn catalog(premium_min_tickets: u32) -> Result<Self> {
        let mut registry = Self::new();

        registry.register(
            "get_customer",
            "Get customer information by ID",
            object(json!({"customer_id": customer_id_param()}), &["customer_id"]),
            |store, params| to_value(store.get_customer(arg_i64(params, "customer_id")?)?),
        )?;

        registry.register(
            "list_customers",
            "List customers with optional status filter",
            object(
                json!({
                    "status": {
                        "type": "string",
                        "enum": ["active", "disabled"],
                        "description": "Filter by 'active' or 'disabled'"
                    },
                    "limit": limit_param()
                }),
                &[],
            ),
            |store, params| {
                let status = opt_str(params, "status")
                    .map(|s| s.parse::<CustomerStatus>())
                    .transpose()?;
                to_value(store.list_customers(status, limit(params))?)
            },
        )?;

        registry.register(
            "update_customer",
            "Update customer name, email, phone or status",
            object(
                json!({
                    "customer_id": customer_id_param(),
                    "fields": {
                        "type": "object",
                        "description": "Fields to change: name, email, phone, status",
                        "properties": {
                            "name": {"type": "string", "minLength": 1},
                            "email": {"type": ["string", "null"]},
                            "phone": {"type": ["string", "null"]},
                            "status": {"type": "string", "enum": ["active", "disabled"]}
                        },
                        "additionalProperties": false
                    }
                }),
                &["customer_id", "fields"],
            ),
            |store, params| {
                let update = CustomerUpdate::from_fields(&params["fields"])?;
                to_value(store.update_customer(arg_i64(params, "customer_id")?, &update)?)
            },
        )?;

        registry.register(
            "create_ticket",
            "Create a new support ticket for a customer",
            object(
                json!({
                    "customer_id": customer_id_param(),
                    "issue": {"type": "string", "description": "Description of the issue"},
                    "priority": {
                        "type": "string",
                        "enum": ["low", "medium", "high"],
                        "description": "Ticket priority (default medium)"
                    }
                }),
                &["customer_id", "issue"],
            ),
            |store, params| {
                let priority = opt_str(params, "priority")
                    .map(|s| s.parse::<Priority>())
                    .transpose()?
                    .unwrap_or(Priority::Medium);
                let issue = opt_str(params, "issue").unwrap_or_default();
                to_value(store.create_ticket(arg_i64(params, "customer_id")?, issue, priority)?)
            },
        )?;

        registry.register(
            "get_customer_history",
            "Get all support tickets of a customer, newest first",
            object(json!({"customer_id": customer_id_param()}), &["customer_id"]),
            |store, params| to_value(store.get_customer_history(arg_i64(params, "customer_id")?)?),
        )?;

        registry.register(
            "get_customers_with_open_tickets",
            "List customers holding open or in-progress tickets",
            object(json!({}), &[]),
            |store, _| to_value(store.get_customers_with_open_tickets()?),
        )?;

        registry.register(
            "get_premium_customers",
            "List active customers with a sustained ticket history",
            object(json!({}), &[]),
            move |store, _| to_value(store.get_premium_customers(premium_min_tickets)?),
        )?;

        registry.register(
            "search_customers",
            "Search customers by name or email",
            object(
                json!({
                    "query": {
                        "type": "string",
                        "description": "Search term matched against name or email"
                    },
                    "limit": limit_param()
                }),
                &["query"],
            ),
            |store, params| {
                let query = opt_str(params, "query").unwrap_or_default();
                to_value(store.search_customers(query, limit(params))?)
            },
        )?;

        registry.register(
            "get_open_tickets",
            "List open tickets, highest priority first",
            object(json!({"limit": limit_param()}), &[]),
            |store, params| to_value(store.get_open_tickets(limit(params))?),
        )?;

        Ok(registry)
    }
}

/// A closed object schema over `properties`.
fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

fn customer_id_param() -> Value {
    json!({
        "type": "integer",
        "minimum": 1,
        "description": "The customer's unique identifier"
    })
}

fn limit_param() -> Value {
    json!({
        "type": "integer",
        "minimum": 1,
        "maximum": MAX_LIMIT,
        "description": "Maximum number of results (default 10)"
    })
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn arg_i64(params: &Value, name: &str) -> Result<i64> {
    params
        .get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Validation(format!("missing integer parameter '{}'", name)))
}

fn opt_str<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params.get(name).and_then(Value::as_str)
}

fn limit(params: &Value) -> u32 {
    params
        .get("limit")
        .and_then(Value::as_u64)
        .map(|n| n.min(MAX_LIMIT) as u32)
        .unwrap_or(DEFAULT_LIMIT)
}
