//! Capabilities of the wrapped server, captured once at startup.
//!
//! In session transport the gateway answers `initialize` and the list
//! methods itself. It learns what to answer by starting one template
//! child, listing everything it advertises and shutting it down again.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use super::client::ChildClient;
use super::protocol::{MCP_PROTOCOL_VERSION, SERVER_NAME};
use crate::error::GatewayError;
use crate::process::Launcher;

/// Upper bound on pages fetched per list method.
const MAX_LIST_PAGES: usize = 100;

/// Listable capability kinds, with their list method and result field.
const LISTABLE: [(&str, &str, &str); 3] = [
    ("tools", "tools/list", "tools"),
    ("resources", "resources/list", "resources"),
    ("prompts", "prompts/list", "prompts"),
];

/// What the wrapped server offers. Descriptors are kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilitySet {
    /// Protocol version the child negotiated.
    pub protocol_version: String,
    /// The child's `serverInfo`.
    pub server_info: Value,
    /// The child's `capabilities` object.
    pub capabilities: Value,
    /// Optional usage instructions from the child.
    pub instructions: Option<String>,
    /// Tool descriptors.
    pub tools: Vec<Value>,
    /// Resource descriptors.
    pub resources: Vec<Value>,
    /// Prompt descriptors.
    pub prompts: Vec<Value>,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            server_info: default_server_info(),
            capabilities: json!({}),
            instructions: None,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
        }
    }
}

fn default_server_info() -> Value {
    json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

impl CapabilitySet {
    /// Starts a template child, records its capabilities and closes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be started, initialized or
    /// listed.
    pub async fn introspect(launcher: &Launcher, timeout: Duration) -> Result<Self, GatewayError> {
        info!(command = %launcher.command(), "Introspecting wrapped server");
        let client = ChildClient::connect(launcher, timeout).await?;
        let result = Self::from_client(&client).await;
        client.close().await;

        if let Ok(set) = &result {
            info!(
                tools = set.tools.len(),
                resources = set.resources.len(),
                prompts = set.prompts.len(),
                "Captured server capabilities"
            );
        }
        result
    }

    async fn from_client(client: &ChildClient) -> Result<Self, GatewayError> {
        let mut set = Self::from_initialize_result(client.initialize_result());

        for (capability, method, field) in LISTABLE {
            if !set.has_capability(capability) {
                debug!(capability, "Capability not advertised, skipping");
                continue;
            }
            let items = list_all(client, method, field).await?;
            match capability {
                "tools" => set.tools = items,
                "resources" => set.resources = items,
                _ => set.prompts = items,
            }
        }

        Ok(set)
    }

    /// Builds a set from an `initialize` result, with empty lists.
    #[must_use]
    pub fn from_initialize_result(result: &Value) -> Self {
        Self {
            protocol_version: result
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(MCP_PROTOCOL_VERSION)
                .to_string(),
            server_info: result
                .get("serverInfo")
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or_else(default_server_info),
            capabilities: result
                .get("capabilities")
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or_else(|| json!({})),
            instructions: result
                .get("instructions")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..Self::default()
        }
    }

    /// Returns `true` if the child advertised `name` (e.g. `"tools"`).
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).is_some_and(|v| !v.is_null())
    }

    /// The result to return for a client's `initialize`.
    #[must_use]
    pub fn initialize_result(&self) -> Value {
        let mut result = json!({
            "protocolVersion": self.protocol_version,
            "capabilities": self.capabilities,
            "serverInfo": self.server_info,
        });
        if let Some(instructions) = &self.instructions {
            result["instructions"] = json!(instructions);
        }
        result
    }

    /// The result for a list method, or `None` if the method is not a list
    /// method or the capability was not advertised.
    #[must_use]
    pub fn list_result(&self, method: &str) -> Option<Value> {
        let (capability, _, field) = LISTABLE.iter().find(|(_, m, _)| *m == method)?;
        if !self.has_capability(capability) {
            return None;
        }
        let items = match *field {
            "tools" => &self.tools,
            "resources" => &self.resources,
            _ => &self.prompts,
        };
        Some(json!({ *field: items }))
    }
}

/// Fetches every page of a list method.
async fn list_all(
    client: &ChildClient,
    method: &str,
    field: &str,
) -> Result<Vec<Value>, GatewayError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let mut page = client.request(method, params).await?;

        if let Some(Value::Array(batch)) = page.get_mut(field).map(Value::take) {
            items.extend(batch);
        }

        cursor = page
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(str::to_string);
        if cursor.is_none() {
            return Ok(items);
        }
    }

    Err(GatewayError::Protocol(format!(
        "{method} returned more than {MAX_LIST_PAGES} pages"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_result_round_trip() {
        let set = CapabilitySet::from_initialize_result(&json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "everything", "version": "0.6.2"},
            "instructions": "Be nice",
        }));

        assert_eq!(set.protocol_version, "2025-03-26");
        assert!(set.has_capability("tools"));
        assert!(!set.has_capability("prompts"));

        let result = set.initialize_result();
        assert_eq!(result["serverInfo"]["name"], "everything");
        assert_eq!(result["instructions"], "Be nice");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let set = CapabilitySet::from_initialize_result(&json!({}));
        assert_eq!(set.protocol_version, MCP_PROTOCOL_VERSION);
        assert_eq!(set.server_info["name"], SERVER_NAME);
        assert_eq!(set.capabilities, json!({}));
        assert!(set.initialize_result().get("instructions").is_none());
    }

    #[test]
    fn list_results_follow_capabilities() {
        let mut set = CapabilitySet::from_initialize_result(&json!({
            "capabilities": {"tools": {}},
        }));
        set.tools.push(json!({"name": "echo"}));

        assert_eq!(
            set.list_result("tools/list"),
            Some(json!({"tools": [{"name": "echo"}]}))
        );
        assert_eq!(set.list_result("prompts/list"), None);
        assert_eq!(set.list_result("tools/call"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn introspect_mock_server() {
        use crate::process::TerminationPolicy;

        let command = format!("sh {}/tests/fixtures/mock_mcp.sh", env!("CARGO_MANIFEST_DIR"));
        let launcher = Launcher::new(&command, TerminationPolicy::default()).unwrap();

        let set = CapabilitySet::introspect(&launcher, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(set.server_info["name"], "mock");
        assert_eq!(set.tools.len(), 1);
        assert!(set.resources.is_empty());
    }

    #[tokio::test]
    async fn introspect_missing_binary_fails() {
        let launcher = Launcher::new(
            "/nonexistent/definitely-not-a-binary",
            crate::process::TerminationPolicy::default(),
        )
        .unwrap();

        assert!(CapabilitySet::introspect(&launcher, Duration::from_secs(1))
            .await
            .is_err());
    }
}
