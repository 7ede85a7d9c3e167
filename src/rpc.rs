use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::dispatcher::Request;

pub const SERVER_NOT_INITIALIZED: i32 = -32002;
pub const CONNECTION_FAILED: i32 = -32001;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const PARSE_ERROR: i32 = -32700;

/// Rows returned by a `data://tables/{name}` read.
const RESOURCE_SAMPLE_LIMIT: u64 = 5;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self::failure(id, JsonRpcError::new(code, message))
    }

    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub initialization_options: Option<InitializationOptions>,
}

#[derive(Debug, Deserialize)]
pub struct InitializationOptions {
    pub settings: Option<ServerSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    pub database_url: Option<String>,
}

// MCP specific structures
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Serialize)]
pub struct ServerCapabilities {
    pub tools: Option<ToolsCapability>,
    pub resources: Option<ResourcesCapability>,
    pub prompts: Option<PromptsCapability>,
}

#[derive(Debug, Serialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Serialize)]
pub struct ResourcesCapability {
    pub subscribe: bool,
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Serialize)]
pub struct PromptsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolsList {
    pub tools: Vec<Tool>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
pub struct QueryArguments {
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct NaturalLanguageArguments {
    pub natural_query: String,
    pub table_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TableArguments {
    pub table_name: String,
}

#[derive(Debug, Deserialize)]
pub struct TableDataArguments {
    pub table_name: String,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

#[derive(Debug, Serialize)]
pub struct ResourceTemplate {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

#[derive(Debug, Deserialize)]
pub struct ResourceReadParams {
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct Prompt {
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Serialize)]
pub struct PromptArgument {
    pub name: String,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Deserialize)]
pub struct PromptGetParams {
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: Value,
    pub reason: Option<String>,
}

macro_rules! parse_arguments {
    ($arguments:expr, $args_type:ty) => {
        serde_json::from_value::<$args_type>($arguments)
            .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("Invalid arguments: {e}")))?
    };
}

/// Translate an MCP tool call into a pipeline request.
pub fn tool_request(name: &str, arguments: Value) -> Result<Request, JsonRpcError> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    let request = match name {
        "execute_sql_query" => {
            let args = parse_arguments!(arguments, QueryArguments);
            Request::RawQuery { sql: args.query }
        }
        "natural_language_query" => {
            let args = parse_arguments!(arguments, NaturalLanguageArguments);
            Request::NaturalLanguageQuery {
                text: args.natural_query,
                table_hint: args.table_hint,
            }
        }
        "list_tables" => Request::ListTables,
        "describe_table" => {
            let args = parse_arguments!(arguments, TableArguments);
            Request::DescribeTable { name: args.table_name }
        }
        "get_table_data" => {
            let args = parse_arguments!(arguments, TableDataArguments);
            Request::SampleData {
                name: args.table_name,
                limit: args.limit,
            }
        }
        "get_schema" => Request::GetSchema,
        other => return Err(JsonRpcError::new(METHOD_NOT_FOUND, format!("Unknown tool: {other}"))),
    };
    Ok(request)
}

/// Translate a resource URI into a pipeline request.
pub fn resource_request(uri: &str) -> Result<Request, JsonRpcError> {
    if uri == "schema://database" {
        return Ok(Request::GetSchema);
    }
    let table = |prefix: &str| uri.strip_prefix(prefix).filter(|name| !name.is_empty());
    if let Some(name) = table("schema://tables/") {
        return Ok(Request::DescribeTable { name: name.to_string() });
    }
    if let Some(name) = table("data://tables/") {
        return Ok(Request::SampleData {
            name: name.to_string(),
            limit: Some(RESOURCE_SAMPLE_LIMIT),
        });
    }
    Err(JsonRpcError::new(INVALID_PARAMS, format!("Unknown resource: {uri}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_requests() {
        assert_eq!(
            tool_request("execute_sql_query", json!({"query": "SELECT 1"})).unwrap(),
            Request::RawQuery { sql: "SELECT 1".into() }
        );
        assert_eq!(
            tool_request("natural_language_query", json!({"natural_query": "top users", "table_hint": "users"}))
                .unwrap(),
            Request::NaturalLanguageQuery {
                text: "top users".into(),
                table_hint: Some("users".into()),
            }
        );
        assert_eq!(tool_request("list_tables", Value::Null).unwrap(), Request::ListTables);
        assert_eq!(
            tool_request("get_table_data", json!({"table_name": "users"})).unwrap(),
            Request::SampleData { name: "users".into(), limit: None }
        );
    }

    #[test]
    fn test_tool_request_errors() {
        let err = tool_request("drop_database", json!({})).unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);

        let err = tool_request("describe_table", json!({"table": "users"})).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert!(err.message.contains("table_name"));
    }

    #[test]
    fn test_resource_requests() {
        assert_eq!(resource_request("schema://database").unwrap(), Request::GetSchema);
        assert_eq!(
            resource_request("schema://tables/users").unwrap(),
            Request::DescribeTable { name: "users".into() }
        );
        assert_eq!(
            resource_request("data://tables/orders").unwrap(),
            Request::SampleData { name: "orders".into(), limit: Some(5) }
        );
        assert!(resource_request("data://tables/").is_err());
        assert!(resource_request("file:///etc/passwd").is_err());
    }

    #[test]
    fn test_cancelled_params() {
        let params: CancelledParams = serde_json::from_value(json!({"requestId": 7, "reason": "user"})).unwrap();
        assert_eq!(params.request_id, json!(7));
    }

    #[test]
    fn test_error_response_shape() {
        let value = serde_json::to_value(JsonRpcResponse::error(Some(json!(1)), PARSE_ERROR, "Parse error".into()))
            .unwrap();
        assert_eq!(value["error"]["code"], PARSE_ERROR);
        assert!(value.get("result").is_none());
    }
}
