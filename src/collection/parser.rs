use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::collection::model::HttpMethod;

const COLLECTION_SCHEMA_MARKER: &str = "postman.com/json/collection";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DocumentError {
    #[error("{0} is not valid JSON")]
    InvalidJson(&'static str),
    #[error("invalid Postman collection schema")]
    InvalidCollection,
    #[error("invalid Postman env schema")]
    InvalidEnvironment,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CollectionDocument {
    pub info: CollectionInfo,
    #[serde(default)]
    pub item: Vec<Item>,
    #[serde(default)]
    pub variable: Vec<Variable>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CollectionInfo {
    pub name: String,
    pub schema: String,
    pub description: Option<Description>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum Description {
    Text(String),
    Rich { content: Option<String> },
}

#[derive(Deserialize, Clone, Debug)]
pub struct Item {
    pub name: Option<String>,
    pub item: Option<Vec<Item>>,
    pub request: Option<RequestSpec>,
    #[serde(default)]
    pub event: Vec<ScriptEvent>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum RequestSpec {
    Url(String),
    Detail(RequestDetail),
}

#[derive(Deserialize, Clone, Debug)]
pub struct RequestDetail {
    pub method: Option<String>,
    pub url: Option<UrlSpec>,
    #[serde(default)]
    pub header: Vec<HeaderSpec>,
    pub body: Option<BodySpec>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum UrlSpec {
    Raw(String),
    Parts(UrlParts),
}

#[derive(Deserialize, Clone, Debug)]
pub struct UrlParts {
    pub raw: Option<String>,
    pub host: Option<Value>,
    pub path: Option<Value>,
    #[serde(default)]
    pub query: Vec<QueryParam>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct QueryParam {
    pub key: Option<String>,
    pub value: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct HeaderSpec {
    pub key: String,
    pub value: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct BodySpec {
    pub mode: Option<String>,
    pub raw: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ScriptEvent {
    pub listen: String,
    pub script: Option<Script>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Script {
    #[serde(default)]
    pub exec: ScriptSource,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum ScriptSource {
    Lines(Vec<String>),
    Text(String),
}

impl Default for ScriptSource {
    fn default() -> Self {
        ScriptSource::Lines(vec![])
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct Variable {
    pub key: String,
    pub value: Option<Value>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct EnvironmentDocument {
    pub name: String,
    #[serde(default)]
    pub values: Vec<EnvironmentValue>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct EnvironmentValue {
    pub key: String,
    pub value: Option<Value>,
    pub enabled: Option<bool>,
}

impl EnvironmentDocument {
    pub fn variables(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .filter(|value| value.enabled != Some(false))
            .map(|value| (value.key.clone(), value_to_text(value.value.as_ref())))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionMeta {
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
}

impl CollectionDocument {
    pub fn meta(&self) -> CollectionMeta {
        let version = version_pattern()
            .captures(&self.info.schema)
            .and_then(|captures| captures.get(1))
            .map(|version| version.as_str().to_string());
        let description = match &self.info.description {
            Some(Description::Text(text)) => Some(text.clone()),
            Some(Description::Rich { content }) => content.clone(),
            None => None,
        };
        CollectionMeta {
            name: self.info.name.clone(),
            version,
            description,
        }
    }

    pub fn variables(&self) -> HashMap<String, String> {
        self.variable
            .iter()
            .filter(|variable| !variable.disabled)
            .map(|variable| (variable.key.clone(), value_to_text(variable.value.as_ref())))
            .collect()
    }
}

/// A request item resolved from the static collection structure. `path` is
/// the folder-qualified identity used to match indexed requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutableItem {
    pub name: String,
    pub path: String,
    pub folder: String,
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub test_script: Vec<String>,
}

pub fn parse_collection(value: Value) -> Result<CollectionDocument, DocumentError> {
    let document: CollectionDocument =
        serde_json::from_value(value).map_err(|_| DocumentError::InvalidCollection)?;
    if !document.info.schema.contains(COLLECTION_SCHEMA_MARKER) {
        return Err(DocumentError::InvalidCollection);
    }
    Ok(document)
}

pub fn parse_collection_bytes(bytes: &[u8]) -> Result<CollectionDocument, DocumentError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|_| DocumentError::InvalidJson("collection"))?;
    parse_collection(value)
}

pub fn parse_environment(value: Value) -> Result<EnvironmentDocument, DocumentError> {
    serde_json::from_value(value).map_err(|_| DocumentError::InvalidEnvironment)
}

pub fn parse_environment_bytes(bytes: &[u8]) -> Result<EnvironmentDocument, DocumentError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|_| DocumentError::InvalidJson("env"))?;
    parse_environment(value)
}

/// Every executable request in depth-first order. Items whose method is
/// missing or unsupported are left out.
pub fn executable_items(document: &CollectionDocument) -> Vec<ExecutableItem> {
    let mut out = vec![];
    walk(&document.item, &[], &mut out);
    out
}

/// Requests to index for a collection: executable items de-duplicated by
/// path, first occurrence wins.
pub fn index_requests(document: &CollectionDocument) -> Vec<ExecutableItem> {
    let mut seen = HashSet::new();
    executable_items(document)
        .into_iter()
        .filter(|item| seen.insert(item.path.clone()))
        .collect()
}

fn walk(items: &[Item], parent: &[String], out: &mut Vec<ExecutableItem>) {
    for item in items {
        let mut current = parent.to_vec();
        if let Some(name) = &item.name {
            current.push(name.clone());
        }
        if let Some(children) = &item.item {
            walk(children, &current, out);
            continue;
        }
        let (method, url, headers, body) = match &item.request {
            // a bare string is a GET on that URL
            Some(RequestSpec::Url(url)) => (HttpMethod::Get, url.clone(), vec![], None),
            Some(RequestSpec::Detail(detail)) => {
                let Some(method) = detail
                    .method
                    .as_deref()
                    .and_then(|method| method.parse::<HttpMethod>().ok())
                else {
                    continue;
                };
                let url = detail.url.as_ref().map(url_to_string).unwrap_or_default();
                let headers = detail
                    .header
                    .iter()
                    .filter(|header| !header.disabled)
                    .map(|header| (header.key.clone(), header.value.clone().unwrap_or_default()))
                    .collect();
                let body = detail
                    .body
                    .as_ref()
                    .filter(|body| body.mode.as_deref().unwrap_or("raw") == "raw")
                    .and_then(|body| body.raw.clone());
                (method, url, headers, body)
            }
            None => continue,
        };
        let name = item
            .name
            .clone()
            .unwrap_or_else(|| format!("{method} {url}"));
        out.push(ExecutableItem {
            name,
            path: current.join("/"),
            folder: parent.join("/"),
            method,
            url,
            headers,
            body,
            test_script: test_lines(&item.event),
        });
    }
}

fn test_lines(events: &[ScriptEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|event| event.listen == "test")
        .filter_map(|event| event.script.as_ref())
        .flat_map(|script| match &script.exec {
            ScriptSource::Lines(lines) => lines.clone(),
            ScriptSource::Text(text) => text.lines().map(str::to_string).collect(),
        })
        .collect()
}

fn url_to_string(url: &UrlSpec) -> String {
    let parts = match url {
        UrlSpec::Raw(raw) => return raw.clone(),
        UrlSpec::Parts(parts) => parts,
    };
    if let Some(raw) = parts.raw.as_ref().filter(|raw| !raw.is_empty()) {
        return raw.clone();
    }
    let host = join_segments(parts.host.as_ref(), ".");
    let path = match parts.path.as_ref() {
        Some(Value::Array(_)) => {
            let joined = format!("/{}", join_segments(parts.path.as_ref(), "/"));
            repeated_slashes().replace_all(&joined, "/").into_owned()
        }
        _ => String::new(),
    };
    let query = if parts.query.is_empty() {
        String::new()
    } else {
        let pairs: Vec<String> = parts
            .query
            .iter()
            .map(|param| {
                format!(
                    "{}={}",
                    param.key.as_deref().unwrap_or_default(),
                    param.value.as_deref().unwrap_or_default()
                )
            })
            .collect();
        format!("?{}", pairs.join("&"))
    };
    let origin = if host.is_empty() {
        String::new()
    } else {
        format!("https://{host}")
    };
    format!("{origin}{path}{query}")
}

fn join_segments(value: Option<&Value>, separator: &str) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(segments)) => segments
            .iter()
            .map(|segment| value_to_text(Some(segment)))
            .collect::<Vec<String>>()
            .join(separator),
        _ => String::new(),
    }
}

fn value_to_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)collection/(v[\d.]+)").expect("valid version pattern"))
}

fn repeated_slashes() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/+").expect("valid slash pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "info": {
                "name": "Demo",
                "schema": "https://schema.getpostman.com/json/collection/v2.1.0/collection.json",
                "description": { "content": "demo collection" }
            },
            "variable": [{ "key": "token", "value": "abc" }],
            "item": [
                {
                    "name": "Users",
                    "item": [
                        {
                            "name": "List Users",
                            "request": { "method": "get", "url": "{{baseUrl}}/users" },
                            "event": [{
                                "listen": "test",
                                "script": { "exec": ["pm.test('200', () => pm.response.to.have.status(200));"] }
                            }]
                        },
                        {
                            "name": "Create User",
                            "request": {
                                "method": "POST",
                                "url": { "host": ["api", "example", "com"], "path": ["v1", "", "users"], "query": [{ "key": "dry", "value": "1" }] },
                                "header": [
                                    { "key": "Content-Type", "value": "application/json" },
                                    { "key": "X-Off", "value": "1", "disabled": true }
                                ],
                                "body": { "mode": "raw", "raw": "{}" }
                            }
                        },
                        { "name": "List Users", "request": { "method": "GET", "url": "{{baseUrl}}/users?dup=1" } }
                    ]
                },
                { "name": "Connect", "request": { "method": "CONNECT", "url": "x" } },
                { "request": { "method": "DELETE", "url": { "raw": "{{baseUrl}}/cache" } } }
            ]
        })
    }

    #[test]
    fn rejects_documents_without_postman_schema() {
        let result = parse_collection(json!({ "info": { "name": "x", "schema": "https://example.com" } }));
        assert_eq!(result.unwrap_err(), DocumentError::InvalidCollection);
        assert_eq!(
            parse_collection_bytes(b"{not json").unwrap_err(),
            DocumentError::InvalidJson("collection")
        );
    }

    #[test]
    fn extracts_meta_from_info() {
        let meta = parse_collection(sample()).unwrap().meta();
        assert_eq!(meta.name, "Demo");
        assert_eq!(meta.version.as_deref(), Some("v2.1.0"));
        assert_eq!(meta.description.as_deref(), Some("demo collection"));
    }

    #[test]
    fn walks_folders_into_qualified_paths() {
        let document = parse_collection(sample()).unwrap();
        let items = executable_items(&document);
        let paths: Vec<&str> = items.iter().map(|item| item.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["Users/List Users", "Users/Create User", "Users/List Users", ""]
        );
        assert_eq!(items[0].method, HttpMethod::Get);
        assert_eq!(items[0].folder, "Users");
        assert_eq!(items[0].test_script.len(), 1);
        assert_eq!(items[1].url, "https://api.example.com/v1/users?dry=1");
        assert_eq!(items[1].headers, vec![("Content-Type".to_string(), "application/json".to_string())]);
        assert_eq!(items[1].body.as_deref(), Some("{}"));
        assert_eq!(items[3].name, "DELETE {{baseUrl}}/cache");
    }

    #[test]
    fn bare_string_request_is_a_get() {
        let document = parse_collection(json!({
            "info": {
                "name": "Short",
                "schema": "https://schema.getpostman.com/json/collection/v2.1.0/collection.json"
            },
            "item": [{ "name": "Ping", "request": "{{baseUrl}}/ping" }]
        }))
        .unwrap();
        let items = executable_items(&document);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].method, HttpMethod::Get);
        assert_eq!(items[0].url, "{{baseUrl}}/ping");
        assert_eq!(items[0].path, "Ping");
        assert!(items[0].headers.is_empty());
    }

    #[test]
    fn index_keeps_first_request_per_path() {
        let document = parse_collection(sample()).unwrap();
        let indexed = index_requests(&document);
        assert_eq!(indexed.len(), 3);
        assert_eq!(indexed[0].url, "{{baseUrl}}/users");
    }

    #[test]
    fn environment_variables_skip_disabled_values() {
        let env = parse_environment(json!({
            "name": "local",
            "values": [
                { "key": "baseUrl", "value": "http://localhost", "enabled": true },
                { "key": "retries", "value": 3 },
                { "key": "secret", "value": "x", "enabled": false }
            ]
        }))
        .unwrap();
        let variables = env.variables();
        assert_eq!(variables.get("baseUrl").map(String::as_str), Some("http://localhost"));
        assert_eq!(variables.get("retries").map(String::as_str), Some("3"));
        assert!(!variables.contains_key("secret"));
        assert!(parse_environment(json!({ "values": [] })).is_err());
    }
}
