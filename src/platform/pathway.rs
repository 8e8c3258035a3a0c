use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

const END_CALL_NODE: &str = "End Call";

/// Pairs of variable names that usually hold the same value.
const SEMANTIC_DUPLICATES: [(&str, &str); 4] = [
    ("fullname", "name"),
    ("firstname", "name"),
    ("phonenumber", "phone"),
    ("emailaddress", "email"),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pathway {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: NodeData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Entries look like `[name, type, description, optional?]`.
    #[serde(default, rename = "extractVars")]
    pub extract_vars: Option<Vec<Vec<Value>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub optional: bool,
    pub node_id: String,
    pub node_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndNode {
    pub id: String,
    pub name: String,
    pub prompt: String,
}

impl Node {
    pub fn name(&self) -> &str {
        self.data.name.as_deref().unwrap_or_default()
    }

    fn variable_entries(&self) -> impl Iterator<Item = &[Value]> {
        self.data
            .extract_vars
            .iter()
            .flatten()
            .map(Vec::as_slice)
    }
}

fn entry_text(entry: &[Value], index: usize) -> String {
    match entry.get(index) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl Pathway {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }

    /// Extractable variables across all nodes, deduplicated case-insensitively
    /// keeping the first spelling seen.
    pub fn extract_variables(&self) -> Vec<VariableSpec> {
        let mut seen = HashSet::new();
        let mut variables = Vec::new();

        for node in &self.nodes {
            for entry in node.variable_entries() {
                let Some(Value::String(name)) = entry.first() else {
                    continue;
                };
                let name = name.trim();
                if name.is_empty() || !seen.insert(name.to_lowercase()) {
                    continue;
                }

                variables.push(VariableSpec {
                    name: name.to_owned(),
                    kind: entry_text(entry, 1),
                    description: entry_text(entry, 2),
                    optional: entry.get(3).and_then(Value::as_bool).unwrap_or(false),
                    node_id: node.id.clone(),
                    node_name: node.name().to_owned(),
                });
            }
        }

        variables
    }

    pub fn end_nodes(&self) -> Vec<EndNode> {
        self.nodes
            .iter()
            .filter(|node| node.kind.as_deref() == Some(END_CALL_NODE))
            .map(|node| EndNode {
                id: node.id.clone(),
                name: node.name().to_owned(),
                prompt: node.data.prompt.clone().unwrap_or_default(),
            })
            .collect()
    }

    /// Names of the variables extracted by any of the given visited nodes,
    /// trimmed and lowercased.
    pub fn variables_for_nodes<S: AsRef<str>>(&self, visited: &[S]) -> HashSet<String> {
        let visited: HashSet<&str> = visited.iter().map(AsRef::as_ref).collect();

        self.nodes
            .iter()
            .filter(|node| visited.contains(node.name()))
            .flat_map(Node::variable_entries)
            .filter_map(|entry| entry.first().and_then(Value::as_str))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    /// Non-empty prompts of the first few nodes, in order.
    pub fn prompt_excerpt(&self, limit: usize) -> Vec<&str> {
        self.nodes
            .iter()
            .take(5)
            .filter_map(|node| node.data.prompt.as_deref())
            .filter(|prompt| !prompt.trim().is_empty())
            .take(limit)
            .collect()
    }

    /// Variable pairs that likely collect the same information, by their
    /// pathway spelling.
    pub fn semantic_duplicates(&self) -> Vec<(String, String)> {
        let by_lowercase: HashMap<String, String> = self
            .extract_variables()
            .into_iter()
            .map(|variable| (variable.name.to_lowercase(), variable.name))
            .collect();

        SEMANTIC_DUPLICATES
            .iter()
            .filter_map(|(first, second)| {
                Some((
                    by_lowercase.get(*first)?.clone(),
                    by_lowercase.get(*second)?.clone(),
                ))
            })
            .collect()
    }
}
