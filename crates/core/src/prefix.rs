use serde::{Deserialize, Serialize};

/// Which side of the retrieval pair a text is on. Several embedding model
/// families require asymmetric prefixes for queries versus documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextRole {
    Query,
    Document,
}

/// How a prefix is applied: prepended verbatim, substituted into a template,
/// or passed out-of-band as an API parameter with no text change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PrefixMode {
    Simple {
        query_prefix: String,
        document_prefix: String,
    },
    Template {
        query_template: String,
        document_template: String,
    },
    ApiParam {
        param_name: String,
        query_value: String,
        document_value: String,
    },
}

pub const TEMPLATE_PLACEHOLDER: &str = "{text}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingPrefixConfig {
    pub mode: PrefixMode,
}

impl EmbeddingPrefixConfig {
    /// Look up the preset for a model family by substring match on the model
    /// name. Models with no known prefix convention get no transformation.
    pub fn for_model(model_name: &str) -> Option<Self> {
        let lowered = model_name.to_lowercase();
        if lowered.contains("e5") {
            return Some(Self {
                mode: PrefixMode::Simple {
                    query_prefix: "query: ".to_string(),
                    document_prefix: "passage: ".to_string(),
                },
            });
        }
        if lowered.contains("nomic") {
            return Some(Self {
                mode: PrefixMode::Template {
                    query_template: "search_query: {text}".to_string(),
                    document_template: "search_document: {text}".to_string(),
                },
            });
        }
        if lowered.contains("cohere") || lowered.contains("embed-english") {
            return Some(Self {
                mode: PrefixMode::ApiParam {
                    param_name: "input_type".to_string(),
                    query_value: "search_query".to_string(),
                    document_value: "search_document".to_string(),
                },
            });
        }
        None
    }

    /// Construct from the legacy flat fields some repository records still
    /// carry (a bare query/document prefix pair).
    pub fn from_legacy_prefixes(query_prefix: &str, document_prefix: &str) -> Self {
        Self {
            mode: PrefixMode::Simple {
                query_prefix: query_prefix.to_string(),
                document_prefix: document_prefix.to_string(),
            },
        }
    }

    pub fn resolve_query_text(&self, text: &str) -> String {
        match &self.mode {
            PrefixMode::Simple { query_prefix, .. } => format!("{query_prefix}{text}"),
            PrefixMode::Template { query_template, .. } => {
                // Queries require a well-formed template.
                query_template.replace(TEMPLATE_PLACEHOLDER, text)
            }
            PrefixMode::ApiParam { .. } => text.to_string(),
        }
    }

    pub fn resolve_document_text(&self, text: &str) -> String {
        match &self.mode {
            PrefixMode::Simple {
                document_prefix, ..
            } => format!("{document_prefix}{text}"),
            PrefixMode::Template {
                document_template, ..
            } => {
                if document_template.contains(TEMPLATE_PLACEHOLDER) {
                    document_template.replace(TEMPLATE_PLACEHOLDER, text)
                } else {
                    // Malformed document template degrades to a prepend.
                    format!("{document_template}{text}")
                }
            }
            PrefixMode::ApiParam { .. } => text.to_string(),
        }
    }

    /// Side-channel parameters to merge into the embedding API request.
    /// Empty for text-transform modes.
    pub fn api_params(&self, role: TextRole) -> Vec<(String, String)> {
        match &self.mode {
            PrefixMode::ApiParam {
                param_name,
                query_value,
                document_value,
            } => {
                let value = match role {
                    TextRole::Query => query_value,
                    TextRole::Document => document_value,
                };
                vec![(param_name.clone(), value.clone())]
            }
            PrefixMode::Simple { .. } | PrefixMode::Template { .. } => Vec::new(),
        }
    }
}
