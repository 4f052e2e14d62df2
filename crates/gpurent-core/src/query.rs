//! Search-query assembly helpers.
//!
//! The query language is a pass-through string of space-separated
//! `field op value` clauses; nothing here parses it beyond whitespace
//! splitting.

use crate::models::DockerTag;

/// Split a query string into the individual filter tokens the search
/// command expects.
pub fn split_query(query: &str) -> Vec<String> {
    query.split_whitespace().map(str::to_string).collect()
}

/// Build the machine-compatibility filter for a container image from its
/// tag metadata: the host must support the image's CUDA range plus any
/// provider-declared extra clauses.
pub fn compatibility_query(tag: &DockerTag) -> String {
    let mut clauses = vec!["rentable=true".to_string()];
    if let Some(min_cuda) = tag.min_cuda {
        clauses.push(format!("cuda_max_good>={}", min_cuda));
    }
    if let Some(max_cuda) = tag.max_cuda {
        clauses.push(format!("cuda_max_good<={}", max_cuda));
    }
    if let Some(filters) = &tag.extra_filters {
        for (prop, ops) in filters {
            for (op, value) in ops {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                clauses.push(format!("{} {} {}", prop, op, rendered));
            }
        }
    }
    clauses.join(" ")
}
