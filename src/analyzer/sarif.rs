//! Reader for SARIF 2.1 documents, shared by the tools that emit them.

use serde_json::{Map, Value};

use super::{array, dig, int, nested, text, PathContext};
use crate::models::Finding;
use crate::store::schema::TableSpec;

/// One SARIF result at one physical location.
#[derive(Debug, Clone, Default)]
pub struct SarifHit {
    pub uri: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub start_col: Option<i64>,
    pub end_col: Option<i64>,
    pub rule_id: Option<String>,
    pub rule_name: Option<String>,
    pub level: Option<String>,
    pub message: Option<String>,
    pub fingerprint: Option<String>,
    pub help_text: Option<String>,
    pub tags: Option<Value>,
    pub properties: Option<Value>,
    /// Driver that produced the run, e.g. the wrapped linter under qlty.
    pub tool_name: Option<String>,
}

/// Flatten every run of `payload` into hits. A result reported at several
/// locations yields one hit per location; results without a file location
/// are dropped.
pub fn hits(payload: &Value) -> Vec<SarifHit> {
    let mut out = Vec::new();
    for run in array(payload.get("runs")) {
        let driver = dig(run, &["tool", "driver"]).unwrap_or(&Value::Null);
        let rules = array(driver.get("rules"));
        let tool_name = text(driver.get("name"));

        for result in array(run.get("results")) {
            let rule = rule_for(result, rules);
            let base = SarifHit {
                rule_id: text(result.get("ruleId")).or_else(|| rule.and_then(|r| text(r.get("id")))),
                rule_name: rule.and_then(|r| text(r.get("name"))),
                level: text(result.get("level"))
                    .or_else(|| rule.and_then(|r| text(dig(r, &["defaultConfiguration", "level"])))),
                message: text(dig(result, &["message", "text"]))
                    .or_else(|| text(dig(result, &["message", "markdown"]))),
                fingerprint: fingerprint(result),
                help_text: rule.and_then(|r| {
                    text(dig(r, &["help", "text"])).or_else(|| text(dig(r, &["shortDescription", "text"])))
                }),
                tags: rule.and_then(|r| nested(dig(r, &["properties", "tags"]))),
                properties: nested(result.get("properties")),
                tool_name: tool_name.clone(),
                ..SarifHit::default()
            };

            for location in array(result.get("locations")) {
                let physical = location.get("physicalLocation").unwrap_or(&Value::Null);
                let Some(uri) = text(dig(physical, &["artifactLocation", "uri"])) else {
                    continue;
                };
                let region = physical.get("region").unwrap_or(&Value::Null);
                let start_line = int(region.get("startLine"));
                out.push(SarifHit {
                    uri: strip_file_scheme(&uri),
                    start_line,
                    end_line: int(region.get("endLine")).or(start_line),
                    start_col: int(region.get("startColumn")),
                    end_col: int(region.get("endColumn")),
                    ..base.clone()
                });
            }
        }
    }
    out
}

/// Rows for `table` from a SARIF payload. `with_tool_name` adds the driver
/// name column for aggregators that wrap several linters.
pub fn findings(table: &'static TableSpec, payload: &Value, ctx: &PathContext<'_>, with_tool_name: bool) -> Vec<Finding> {
    let hits = hits(payload);
    let root = ctx.root(hits.iter().map(|h| h.uri.as_str()));
    hits.into_iter()
        .map(|hit| {
            let finding = Finding::new(table.name, ctx.file_path(&hit.uri), root.as_str())
                .lines(hit.start_line, hit.end_line)
                .columns(hit.start_col, hit.end_col)
                .with_opt("rule_id", hit.rule_id)
                .with_opt("rule_name", hit.rule_name)
                .with_opt("level", hit.level)
                .with_opt("message", hit.message)
                .with_opt("fingerprint", hit.fingerprint)
                .with_opt("help_text", hit.help_text)
                .with_opt("tags", hit.tags)
                .with_opt("properties", hit.properties);
            if with_tool_name {
                finding.with_opt("tool_name", hit.tool_name)
            } else {
                finding
            }
        })
        .collect()
}

fn rule_for<'v>(result: &'v Value, rules: &'v [Value]) -> Option<&'v Value> {
    if let Some(id) = result.get("ruleId").and_then(Value::as_str) {
        if let Some(rule) = rules.iter().find(|r| r.get("id").and_then(Value::as_str) == Some(id)) {
            return Some(rule);
        }
    }
    let index = usize::try_from(int(result.get("ruleIndex"))?).ok()?;
    rules.get(index)
}

/// First fingerprint value, stable ones (`fingerprints`) before partial ones.
fn fingerprint(result: &Value) -> Option<String> {
    ["fingerprints", "partialFingerprints"]
        .iter()
        .filter_map(|key| result.get(*key).and_then(Value::as_object))
        .find_map(first_value)
}

fn first_value(map: &Map<String, Value>) -> Option<String> {
    map.values().find_map(|v| text(Some(v)))
}

fn strip_file_scheme(uri: &str) -> String {
    uri.strip_prefix("file://").unwrap_or(uri).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "version": "2.1.0",
            "runs": [{
                "tool": {"driver": {
                    "name": "ruff",
                    "rules": [{
                        "id": "python/Sqli",
                        "name": "Sqli",
                        "shortDescription": {"text": "SQL Injection"},
                        "defaultConfiguration": {"level": "error"},
                        "properties": {"tags": ["security", "python"]}
                    }]
                }},
                "results": [{
                    "ruleId": "python/Sqli",
                    "ruleIndex": 0,
                    "message": {"text": "Unsanitized input flows into execute"},
                    "locations": [
                        {"physicalLocation": {"artifactLocation": {"uri": "app/db.py"}, "region": {"startLine": 40, "startColumn": 9, "endColumn": 30}}},
                        {"physicalLocation": {"artifactLocation": {"uri": "file:///repo/app/db2.py"}, "region": {"startLine": 3, "endLine": 5}}}
                    ],
                    "fingerprints": {"0": "abc123"},
                    "properties": {"priorityScore": 800}
                }, {
                    "ruleIndex": 0,
                    "message": {"text": "no location"}
                }]
            }]
        })
    }

    #[test]
    fn test_hits_expand_locations() {
        let hits = hits(&sample());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].uri, "app/db.py");
        assert_eq!(hits[0].end_line, Some(40));
        assert_eq!(hits[0].level.as_deref(), Some("error"));
        assert_eq!(hits[0].help_text.as_deref(), Some("SQL Injection"));
        assert_eq!(hits[0].fingerprint.as_deref(), Some("abc123"));
        assert_eq!(hits[1].uri, "/repo/app/db2.py");
        assert_eq!((hits[1].start_line, hits[1].end_line), (Some(3), Some(5)));
        assert_eq!(hits[1].tool_name.as_deref(), Some("ruff"));
    }

    #[test]
    fn test_rule_lookup_by_index() {
        let rules = vec![json!({"id": "r0"}), json!({"id": "r1"})];
        let result = json!({"ruleIndex": 1});
        assert_eq!(rule_for(&result, &rules), Some(&rules[1]));
        assert_eq!(rule_for(&json!({"ruleIndex": 9}), &rules), None);
    }

    #[test]
    fn test_empty_document() {
        assert!(hits(&json!({})).is_empty());
        assert!(hits(&Value::Null).is_empty());
    }
}
