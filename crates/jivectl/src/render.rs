//! Compact terminal rendering for tool responses.

use serde_json::Value;

/// One-line summary of a work item object.
pub fn work_item_line(item: &Value) -> String {
    let id = item.get("id").and_then(Value::as_str).unwrap_or("?");
    let item_type = item.get("item_type").and_then(Value::as_str).unwrap_or("?");
    let status = item.get("status").and_then(Value::as_str).unwrap_or("?");
    let priority = item.get("priority").and_then(Value::as_str).unwrap_or("?");
    let title = item.get("title").and_then(Value::as_str).unwrap_or("");
    let progress = item
        .get("progress")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    format!(
        "{}  {:<10} {:<12} {:<7} {:>4.0}%  {}",
        short_id(id),
        item_type,
        status,
        priority,
        progress * 100.0,
        title
    )
}

/// One-line summary of a search hit (work item fields plus score).
pub fn search_hit_line(hit: &Value) -> String {
    let score = hit.get("score").and_then(Value::as_f64).unwrap_or(0.0);
    format!("{score:.3}  {}", work_item_line(hit))
}

/// Multi-line rendering of an execution status payload.
pub fn execution_status(payload: &Value) -> String {
    let mut out = String::new();
    let field = |key: &str| {
        payload
            .get(key)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "-".to_string())
    };

    out.push_str(&format!("execution:  {}\n", field("execution_id")));
    out.push_str(&format!("work item:  {}\n", field("work_item_id")));
    out.push_str(&format!("status:     {}\n", field("status")));
    out.push_str(&format!("mode:       {}\n", field("mode")));
    if let Some(plan) = payload.get("plan").and_then(Value::as_array) {
        out.push_str(&format!("plan:       {} items\n", plan.len()));
        for id in plan {
            if let Some(id) = id.as_str() {
                out.push_str(&format!("  - {}\n", short_id(id)));
            }
        }
    }
    if let Some(logs) = payload.get("logs").and_then(Value::as_array) {
        out.push_str("logs:\n");
        for entry in logs {
            let ts = entry
                .get("timestamp")
                .and_then(Value::as_str)
                .unwrap_or("-");
            let level = entry.get("level").and_then(Value::as_str).unwrap_or("-");
            let message = entry.get("message").and_then(Value::as_str).unwrap_or("");
            out.push_str(&format!("  {ts} [{level}] {message}\n"));
        }
    }
    out
}

/// First eight hex characters of a UUID for terminal listings.
pub fn short_id(id: &str) -> &str {
    if id.len() >= 8 {
        &id[..8]
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn work_item_line_contains_key_fields() {
        let item = json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "item_type": "task",
            "status": "in_progress",
            "priority": "high",
            "progress": 0.5,
            "title": "Implement login",
        });
        let line = work_item_line(&item);
        assert!(line.starts_with("550e8400"));
        assert!(line.contains("in_progress"));
        assert!(line.contains("50%"));
        assert!(line.ends_with("Implement login"));
    }

    #[test]
    fn short_id_clips_uuid() {
        assert_eq!(short_id("550e8400-e29b-41d4-a716-446655440000"), "550e8400");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn execution_status_lists_plan() {
        let payload = json!({
            "execution_id": "e",
            "work_item_id": "w",
            "status": "running",
            "mode": "dependency_based",
            "plan": ["550e8400-e29b-41d4-a716-446655440000"],
        });
        let rendered = execution_status(&payload);
        assert!(rendered.contains("status:     running"));
        assert!(rendered.contains("plan:       1 items"));
        assert!(rendered.contains("  - 550e8400"));
    }
}
