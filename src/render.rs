use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

/// Field added to the template context holding the whole event as
/// pretty-printed JSON.
pub const PAYLOAD_FIELD: &str = "payload";

/// Render `template` against the event payload.
///
/// Templates use Jinja syntax: `{{ issue.title }}`, `{% if comment %}`,
/// `{% for label in issue.labels %}`. Missing fields at any depth render as
/// empty and are falsy.
///
/// Never fails. A template that does not parse or evaluate yields a
/// diagnostic document in place of the rendered text so ingestion can carry
/// on.
pub fn render(template: &str, event: &Value) -> String {
    match try_render(template, event) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("template rendering failed: {e:#}");
            format!("Error parsing template: {e:#}")
        }
    }
}

fn try_render(template: &str, event: &Value) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.render_str(template, context(event))
}

fn context(event: &Value) -> Value {
    let pretty = serde_json::to_string_pretty(event).unwrap_or_default();
    let mut ctx = match event {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    ctx.insert(PAYLOAD_FIELD.to_string(), Value::String(pretty));
    Value::Object(ctx)
}
