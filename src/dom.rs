//! JavaScript evaluated in the page, and helpers to read its results.

use anyhow::{Context, Result, anyhow};
use headless_chrome::Tab;
use serde_json::Value;

use crate::page::ElementSnapshot;

/// Markup of the whole document.
pub const OUTER_HTML_JS: &str = "document.documentElement.outerHTML";

/// Embed `s` as a JS string literal.
fn js_str(s: &str) -> String {
    Value::from(s).to_string()
}

/// Text and absolute link targets of up to `limit` matches, as a JSON string.
pub fn snapshot_js(selector: &str, limit: usize) -> String {
    format!(
        r#"
(() => {{
  const nodes = Array.from(document.querySelectorAll({sel})).slice(0, {limit});
  return JSON.stringify(nodes.map(el => ({{
    text: (el.innerText || el.textContent || '').trim(),
    links: Array.from(el.querySelectorAll('a[href]')).map(a => a.href),
  }})));
}})()
"#,
        sel = js_str(selector),
    )
}

/// Clicks the first match whose trimmed text equals `text` (case-insensitive).
/// Evaluates to `true` when something was clicked.
pub fn click_with_text_js(selector: &str, text: &str) -> String {
    format!(
        r#"
(() => {{
  const wanted = {text}.trim().toLowerCase();
  const el = Array.from(document.querySelectorAll({sel}))
    .find(e => (e.innerText || e.textContent || '').trim().toLowerCase() === wanted);
  if (!el) return false;
  el.scrollIntoView({{ block: 'center' }});
  el.click();
  return true;
}})()
"#,
        sel = js_str(selector),
        text = js_str(text),
    )
}

/// `true` when some match contains `text` (case-insensitive).
pub fn contains_text_js(selector: &str, text: &str) -> String {
    format!(
        r#"
(() => {{
  const wanted = {text}.trim().toLowerCase();
  return Array.from(document.querySelectorAll({sel}))
    .some(e => (e.innerText || e.textContent || '').toLowerCase().includes(wanted));
}})()
"#,
        sel = js_str(selector),
        text = js_str(text),
    )
}

fn evaluate(tab: &Tab, js: &str) -> Result<Value> {
    let result = tab.evaluate(js, false).context("evaluate script")?;
    Ok(result.value.unwrap_or(Value::Null))
}

pub fn evaluate_string(tab: &Tab, js: &str) -> Result<String> {
    match evaluate(tab, js)? {
        Value::String(s) => Ok(s),
        other => Err(anyhow!("script returned {other} instead of a string")),
    }
}

pub fn evaluate_bool(tab: &Tab, js: &str) -> Result<bool> {
    Ok(evaluate(tab, js)?.as_bool().unwrap_or(false))
}

pub fn parse_snapshots(raw: &str) -> Result<Vec<ElementSnapshot>> {
    serde_json::from_str(raw).context("decode element snapshots")
}
