//! Endpoint helpers: absolute URL construction and `{{ name }}` interpolation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use crate::error::{Error, Result};

/// A single template variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
  Integer(i64),
  Float(f64),
  Text(String),
}

impl fmt::Display for VariableValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      VariableValue::Integer(n) => write!(f, "{}", n),
      VariableValue::Float(n) => write!(f, "{}", n),
      VariableValue::Text(s) => f.write_str(s),
    }
  }
}

impl From<&str> for VariableValue {
  fn from(value: &str) -> Self {
    VariableValue::Text(value.to_string())
  }
}

impl From<String> for VariableValue {
  fn from(value: String) -> Self {
    VariableValue::Text(value)
  }
}

impl From<i64> for VariableValue {
  fn from(value: i64) -> Self {
    VariableValue::Integer(value)
  }
}

impl From<i32> for VariableValue {
  fn from(value: i32) -> Self {
    VariableValue::Integer(value.into())
  }
}

impl From<u32> for VariableValue {
  fn from(value: u32) -> Self {
    VariableValue::Integer(value.into())
  }
}

impl From<f64> for VariableValue {
  fn from(value: f64) -> Self {
    VariableValue::Float(value)
  }
}

/// Named values substituted into endpoint templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, VariableValue>);

impl Variables {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert.
  pub fn with(mut self, name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
    self.insert(name, value);
    self
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<VariableValue>) {
    self.0.insert(name.into(), value.into());
  }

  pub fn get(&self, name: &str) -> Option<&VariableValue> {
    self.0.get(name)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &VariableValue)> {
    self.0.iter()
  }

  /// Returns a copy of `self` with every entry of `extra` applied on top.
  pub fn merged(&self, extra: &Variables) -> Variables {
    let mut merged = self.clone();
    for (name, value) in extra.iter() {
      merged.0.insert(name.clone(), value.clone());
    }
    merged
  }
}

impl<K, V> FromIterator<(K, V)> for Variables
where
  K: Into<String>,
  V: Into<VariableValue>,
{
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

fn is_valid_url(candidate: &str) -> bool {
  Url::parse(candidate).is_ok()
}

fn combine_url(endpoint: &str, base_url: &str) -> String {
  match (endpoint.starts_with('/'), base_url.ends_with('/')) {
    (true, true) => format!("{}{}", base_url, &endpoint[1..]),
    (false, false) => format!("{}/{}", base_url, endpoint),
    _ => format!("{}{}", base_url, endpoint),
  }
}

/// Resolve `endpoint` into an absolute URL.
///
/// An absolute `endpoint` is returned unchanged. Otherwise it is appended to
/// `base_url` with exactly one `/` between the two.
pub fn build_url(endpoint: &str, base_url: Option<&str>) -> Result<String> {
  if is_valid_url(endpoint) {
    return Ok(endpoint.to_string());
  }

  match base_url {
    Some(base) if is_valid_url(base) => Ok(combine_url(endpoint, base)),
    _ => Err(Error::InvalidUrl {
      endpoint: endpoint.to_string(),
    }),
  }
}

/// Substitute `{{ name }}` placeholders in `template`.
///
/// Each variable replaces only its first placeholder. Placeholders without a
/// matching variable are left as they are.
pub fn interpolate(template: &str, variables: &Variables) -> String {
  if !template
    .chars()
    .any(|c| c.is_ascii_alphabetic() || c == '_')
  {
    return template.to_string();
  }

  variables
    .iter()
    .fold(template.to_string(), |acc, (name, value)| {
      replace_first_placeholder(&acc, name, &value.to_string()).unwrap_or(acc)
    })
}

fn replace_first_placeholder(haystack: &str, name: &str, value: &str) -> Option<String> {
  if name.is_empty() {
    return None;
  }

  let mut search_from = 0;
  while let Some(offset) = haystack[search_from..].find("{{") {
    let start = search_from + offset;
    let inner = haystack[start + 2..].trim_start();
    if let Some(rest) = inner.strip_prefix(name) {
      if let Some(after) = rest.trim_start().strip_prefix("}}") {
        let end = haystack.len() - after.len();
        return Some(format!("{}{}{}", &haystack[..start], value, &haystack[end..]));
      }
    }
    search_from = start + 1;
  }

  None
}
