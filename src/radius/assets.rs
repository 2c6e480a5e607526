//! Static files and templates rendered into the FreeRADIUS run directory.

use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::BTreeMap;

/// Values substituted for `{{name}}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    values: BTreeMap<&'static str, String>,
}

impl TemplateContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &'static str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key, value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Read-only bundle of assets the materializer copies or renders.
pub trait AssetProvider: Send + Sync + std::fmt::Debug {
    /// Relative paths of the files copied verbatim.
    fn list_files(&self) -> Vec<&str>;

    /// # Errors
    /// Returns an error if `path` is not part of the bundle.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// # Errors
    /// Returns an error if the template is unknown or references a missing value.
    fn render_template(&self, name: &str, context: &TemplateContext) -> Result<String>;
}

/// Substitute every `{{ name }}` in `template`. A placeholder without a value is an error.
///
/// # Errors
/// Returns an error naming the first unknown placeholder.
pub fn render(name: &str, template: &str, context: &TemplateContext) -> Result<String> {
    let re = Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}")?;

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;

    for caps in re.captures_iter(template) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };

        let value = context
            .get(key.as_str())
            .ok_or_else(|| anyhow!("template {name}: no value for {}", key.as_str()))?;

        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(value);
        last = whole.end();
    }

    rendered.push_str(&template[last..]);

    Ok(rendered)
}

const FILES: &[(&str, &[u8])] = &[
    (
        "dictionary",
        include_bytes!("../../assets/files/dictionary"),
    ),
    (
        "mods-enabled/always",
        include_bytes!("../../assets/files/mods-enabled/always"),
    ),
    (
        "mods-enabled/expr",
        include_bytes!("../../assets/files/mods-enabled/expr"),
    ),
    (
        "mods-enabled/mschap",
        include_bytes!("../../assets/files/mods-enabled/mschap"),
    ),
    (
        "mods-enabled/pap",
        include_bytes!("../../assets/files/mods-enabled/pap"),
    ),
    (
        "policy.d/filter",
        include_bytes!("../../assets/files/policy.d/filter"),
    ),
];

const TEMPLATES: &[(&str, &str)] = &[
    (
        "radiusd.conf.tmpl",
        include_str!("../../assets/templates/radiusd.conf.tmpl"),
    ),
    (
        "default.tmpl",
        include_str!("../../assets/templates/default.tmpl"),
    ),
    (
        "inner-tunnel.tmpl",
        include_str!("../../assets/templates/inner-tunnel.tmpl"),
    ),
    ("apn.tmpl", include_str!("../../assets/templates/apn.tmpl")),
    ("eap.tmpl", include_str!("../../assets/templates/eap.tmpl")),
    ("rest.tmpl", include_str!("../../assets/templates/rest.tmpl")),
    (
        "dynamic-clients.tmpl",
        include_str!("../../assets/templates/dynamic-clients.tmpl"),
    ),
    ("rip.tmpl", include_str!("../../assets/templates/rip.tmpl")),
    (
        "dynamic-clients.mods.tmpl",
        include_str!("../../assets/templates/dynamic-clients.mods.tmpl"),
    ),
];

/// Assets compiled into the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedAssets;

impl AssetProvider for EmbeddedAssets {
    fn list_files(&self) -> Vec<&str> {
        FILES.iter().map(|(path, _)| *path).collect()
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        FILES
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, content)| content.to_vec())
            .ok_or_else(|| anyhow!("no embedded file {path}"))
    }

    fn render_template(&self, name: &str, context: &TemplateContext) -> Result<String> {
        let (_, template) = TEMPLATES
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| anyhow!("no embedded template {name}"))?;

        render(name, template, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_placeholders() -> Result<()> {
        let mut context = TemplateContext::new();
        context.insert("port", "1812").insert("host", "127.0.0.1");

        let out = render("t", "listen {{host}}:{{ port }} ${confdir} %{User-Name}", &context)?;
        assert_eq!(out, "listen 127.0.0.1:1812 ${confdir} %{User-Name}");
        Ok(())
    }

    #[test]
    fn render_rejects_unknown_placeholder() {
        let context = TemplateContext::new();
        let err = render("radiusd.conf.tmpl", "x = {{missing}}", &context)
            .err()
            .map(|e| e.to_string());
        assert_eq!(
            err.as_deref(),
            Some("template radiusd.conf.tmpl: no value for missing")
        );
    }

    #[test]
    fn embedded_files_are_readable() -> Result<()> {
        let assets = EmbeddedAssets;
        for path in assets.list_files() {
            assert!(!assets.read_file(path)?.is_empty(), "{path} is empty");
        }
        assert!(assets.read_file("nope").is_err());
        Ok(())
    }

    #[test]
    fn unknown_template_is_an_error() {
        let assets = EmbeddedAssets;
        assert!(assets
            .render_template("missing.tmpl", &TemplateContext::new())
            .is_err());
    }

    #[test]
    fn template_without_values_fails() {
        let assets = EmbeddedAssets;
        assert!(assets
            .render_template("rest.tmpl", &TemplateContext::new())
            .is_err());
    }
}
