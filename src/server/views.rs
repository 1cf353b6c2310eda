use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::Extension;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::server::app::{AppServer, Stage};
use crate::shared::store::query::get_path;
use crate::shared::store::Document;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("valid placeholder regex")
});

/// HTML templates loaded from the views directory, keyed by their path
/// relative to it without the `.html` extension (`pages/about`).
#[derive(Debug, Default)]
pub struct ViewEngine {
    dir: PathBuf,
    templates: HashMap<String, String>,
}

impl ViewEngine {
    pub fn load(dir: &Path) -> Result<Self> {
        let mut engine = Self {
            dir: dir.to_path_buf(),
            templates: HashMap::new(),
        };
        if !dir.is_dir() {
            warn!("Views directory {} not found, no templates loaded", dir.display());
            return Ok(engine);
        }

        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("html")
            {
                continue;
            }
            let Ok(relative) = path.strip_prefix(dir) else {
                continue;
            };
            let name = relative
                .with_extension("")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let source = std::fs::read_to_string(path)?;
            engine.templates.insert(name, source);
        }

        info!(
            "Loaded {} view templates from {}",
            engine.templates.len(),
            dir.display()
        );
        Ok(engine)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Fill `{{ key }}` placeholders from `context`. Dotted keys reach into
    /// nested objects; unknown keys render empty. Values are HTML escaped.
    pub fn render(&self, name: &str, context: &Document) -> Option<String> {
        let template = self.templates.get(name)?;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
            match get_path(context, &caps[1]) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => escape_html(s),
                Some(other) => escape_html(&other.to_string()),
            }
        });
        Some(rendered.into_owned())
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Step c: load templates and make the engine available to handlers.
pub fn add_views(server: &mut AppServer) -> Result<()> {
    server.expect_next(Stage::ViewsConfigured)?;

    let dir = server.resolve_path(&server.state().config.views.dir);
    let engine = Arc::new(ViewEngine::load(&dir)?);
    server.decorate(move |router| router.layer(Extension(engine)));

    server.advance(Stage::ViewsConfigured)?;
    Ok(())
}
