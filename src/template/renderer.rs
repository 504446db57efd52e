use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::config::TemplateConfig;
use crate::metrics::TemplateMetrics;

use super::exec::Executor;
use super::{Template, TemplateError, TemplateResult, MAX_INCLUDE_DEPTH};

/// Layers of percent-encoding undone before a name is checked
const MAX_DECODE_ROUNDS: usize = 3;

/// Loads, caches and executes templates from a root directory.
///
/// Each name maps to a cell that is filled at most once, so concurrent first
/// renders of the same template share a single load.
pub struct Renderer {
    root: PathBuf,
    strict: bool,
    cache: DashMap<String, Arc<OnceCell<Arc<Template>>>>,
}

impl Renderer {
    pub fn new(config: &TemplateConfig) -> TemplateResult<Self> {
        Self::with_root(&config.dir, config.strict)
    }

    /// Create the root directory if needed and pin its canonical path.
    pub fn with_root(root: impl AsRef<Path>, strict: bool) -> TemplateResult<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self {
            root,
            strict,
            cache: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Render a named template, HTML-escaping every interpolated value.
    #[tracing::instrument(name = "template.render", skip(self, data))]
    pub async fn render(&self, name: &str, data: &Value) -> TemplateResult<String> {
        self.render_named(name, data, true).await
    }

    /// Render a named template without escaping, for plain-text channels.
    #[tracing::instrument(name = "template.render_text", skip(self, data))]
    pub async fn render_text(&self, name: &str, data: &Value) -> TemplateResult<String> {
        self.render_named(name, data, false).await
    }

    /// Render template source supplied by the caller, HTML-escaped.
    pub async fn render_string(&self, source: &str, data: &Value) -> TemplateResult<String> {
        self.render_source(source, data, true).await
    }

    /// Render template source supplied by the caller without escaping.
    pub async fn render_string_text(&self, source: &str, data: &Value) -> TemplateResult<String> {
        self.render_source(source, data, false).await
    }

    /// Parse `source` and cache it under `name`, replacing any cached entry.
    pub fn compile(&self, name: &str, source: &str) -> TemplateResult<()> {
        check_name(name)?;
        let template = Template::parse(name, source)?;
        self.cache.insert(
            name.to_string(),
            Arc::new(OnceCell::new_with(Some(Arc::new(template)))),
        );
        TemplateMetrics::set_cache_size(self.cache_len());
        Ok(())
    }

    /// Relative names of all regular files under the root, sorted.
    pub async fn list_templates(&self) -> TemplateResult<Vec<String>> {
        let mut names = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        let name = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        names.push(name);
                    }
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Number of parsed templates held in the cache.
    pub fn cache_len(&self) -> usize {
        self.cache
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cached(name).is_some()
    }

    async fn render_named(&self, name: &str, data: &Value, escape: bool) -> TemplateResult<String> {
        let result = match self.load(name).await {
            Ok(template) => self.execute(&template, data, escape).await,
            Err(e) => Err(e),
        };
        if let Err(ref e) = result {
            tracing::debug!(template = %name, error = %e, "Template render failed");
        }
        TemplateMetrics::record_render(escape, result.is_ok());
        result
    }

    async fn render_source(&self, source: &str, data: &Value, escape: bool) -> TemplateResult<String> {
        let result = match Template::parse("inline", source) {
            Ok(template) => self.execute(&template, data, escape).await,
            Err(e) => Err(e),
        };
        TemplateMetrics::record_render(escape, result.is_ok());
        result
    }

    async fn execute(&self, template: &Template, data: &Value, escape: bool) -> TemplateResult<String> {
        self.preload_includes(template).await?;

        let lookup = |name: &str| self.cached(name);
        Executor {
            escape,
            strict: self.strict,
            includes: &lookup,
        }
        .run(template, data)
    }

    /// Load every template reachable through includes, breadth first, so
    /// execution itself never touches the filesystem.
    async fn preload_includes(&self, template: &Template) -> TemplateResult<()> {
        let mut seen = HashSet::new();
        let mut frontier: VecDeque<(String, usize)> =
            template.includes().into_iter().map(|n| (n, 1)).collect();

        while let Some((name, depth)) = frontier.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let included = self.load(&name).await?;
            if depth < MAX_INCLUDE_DEPTH {
                frontier.extend(included.includes().into_iter().map(|n| (n, depth + 1)));
            }
        }
        Ok(())
    }

    fn cached(&self, name: &str) -> Option<Arc<Template>> {
        self.cache.get(name).and_then(|cell| cell.get().cloned())
    }

    async fn load(&self, name: &str) -> TemplateResult<Arc<Template>> {
        check_name(name)?;
        if let Some(template) = self.cached(name) {
            return Ok(template);
        }

        let cell = self.cache.entry(name.to_string()).or_default().clone();
        let loaded = cell
            .get_or_try_init(|| async { self.read_and_parse(name).await.map(Arc::new) })
            .await
            .cloned();

        match loaded {
            Ok(template) => {
                TemplateMetrics::set_cache_size(self.cache_len());
                Ok(template)
            }
            Err(e) => {
                // Keep failed names out of the cache
                self.cache.remove_if(name, |_, cell| !cell.initialized());
                Err(e)
            }
        }
    }

    async fn read_and_parse(&self, name: &str) -> TemplateResult<Template> {
        let path = self.root.join(name);
        let canonical = tokio::fs::canonicalize(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => TemplateError::NotFound(name.to_string()),
            _ => TemplateError::Io(e),
        })?;
        if !canonical.starts_with(&self.root) {
            tracing::warn!(template = %name, "Template resolves outside the template root");
            return Err(TemplateError::PathEscape(name.to_string()));
        }

        let source = tokio::fs::read_to_string(&canonical).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => TemplateError::NotFound(name.to_string()),
            _ => TemplateError::Io(e),
        })?;

        tracing::debug!(template = %name, bytes = source.len(), "Template loaded");
        Template::parse(name, &source)
    }
}

/// Reject names that could leave the root, including percent-encoded forms.
fn check_name(name: &str) -> TemplateResult<()> {
    if name.is_empty() {
        return Err(TemplateError::NotFound(String::new()));
    }

    let mut candidate = name.to_string();
    for _ in 0..MAX_DECODE_ROUNDS {
        if escapes_root(&candidate) {
            return Err(TemplateError::PathEscape(name.to_string()));
        }
        match urlencoding::decode(&candidate) {
            Ok(decoded) if decoded == candidate => return Ok(()),
            Ok(decoded) => candidate = decoded.into_owned(),
            Err(_) => return Err(TemplateError::PathEscape(name.to_string())),
        }
    }

    if escapes_root(&candidate) || candidate.contains('%') {
        return Err(TemplateError::PathEscape(name.to_string()));
    }
    Ok(())
}

fn escapes_root(name: &str) -> bool {
    let path = Path::new(name);
    name.contains('\\')
        || name.contains('\0')
        || path.is_absolute()
        || !path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer_with(files: &[(&str, &str)]) -> (tempfile::TempDir, Renderer) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        let renderer = Renderer::with_root(dir.path(), true).unwrap();
        (dir, renderer)
    }

    #[tokio::test]
    async fn test_render_welcome() {
        let (_dir, renderer) = renderer_with(&[("welcome.html", "Hello, {{.name}}!")]);

        let out = renderer.render("welcome.html", &json!({"name": "Ann"})).await.unwrap();

        assert_eq!(out, "Hello, Ann!");
        assert!(renderer.is_cached("welcome.html"));
        assert_eq!(renderer.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_render_is_idempotent_after_caching() {
        let (dir, renderer) = renderer_with(&[("welcome.html", "Hello, {{.name}}!")]);
        let data = json!({"name": "Ann"});

        let first = renderer.render("welcome.html", &data).await.unwrap();
        // Cached form is reused even if the file changes
        std::fs::write(dir.path().join("welcome.html"), "changed").unwrap();
        let second = renderer.render("welcome.html", &data).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.txt"), "top secret").unwrap();
        let root = dir.path().join("templates");
        let renderer = Renderer::with_root(&root, true).unwrap();

        for name in [
            "../secret.txt",
            "../../etc/passwd",
            "a/../../secret.txt",
            "/etc/passwd",
            "..\\secret.txt",
            "%2e%2e/secret.txt",
            "%2E%2E%2Fsecret.txt",
            "..%2fsecret.txt",
            "%252e%252e%252fsecret.txt",
            "./secret.txt",
            "secret.txt\0",
        ] {
            let err = renderer.render(name, &json!({})).await.unwrap_err();
            assert!(
                matches!(err, TemplateError::PathEscape(_)),
                "{name:?} should be rejected, got {err:?}"
            );
        }
        assert_eq!(renderer.cache_len(), 0);
        assert!(renderer.cache.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_root_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "top secret").unwrap();
        let (dir, renderer) = renderer_with(&[]);
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.html"))
            .unwrap();

        let err = renderer.render("link.html", &json!({})).await.unwrap_err();

        assert!(matches!(err, TemplateError::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_missing_template_is_not_found() {
        let (_dir, renderer) = renderer_with(&[]);

        let err = renderer.render("nope.html", &json!({})).await.unwrap_err();

        assert!(matches!(err, TemplateError::NotFound(ref n) if n == "nope.html"));
        assert!(renderer.cache.is_empty());
    }

    #[tokio::test]
    async fn test_include_resolves_inside_root() {
        let (_dir, renderer) = renderer_with(&[
            ("partials/header.html", "<h1>{{.title}}</h1>"),
            ("page.html", r#"{{include "partials/header.html"}}<p>{{.body}}</p>"#),
        ]);

        let out = renderer
            .render("page.html", &json!({"title": "Hi & bye", "body": "<b>x</b>"}))
            .await
            .unwrap();

        assert_eq!(out, "<h1>Hi &amp; bye</h1><p>&lt;b&gt;x&lt;/b&gt;</p>");
        assert_eq!(renderer.cache_len(), 2);
    }

    #[tokio::test]
    async fn test_include_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.txt"), "top secret").unwrap();
        let root = dir.path().join("templates");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("evil.html"), r#"{{include "../secret.txt"}}"#).unwrap();
        let renderer = Renderer::with_root(&root, true).unwrap();

        let err = renderer.render("evil.html", &json!({})).await.unwrap_err();
        assert!(matches!(err, TemplateError::PathEscape(_)));

        let err = renderer
            .render_string(r#"{{include "%2e%2e/secret.txt"}}"#, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TemplateError::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_recursive_include_fails() {
        let (_dir, renderer) = renderer_with(&[
            ("a.html", r#"a{{include "b.html"}}"#),
            ("b.html", r#"b{{include "a.html"}}"#),
        ]);

        let err = renderer.render("a.html", &json!({})).await.unwrap_err();

        assert!(matches!(err, TemplateError::Execution(_)));
    }

    #[tokio::test]
    async fn test_render_string_modes() {
        let (_dir, renderer) = renderer_with(&[]);
        let data = json!({"x": "<i>hi</i>"});

        let html = renderer.render_string("{{.x}}", &data).await.unwrap();
        let text = renderer.render_string_text("{{.x}}", &data).await.unwrap();

        assert_eq!(html, "&lt;i&gt;hi&lt;/i&gt;");
        assert_eq!(text, "<i>hi</i>");
        // Inline templates are not cached
        assert_eq!(renderer.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_compile_registers_inline_template() {
        let (_dir, renderer) = renderer_with(&[]);

        renderer.compile("greeting", "Hi {{.name | upper}}").unwrap();
        let out = renderer.render_text("greeting", &json!({"name": "ann"})).await.unwrap();

        assert_eq!(out, "Hi ANN");
        assert!(renderer.compile("../x", "y").is_err());
        assert!(matches!(
            renderer.compile("bad", "{{exec \"id\"}}"),
            Err(TemplateError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_list_templates() {
        let (_dir, renderer) = renderer_with(&[
            ("welcome.html", "x"),
            ("partials/footer.html", "y"),
            ("alert.txt", "z"),
        ]);

        let names = renderer.list_templates().await.unwrap();

        assert_eq!(names, vec!["alert.txt", "partials/footer.html", "welcome.html"]);
    }

    #[tokio::test]
    async fn test_concurrent_first_loads_share_one_entry() {
        let (_dir, renderer) = renderer_with(&[("welcome.html", "Hello, {{.name}}!")]);
        let renderer = Arc::new(renderer);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let renderer = renderer.clone();
                tokio::spawn(async move {
                    renderer
                        .render("welcome.html", &json!({"name": format!("user{i}")}))
                        .await
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), format!("Hello, user{i}!"));
        }
        assert_eq!(renderer.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_permissive_mode_renders_missing_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t.txt"), "[{{.missing}}]").unwrap();
        let renderer = Renderer::with_root(dir.path(), false).unwrap();

        assert_eq!(renderer.render("t.txt", &json!({})).await.unwrap(), "[]");
    }
}
