//! Template rendering

use serde_json::Value;
use std::path::Path;
use tera::{Context, Tera};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("template data must be a JSON object")]
    NotAnObject,
}

/// Turns a template name and a data map into page bytes.
pub trait Renderer: Send + Sync {
    fn render(&self, name: &str, data: &Value) -> Result<Vec<u8>, RenderError>;
}

const BASE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{% block title %}{{ ctx.site.title }}{% endblock title %}</title>
</head>
<body>
{% block content %}{% endblock content %}
</body>
</html>"#;

const ERROR_PAGE: &str = r#"{% extends "_base.html" %}
{% block title %}{{ code }} | {{ ctx.site.title }}{% endblock title %}
{% block content %}
    <h1>{{ code }}</h1>
    <p>{{ message }}</p>
{% endblock content %}"#;

const INDEX_PAGE: &str = r#"{% extends "_base.html" %}
{% block content %}
    <h1>{{ ctx.site.title }}</h1>
    <p>{{ ctx.site.description }}</p>
    {% for flash in flashes %}<p class="flash">{{ flash }}</p>{% endfor %}
    {% if ctx.user %}<p>Welcome back, {{ ctx.user.display_name | default(value=ctx.user.username) }}.</p>{% endif %}
{% endblock content %}"#;

const STATS_PAGE: &str = r#"{% extends "_base.html" %}
{% block title %}Statistics | {{ ctx.site.title }}{% endblock title %}
{% block content %}
    <h1>Statistics</h1>
    <p>{{ requests }} requests, {{ bytes }} bytes served since records began.</p>
    <p>{{ session_requests }} requests, {{ session_bytes }} bytes served in the last {{ uptime_secs }} seconds.</p>
    <h2>Paths</h2>
    <table>{% for p in paths %}<tr><td>{{ p.name }}</td><td>{{ p.count }}</td></tr>{% endfor %}</table>
    <h2>Referrers</h2>
    <table>{% for r in referrers %}<tr><td>{{ r.name }}</td><td>{{ r.count }}</td></tr>{% endfor %}</table>
{% endblock content %}"#;

/// Tera-backed renderer with built-in pages, overridable from a directory.
pub struct TeraRenderer {
    tera: Tera,
}

impl TeraRenderer {
    pub fn new(dir: Option<&Path>) -> Result<Self, RenderError> {
        let mut builtin = Tera::default();
        builtin.add_raw_templates(vec![
            ("_base.html", BASE),
            ("_error.html", ERROR_PAGE),
            ("pages/index.html", INDEX_PAGE),
            ("pages/stats.html", STATS_PAGE),
        ])?;

        let Some(dir) = dir else {
            return Ok(Self { tera: builtin });
        };

        // Parse only: pages may extend built-in layouts that are not merged
        // in yet. `extend` keeps templates already present, so the directory
        // wins, then builds the inheritance chains over both sets.
        let glob = dir.join("**").join("*.html");
        let mut tera = Tera::parse(&glob.to_string_lossy())?;
        info!(
            "Loaded {} templates from {}",
            tera.get_template_names().count(),
            dir.display()
        );
        tera.extend(&builtin)?;
        Ok(Self { tera })
    }
}

impl Renderer for TeraRenderer {
    fn render(&self, name: &str, data: &Value) -> Result<Vec<u8>, RenderError> {
        if !data.is_object() {
            return Err(RenderError::NotAnObject);
        }
        let context = Context::from_value(data.clone())?;
        Ok(self.tera.render(name, &context)?.into_bytes())
    }
}
