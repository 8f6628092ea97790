//! Site classification and static-server configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Document root inside the web-server container.
pub const WEB_CONTENT_ROOT: &str = "/usr/share/nginx/html";

/// Location of the generated server config inside the container.
pub const WEB_CONFIG_TARGET: &str = "/etc/nginx/conf.d/default.conf";

/// Port the web server listens on inside its container.
pub const WEB_CONTAINER_PORT: u16 = 80;

const NODE_ENTRIES: &[&str] = &[
    "server.js",
    "index.js",
    "app.js",
    "main.js",
    "server.mjs",
    "index.mjs",
];

/// Shape of a project's content, deciding how it is served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SiteKind {
    /// HTML entry point; unknown routes fall back to it
    SinglePage { index: String },
    /// Node entry script without HTML; sources are listed as plain text
    NodeSource { entry: String },
    /// Anything else; plain directory listing
    Directory,
}

fn is_root(path: &str) -> bool {
    !path.contains('/')
}

fn is_html(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
        .unwrap_or(false)
}

/// Classify content from its project-relative file paths.
pub fn classify<S: AsRef<str>>(paths: &[S]) -> SiteKind {
    let paths: Vec<&str> = paths.iter().map(|p| p.as_ref()).collect();

    if let Some(index) = paths.iter().find(|p| **p == "index.html") {
        return SiteKind::SinglePage {
            index: index.to_string(),
        };
    }

    // Shallowest HTML file, then alphabetical
    let mut html: Vec<&str> = paths.iter().copied().filter(|p| is_html(p)).collect();
    html.sort_by_key(|p| (p.matches('/').count(), p.to_string()));
    if let Some(index) = html.first() {
        return SiteKind::SinglePage {
            index: index.to_string(),
        };
    }

    let entry = NODE_ENTRIES
        .iter()
        .find(|name| paths.iter().any(|p| is_root(p) && p == *name));
    if let Some(entry) = entry {
        return SiteKind::NodeSource {
            entry: entry.to_string(),
        };
    }
    if paths.iter().any(|p| *p == "package.json") {
        return SiteKind::NodeSource {
            entry: "package.json".to_string(),
        };
    }

    SiteKind::Directory
}

const CACHE_HEADERS: &str = r#"    add_header Cache-Control "no-store, no-cache, must-revalidate, max-age=0" always;
    add_header Pragma "no-cache" always;
    expires off;
    etag off;
    if_modified_since off;
    sendfile off;
    open_file_cache off;
"#;

/// Generate the nginx server block for `kind`.
pub fn render_config(kind: &SiteKind) -> String {
    let mut config = String::new();
    config.push_str("server {\n");
    config.push_str(&format!("    listen {};\n", WEB_CONTAINER_PORT));
    config.push_str("    server_name _;\n");
    config.push_str(&format!("    root {};\n\n", WEB_CONTENT_ROOT));
    config.push_str(CACHE_HEADERS);
    config.push('\n');

    match kind {
        SiteKind::SinglePage { index } => {
            config.push_str(&format!("    index {};\n\n", index));
            config.push_str("    location / {\n");
            config.push_str(&format!("        try_files $uri $uri/ /{};\n", index));
            config.push_str("    }\n");
        }
        SiteKind::NodeSource { .. } => {
            config.push_str("    autoindex on;\n\n");
            config.push_str("    location / {\n");
            config.push_str("        try_files $uri $uri/ =404;\n");
            config.push_str("    }\n\n");
            config.push_str(
                "    location ~* \\.(js|mjs|cjs|ts|jsx|tsx|json|md|txt|lock)$ {\n",
            );
            config.push_str("        types { }\n");
            config.push_str("        default_type text/plain;\n");
            config.push_str("        charset utf-8;\n");
            config.push_str("    }\n");
        }
        SiteKind::Directory => {
            config.push_str("    autoindex on;\n\n");
            config.push_str("    location / {\n");
            config.push_str("        try_files $uri $uri/ =404;\n");
            config.push_str("    }\n");
        }
    }

    config.push_str("}\n");
    config
}
