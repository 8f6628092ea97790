//! Stack detection and image selection.
//!
//! A session's container image is chosen by inspecting the file names of
//! the materialized project.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::CommonImages;

/// Technology stack type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stack {
    Node,
    Python,
    Go,
    Rust,
    Java,
}

impl Stack {
    /// Get all stack variants.
    pub fn all() -> &'static [Stack] {
        &[Stack::Node, Stack::Python, Stack::Go, Stack::Rust, Stack::Java]
    }

    /// Detect the stack from project-relative file paths.
    ///
    /// Manifest files win over loose source files; Node is the default.
    pub fn detect<I, S>(paths: I) -> Stack
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut by_extension: Option<Stack> = None;

        for path in paths {
            let path = path.as_ref();
            let file_name = Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(path);

            match file_name {
                "package.json" => return Stack::Node,
                "requirements.txt" | "pyproject.toml" => return Stack::Python,
                "go.mod" => return Stack::Go,
                "Cargo.toml" => return Stack::Rust,
                "pom.xml" | "build.gradle" => return Stack::Java,
                _ => {}
            }

            if by_extension.is_none() {
                by_extension = match Path::new(file_name).extension().and_then(|e| e.to_str()) {
                    Some("py") => Some(Stack::Python),
                    Some("go") => Some(Stack::Go),
                    Some("rs") => Some(Stack::Rust),
                    Some("java") => Some(Stack::Java),
                    _ => None,
                };
            }
        }

        by_extension.unwrap_or(Stack::Node)
    }
}

impl std::fmt::Display for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Node => "node",
            Self::Python => "python",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Java => "java",
        };
        write!(f, "{}", name)
    }
}

/// Registry of stack images with override support.
#[derive(Debug, Clone)]
pub struct StackRegistry {
    images: HashMap<Stack, String>,
}

impl Default for StackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StackRegistry {
    /// Create a new registry with default images.
    pub fn new() -> Self {
        let mut images = HashMap::new();
        images.insert(Stack::Node, CommonImages::NODE.to_string());
        images.insert(Stack::Python, CommonImages::PYTHON.to_string());
        images.insert(Stack::Go, CommonImages::GO.to_string());
        images.insert(Stack::Rust, CommonImages::RUST.to_string());
        images.insert(Stack::Java, CommonImages::JAVA.to_string());
        Self { images }
    }

    /// Get image for a stack.
    pub fn image(&self, stack: Stack) -> &str {
        self.images
            .get(&stack)
            .map(String::as_str)
            .unwrap_or(CommonImages::NODE)
    }

    /// Set a custom image for a stack.
    pub fn set(&mut self, stack: Stack, image: impl Into<String>) {
        self.images.insert(stack, image.into());
    }

    /// Detect the stack for `paths` and return its image.
    pub fn select<I, S>(&self, paths: I) -> (Stack, String)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stack = Stack::detect(paths);
        (stack, self.image(stack).to_string())
    }
}
