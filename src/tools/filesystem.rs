//! Filesystem tools
//!
//! Read, write, list and delete files under the workspace configured in
//! `tools.workspace`. Paths are resolved relative to the workspace and may
//! not leave it; without a workspace every call fails.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{ConduitError, Result};

use super::{Tool, ToolCategory, ToolContext, ToolOutput};

/// Resolve `path` inside `workspace` without touching the filesystem.
///
/// `..` components are applied lexically; a path that climbs out of the
/// workspace is rejected, as is an absolute path outside it.
///
/// ```
/// use conduit::tools::filesystem::resolve_in_workspace;
///
/// let p = resolve_in_workspace("notes/../todo.md", "/ws").unwrap();
/// assert_eq!(p, std::path::PathBuf::from("/ws/todo.md"));
/// assert!(resolve_in_workspace("../etc/passwd", "/ws").is_err());
/// ```
pub fn resolve_in_workspace(path: &str, workspace: &str) -> Result<PathBuf> {
    let root = normalize(Path::new(workspace));
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(escape_error(path));
                }
            }
            Component::CurDir => {}
            other => resolved.push(other.as_os_str()),
        }
    }
    if !resolved.starts_with(&root) {
        return Err(escape_error(path));
    }
    Ok(resolved)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn escape_error(path: &str) -> ConduitError {
    ConduitError::Validation(format!("Path '{}' is outside the workspace", path))
}

fn resolve_path(args: &Value, ctx: &ToolContext) -> Result<PathBuf> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| ConduitError::Tool("Missing 'path' argument".into()))?;
    let workspace = ctx.workspace.as_deref().ok_or_else(|| {
        ConduitError::Tool("Workspace not configured; filesystem tools require one".into())
    })?;
    resolve_in_workspace(path, workspace)
}

/// `<tool>:<parent dir>`, so "always allow" covers one directory.
fn directory_policy_key(tool: &str, args: &Value) -> String {
    let parent = args
        .get("path")
        .and_then(Value::as_str)
        .and_then(|p| Path::new(p).parent())
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());
    format!("{}:{}", tool, parent)
}

fn path_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": {
                "type": "string",
                "description": description
            }
        },
        "required": ["path"]
    })
}

/// Read a text file.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the specified path"
    }

    fn parameters(&self) -> Value {
        path_schema("The path to the file to read")
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemRead
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let full_path = resolve_path(&args, ctx)?;
        let content = tokio::fs::read_to_string(&full_path).await.map_err(|e| {
            ConduitError::Tool(format!(
                "Failed to read file '{}': {}",
                full_path.display(),
                e
            ))
        })?;
        Ok(ToolOutput::text(content))
    }
}

/// Write a file, creating parent directories as needed.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file at the specified path, creating it if necessary"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The path to the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemWrite
    }

    fn policy_key(&self, args: &Value) -> String {
        directory_policy_key(self.name(), args)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let full_path = resolve_path(&args, ctx)?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ConduitError::Tool("Missing 'content' argument".into()))?;

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ConduitError::Tool(format!("Failed to create parent directories: {}", e))
            })?;
        }
        tokio::fs::write(&full_path, content).await.map_err(|e| {
            ConduitError::Tool(format!(
                "Failed to write file '{}': {}",
                full_path.display(),
                e
            ))
        })?;

        Ok(ToolOutput::split(
            json!({"path": full_path.to_string_lossy(), "bytes": content.len()}),
            format!(
                "Successfully wrote {} bytes to {}",
                content.len(),
                full_path.display()
            ),
        ))
    }
}

/// List a directory, one entry per line; directories end in `/`.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a directory at the specified path"
    }

    fn parameters(&self) -> Value {
        path_schema("The path to the directory to list")
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemRead
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let full_path = resolve_path(&args, ctx)?;
        let mut entries = tokio::fs::read_dir(&full_path).await.map_err(|e| {
            ConduitError::Tool(format!(
                "Failed to read directory '{}': {}",
                full_path.display(),
                e
            ))
        })?;

        let mut items = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ConduitError::Tool(format!("Failed to read directory entry: {}", e)))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let suffix = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => "/",
                Ok(ft) if ft.is_symlink() => "@",
                _ => "",
            };
            items.push(format!("{}{}", name, suffix));
        }
        items.sort();
        Ok(ToolOutput::split(json!(items), items.join("\n")))
    }
}

/// Delete a single file. Directories are refused.
pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete the file at the specified path"
    }

    fn parameters(&self) -> Value {
        path_schema("The path to the file to delete")
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Destructive
    }

    fn policy_key(&self, args: &Value) -> String {
        directory_policy_key(self.name(), args)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let full_path = resolve_path(&args, ctx)?;
        let metadata = tokio::fs::metadata(&full_path).await.map_err(|e| {
            ConduitError::Tool(format!("Cannot delete '{}': {}", full_path.display(), e))
        })?;
        if metadata.is_dir() {
            return Err(ConduitError::Tool(format!(
                "'{}' is a directory",
                full_path.display()
            )));
        }
        tokio::fs::remove_file(&full_path).await.map_err(|e| {
            ConduitError::Tool(format!(
                "Failed to delete '{}': {}",
                full_path.display(),
                e
            ))
        })?;
        Ok(ToolOutput::text(format!("Deleted {}", full_path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new("s1", "c1").with_workspace(&dir.to_string_lossy())
    }

    #[test]
    fn test_resolve_in_workspace() {
        assert_eq!(
            resolve_in_workspace("a/./b.txt", "/ws").unwrap(),
            PathBuf::from("/ws/a/b.txt")
        );
        assert_eq!(
            resolve_in_workspace("/ws/x", "/ws/").unwrap(),
            PathBuf::from("/ws/x")
        );
        assert!(resolve_in_workspace("a/../../x", "/ws").is_err());
        assert!(resolve_in_workspace("/etc/passwd", "/ws").is_err());
        assert!(resolve_in_workspace("/wsx/file", "/ws").is_err());
    }

    #[test]
    fn test_directory_policy_key() {
        assert_eq!(
            directory_policy_key("delete_file", &json!({"path": "logs/a.log"})),
            "delete_file:logs"
        );
        assert_eq!(
            directory_policy_key("delete_file", &json!({"path": "a.log"})),
            "delete_file:."
        );
    }

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let dir = tempdir().unwrap();
        let ctx = ctx(dir.path());

        let out = WriteFileTool
            .execute(json!({"path": "sub/note.txt", "content": "hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.raw["bytes"], 5);

        let out = ReadFileTool
            .execute(json!({"path": "sub/note.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.raw, json!("hello"));

        let out = ListDirTool.execute(json!({"path": "."}), &ctx).await.unwrap();
        assert_eq!(out.raw, json!(["sub/"]));

        DeleteFileTool
            .execute(json!({"path": "sub/note.txt"}), &ctx)
            .await
            .unwrap();
        assert!(!dir.path().join("sub/note.txt").exists());
    }

    #[tokio::test]
    async fn test_delete_refuses_directory() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("keep")).unwrap();
        let err = DeleteFileTool
            .execute(json!({"path": "keep"}), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is a directory"));
    }

    #[tokio::test]
    async fn test_requires_workspace() {
        let err = ReadFileTool
            .execute(json!({"path": "a.txt"}), &ToolContext::new("s1", "c1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Workspace not configured"));
    }

    #[tokio::test]
    async fn test_traversal_blocked() {
        let dir = tempdir().unwrap();
        let err = ReadFileTool
            .execute(json!({"path": "../../etc/passwd"}), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::Validation(_)));
    }
}
