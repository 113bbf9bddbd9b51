//! Permission policy: decides which tool calls need a human decision.

use serde_json::Value;

use crate::config::{ApprovalConfig, ApprovalMode};

use super::ToolCategory;

/// How strongly a call needs approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalRequirement {
    /// Run without asking.
    Never,
    /// Ask, unless an earlier "approve always" covers the call's policy key.
    UnlessAutoApproved,
    /// Ask every time, ignoring remembered decisions.
    Always,
}

impl ApprovalRequirement {
    pub fn needs_approval(&self) -> bool {
        !matches!(self, ApprovalRequirement::Never)
    }
}

/// Seam between the tool manager and whatever decides approval needs.
pub trait PermissionPolicy: Send + Sync {
    fn requirement(
        &self,
        session_id: &str,
        tool_name: &str,
        category: ToolCategory,
        args: &Value,
    ) -> ApprovalRequirement;
}

/// Policy driven by the `approval` config section.
///
/// Per-tool lists win over the mode: `always_require` forces a prompt every
/// time, `always_allow` skips approval entirely.
#[derive(Debug, Clone, Default)]
pub struct ConfigPolicy {
    config: ApprovalConfig,
}

impl ConfigPolicy {
    pub fn new(config: ApprovalConfig) -> Self {
        Self { config }
    }
}

impl PermissionPolicy for ConfigPolicy {
    fn requirement(
        &self,
        _session_id: &str,
        tool_name: &str,
        category: ToolCategory,
        _args: &Value,
    ) -> ApprovalRequirement {
        if self.config.always_require.iter().any(|t| t == tool_name) {
            return ApprovalRequirement::Always;
        }
        if self.config.always_allow.iter().any(|t| t == tool_name) {
            return ApprovalRequirement::Never;
        }
        match self.config.mode {
            ApprovalMode::Never => ApprovalRequirement::Never,
            ApprovalMode::Always => ApprovalRequirement::UnlessAutoApproved,
            ApprovalMode::Categories if self.config.require_for.contains(&category) => {
                ApprovalRequirement::UnlessAutoApproved
            }
            ApprovalMode::Categories => ApprovalRequirement::Never,
        }
    }
}

/// Policy that never asks. Handy for tests and trusted batch runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionPolicy for AllowAll {
    fn requirement(&self, _: &str, _: &str, _: ToolCategory, _: &Value) -> ApprovalRequirement {
        ApprovalRequirement::Never
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(config: ApprovalConfig) -> ConfigPolicy {
        ConfigPolicy::new(config)
    }

    #[test]
    fn test_default_categories() {
        let p = policy(ApprovalConfig::default());
        assert_eq!(
            p.requirement("s", "read_file", ToolCategory::FilesystemRead, &json!({})),
            ApprovalRequirement::Never
        );
        assert_eq!(
            p.requirement("s", "delete_file", ToolCategory::FilesystemWrite, &json!({})),
            ApprovalRequirement::UnlessAutoApproved
        );
        assert!(p
            .requirement("s", "shell", ToolCategory::Shell, &json!({}))
            .needs_approval());
    }

    #[test]
    fn test_tool_lists_override_mode() {
        let p = policy(ApprovalConfig {
            always_allow: vec!["shell".into()],
            always_require: vec!["web_search".into()],
            ..Default::default()
        });
        assert_eq!(
            p.requirement("s", "shell", ToolCategory::Shell, &json!({})),
            ApprovalRequirement::Never
        );
        assert_eq!(
            p.requirement("s", "web_search", ToolCategory::NetworkRead, &json!({})),
            ApprovalRequirement::Always
        );
    }

    #[test]
    fn test_modes() {
        let never = policy(ApprovalConfig {
            mode: ApprovalMode::Never,
            ..Default::default()
        });
        assert!(!never
            .requirement("s", "rm", ToolCategory::Destructive, &json!({}))
            .needs_approval());

        let always = policy(ApprovalConfig {
            mode: ApprovalMode::Always,
            ..Default::default()
        });
        assert!(always
            .requirement("s", "read", ToolCategory::FilesystemRead, &json!({}))
            .needs_approval());
    }
}
