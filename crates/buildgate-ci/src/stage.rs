//! Builtin cargo stages.

use buildgate_core::Stage;
use serde::{Deserialize, Serialize};

/// Builtin verification stages for Rust workspaces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStage {
    /// cargo fmt --all -- --check
    CargoFmt,

    /// cargo check --workspace --all-targets
    CargoCheck,

    /// cargo clippy --workspace --all-targets -- -D warnings
    CargoClippy,

    /// cargo test --workspace
    CargoTest,
}

impl BuiltinStage {
    pub const ALL: [BuiltinStage; 4] = [
        BuiltinStage::CargoFmt,
        BuiltinStage::CargoCheck,
        BuiltinStage::CargoClippy,
        BuiltinStage::CargoTest,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStage::CargoFmt => "cargo_fmt",
            BuiltinStage::CargoCheck => "cargo_check",
            BuiltinStage::CargoClippy => "cargo_clippy",
            BuiltinStage::CargoTest => "cargo_test",
        }
    }

    /// Get the stage's command line.
    pub fn command(&self) -> Vec<String> {
        let argv: &[&str] = match self {
            BuiltinStage::CargoFmt => &["cargo", "fmt", "--all", "--", "--check"],
            BuiltinStage::CargoCheck => &["cargo", "check", "--workspace", "--all-targets"],
            BuiltinStage::CargoClippy => &[
                "cargo",
                "clippy",
                "--workspace",
                "--all-targets",
                "--",
                "-D",
                "warnings",
            ],
            BuiltinStage::CargoTest => &["cargo", "test", "--workspace"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Rustup component the stage needs beyond a minimal toolchain.
    pub fn required_component(&self) -> Option<&'static str> {
        match self {
            BuiltinStage::CargoFmt => Some("rustfmt"),
            BuiltinStage::CargoClippy => Some("clippy"),
            _ => None,
        }
    }

    /// Build a pipeline stage for this builtin.
    pub fn to_stage(&self) -> Stage {
        Stage::new(self.name(), self.command())
    }
}

impl std::fmt::Display for BuiltinStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BuiltinStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let name = name.strip_prefix("cargo_").unwrap_or(&name);
        match name {
            "fmt" => Ok(BuiltinStage::CargoFmt),
            "check" => Ok(BuiltinStage::CargoCheck),
            "clippy" => Ok(BuiltinStage::CargoClippy),
            "test" => Ok(BuiltinStage::CargoTest),
            _ => Err(format!(
                "unknown stage {s:?} (expected one of: fmt, check, clippy, test)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_stage_names() {
        assert_eq!(BuiltinStage::CargoFmt.name(), "cargo_fmt");
        assert_eq!(BuiltinStage::CargoCheck.name(), "cargo_check");
        assert_eq!(BuiltinStage::CargoClippy.name(), "cargo_clippy");
        assert_eq!(BuiltinStage::CargoTest.name(), "cargo_test");
    }

    #[test]
    fn test_builtin_stage_commands() {
        let fmt_cmd = BuiltinStage::CargoFmt.command();
        assert_eq!(fmt_cmd[0], "cargo");
        assert!(fmt_cmd.contains(&"--check".to_string()));

        let clippy_cmd = BuiltinStage::CargoClippy.command();
        assert_eq!(clippy_cmd.last().map(String::as_str), Some("warnings"));
    }

    #[test]
    fn test_required_components() {
        assert_eq!(BuiltinStage::CargoFmt.required_component(), Some("rustfmt"));
        assert_eq!(BuiltinStage::CargoClippy.required_component(), Some("clippy"));
        assert!(BuiltinStage::CargoTest.required_component().is_none());
    }

    #[test]
    fn test_to_stage() {
        let stage = BuiltinStage::CargoTest.to_stage();
        assert_eq!(stage.name, "cargo_test");
        assert_eq!(stage.command_line(), "cargo test --workspace");
        assert!(!stage.continue_on_failure);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("fmt".parse::<BuiltinStage>().unwrap(), BuiltinStage::CargoFmt);
        assert_eq!(
            "cargo_clippy".parse::<BuiltinStage>().unwrap(),
            BuiltinStage::CargoClippy
        );
        assert_eq!(" Test ".parse::<BuiltinStage>().unwrap(), BuiltinStage::CargoTest);
        assert!("bench".parse::<BuiltinStage>().is_err());
    }
}
