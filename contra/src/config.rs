use std::fs;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_FILE: &str = "contra.toml";

#[derive(Debug, Error, Diagnostic)]
#[error("config error: {message}")]
#[diagnostic(code(contra::config))]
pub struct ConfigError {
    pub message: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Legion,
    #[default]
    Kokkos,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Legion => "legion",
            BackendKind::Kokkos => "kokkos",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legion" => Ok(BackendKind::Legion),
            "kokkos" => Ok(BackendKind::Kokkos),
            other => Err(ConfigError {
                message: format!("unknown backend '{other}' (expected 'legion' or 'kokkos')"),
            }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendOptions {
    #[serde(default)]
    pub kind: BackendKind,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodegenOptions {
    /// Run the IR validator after each generated function.
    #[serde(default = "default_validate")]
    pub validate: bool,

    /// Log the IR of each generated function at debug level.
    #[serde(default)]
    pub dump_ir: bool,
}

fn default_validate() -> bool {
    true
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            validate: default_validate(),
            dump_ir: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeOptions {
    /// Handed to the runtime as its argv when the entry task starts.
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompileOptions {
    #[serde(default)]
    pub backend: BackendOptions,
    #[serde(default)]
    pub codegen: CodegenOptions,
    #[serde(default)]
    pub runtime: RuntimeOptions,
}

impl CompileOptions {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError {
            message: format!("failed to parse {CONFIG_FILE}: {e}"),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Loads the nearest `contra.toml` at or above `start`, or the defaults
    /// when there is none.
    pub fn discover(start: &Path) -> Result<Self, ConfigError> {
        match find_config(start) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}

pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut cur = if start.is_file() {
        start.parent()?.to_path_buf()
    } else {
        start.to_path_buf()
    };
    loop {
        let candidate = cur.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        cur = cur.parent()?.to_path_buf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let opts = CompileOptions::from_toml_str("").unwrap();
        assert_eq!(opts, CompileOptions::default());
        assert_eq!(opts.backend.kind, BackendKind::Kokkos);
        assert!(opts.codegen.validate);
        assert!(!opts.codegen.dump_ir);
    }

    #[test]
    fn full_file_parses() {
        let opts = CompileOptions::from_toml_str(
            r#"
            [backend]
            kind = "legion"

            [codegen]
            validate = false
            dump_ir = true

            [runtime]
            args = ["-ll:cpu", "4"]
            "#,
        )
        .unwrap();
        assert_eq!(opts.backend.kind, BackendKind::Legion);
        assert!(!opts.codegen.validate);
        assert!(opts.codegen.dump_ir);
        assert_eq!(opts.runtime.args, ["-ll:cpu", "4"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = CompileOptions::from_toml_str("[codegen]\noptimize = true\n").unwrap_err();
        assert!(err.message.contains("optimize"), "unexpected error: {err}");
        let err = CompileOptions::from_toml_str("[backend]\nkind = \"cuda\"\n").unwrap_err();
        assert!(err.message.contains("cuda"), "unexpected error: {err}");
    }

    #[test]
    fn backend_kind_from_str() {
        assert_eq!("legion".parse::<BackendKind>().unwrap(), BackendKind::Legion);
        assert!("Legion".parse::<BackendKind>().is_err());
    }
}
