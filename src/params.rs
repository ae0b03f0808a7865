//! Project parameter document parsing and normalization.
//!
//! The parameter set is the project side of a build: sources, include and
//! library directories, defines, per-tool option values, thread hints and
//! RAM/ROM budgets, plus the pre/post build task hooks.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A parameter value as found in the document. Booleans and numbers are
/// normalized to their textual form at load so rendering only ever sees
/// strings or string sequences.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Single(String),
    Many(Vec<String>),
}

impl ParamValue {
    pub fn from_json(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => Some(ParamValue::Single(s.clone())),
            Value::Bool(b) => Some(ParamValue::Single(if *b { "true" } else { "false" }.into())),
            Value::Number(n) => Some(ParamValue::Single(n.to_string())),
            Value::Array(items) => {
                let strings = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                Some(ParamValue::Many(strings))
            }
            _ => None,
        }
    }

    /// Shape name used in type-mismatch diagnostics.
    pub fn shape(&self) -> &'static str {
        match self {
            ParamValue::Single(_) => "string",
            ParamValue::Many(_) => "array",
        }
    }

    pub fn as_single(&self) -> Option<&str> {
        match self {
            ParamValue::Single(s) => Some(s),
            ParamValue::Many(_) => None,
        }
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        ParamValue::from_json(&v).ok_or_else(|| {
            serde::de::Error::custom("parameter values must be strings, booleans, numbers or string arrays")
        })
    }
}

/// Option values for one tool, keyed like the model's option descriptors.
pub type OptionMap = HashMap<String, ParamValue>;

/// A pre/post build shell hook.
#[derive(Deserialize, Debug, Clone)]
pub struct TaskHook {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub disable: bool,
    /// Failure aborts the whole build.
    #[serde(default, rename = "stopBuildAfterFailed")]
    pub stop_build_after_failed: bool,
    /// Failure stops the remaining hooks but the build continues.
    #[serde(default, rename = "abortAfterFailed")]
    pub abort_after_failed: bool,
}

#[derive(Deserialize, Debug, Default)]
pub struct BuildOptions {
    #[serde(default)]
    pub global: OptionMap,
    #[serde(default, rename = "c/cpp-compiler")]
    pub c_cpp: OptionMap,
    #[serde(default, rename = "asm-compiler")]
    pub asm: OptionMap,
    #[serde(default)]
    pub linker: OptionMap,
    #[serde(default, rename = "beforeBuildTasks")]
    pub before_tasks: Vec<TaskHook>,
    #[serde(default, rename = "afterBuildTasks")]
    pub after_tasks: Vec<TaskHook>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProjectParams {
    /// Output base name for the link image and its derivatives.
    pub name: Option<String>,
    pub root_dir: PathBuf,
    /// Build output directory; relative paths resolve against `root_dir`.
    pub out_dir: PathBuf,
    /// Log and dependency-store directory; resolves against `root_dir`.
    pub dump_path: PathBuf,
    #[serde(default)]
    pub source_list: Vec<String>,
    #[serde(default)]
    pub inc_dirs: Vec<String>,
    #[serde(default)]
    pub lib_dirs: Vec<String>,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub thread_num: usize,
    /// RAM budget in bytes, for the usage bar after linking.
    #[serde(default)]
    pub ram: Option<u64>,
    /// ROM/flash budget in bytes.
    #[serde(default)]
    pub rom: Option<u64>,
    #[serde(default)]
    pub options: BuildOptions,
}

impl ProjectParams {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read project params '{}'", path.display()))?;
        let mut params: ProjectParams = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse project params '{}'", path.display()))?;
        params.normalize();
        Ok(params)
    }

    /// Resolve every relative path in the document against `root_dir`.
    fn normalize(&mut self) {
        let root = self.root_dir.clone();
        self.out_dir = absolutize(&root, &self.out_dir);
        self.dump_path = absolutize(&root, &self.dump_path);
        for dir in self.inc_dirs.iter_mut().chain(self.lib_dirs.iter_mut()) {
            *dir = absolutize(&root, Path::new(dir)).to_string_lossy().into_owned();
        }
    }

    pub fn out_name(&self) -> &str {
        self.name.as_deref().unwrap_or("main")
    }

    /// Option map for one tool key ("c", "cpp", "asm", "linker").
    pub fn tool_options(&self, tool: &str) -> &OptionMap {
        match tool {
            "c" | "cpp" => &self.options.c_cpp,
            "asm" => &self.options.asm,
            "linker" => &self.options.linker,
            _ => &self.options.global,
        }
    }

    /// Look a key up in the global map, then let the tool map override it.
    pub fn resolve_option(&self, tool: &str, key: &str) -> Option<&ParamValue> {
        let tool_map = self.tool_options(tool);
        tool_map.get(key).or_else(|| self.options.global.get(key))
    }

    pub fn source_paths(&self) -> Vec<PathBuf> {
        self.source_list
            .iter()
            .map(|s| absolutize(&self.root_dir, Path::new(s)))
            .collect()
    }
}

pub fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
