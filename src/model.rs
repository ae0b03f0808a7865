//! Compiler model document parsing and validation.
//!
//! A compiler model is a JSON document describing one toolchain's command-line
//! grammar: per-tool option descriptors plus `$`-prefixed reserved keys for
//! tool-wide configuration (executable path, output template, invoke mode,
//! include/define/lib block formats, post-link steps, map matchers).
//!
//! Everything structural is checked here, before any command is rendered:
//! a broken descriptor must fail the build at load time, not mid-compile.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Rendering format for an include/define/lib block (`$includes` etc.).
#[derive(Deserialize, Debug, Clone)]
pub struct CmdFormat {
    #[serde(default)]
    pub prefix: String,
    pub body: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default = "default_sep")]
    pub sep: String,
    #[serde(default, rename = "noQuotes")]
    pub no_quotes: bool,
}

fn default_sep() -> String {
    " ".to_string()
}

/// How a tool receives its command line. Decided once at load time.
#[derive(Debug, Clone)]
pub enum InvokeMode {
    /// Arguments passed directly on the process command line.
    Inline,
    /// Command text written to a response file; the process gets the
    /// template with `${value}` replaced by the quoted file path.
    ResponseFile { template: String },
}

#[derive(Deserialize)]
struct RawInvoke {
    #[serde(default, rename = "useFile")]
    use_file: bool,
    body: Option<String>,
}

/// Text encoding used when writing response files for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// UTF-8 without BOM.
    Utf8,
    /// UTF-16 little endian.
    Utf16,
    /// System ANSI codepage (approximated as Windows-1252).
    Ansi,
}

impl TextEncoding {
    fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "utf8" | "utf-8" => TextEncoding::Utf8,
            "utf16" | "utf-16" => TextEncoding::Utf16,
            _ => TextEncoding::Ansi,
        }
    }
}

/// One non-reserved model entry: how to turn a parameter value into a
/// command-line fragment.
#[derive(Deserialize, Debug, Clone)]
pub struct OptionDescriptor {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(flatten)]
    pub kind: OptionKind,
}

/// The four descriptor shapes. Exhaustive matching at render time replaces
/// the original's runtime type-tag checks.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum OptionKind {
    /// Boolean-like: maps a value to one of a fixed set of fragments,
    /// falling back to the mandatory `"false"` entry.
    #[serde(rename = "selectable")]
    Selectable { command: HashMap<String, String> },
    /// Enumerated: `command` prefix plus the matched (or `"default"`) entry.
    #[serde(rename = "keyValue")]
    KeyValue {
        command: String,
        #[serde(rename = "enum")]
        variants: HashMap<String, String>,
    },
    /// `command` prefix concatenated with a user string.
    #[serde(rename = "value")]
    Value { command: String },
    /// `command` prefix concatenated with each element of a sequence.
    #[serde(rename = "list")]
    List { command: String },
}

/// A per-dialect descriptor (`$language-c` / `$language-cpp`) with the flag
/// patterns a project may strip from the assembled command.
#[derive(Deserialize, Debug, Clone)]
pub struct LanguageOption {
    #[serde(flatten)]
    pub option: OptionDescriptor,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// One `$outputBin` entry: a tool run after linking to extract hex/bin.
#[derive(Deserialize, Debug, Clone)]
pub struct PostLinkStep {
    pub name: String,
    #[serde(rename = "toolPath")]
    pub tool_path: String,
    #[serde(default, rename = "outputSuffix")]
    pub output_suffix: String,
    pub command: String,
}

/// One `$extraCommand` entry: a vendor post-processor run on the link image.
#[derive(Deserialize, Debug, Clone)]
pub struct ExtraCommand {
    pub name: Option<String>,
    #[serde(rename = "toolPath")]
    pub tool_path: String,
    pub command: String,
}

/// Placement of the stable fragment relative to the object list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdLocation {
    Start,
    End,
}

/// One tool group after load: reserved keys lifted into typed fields,
/// non-reserved keys kept as ordered option descriptors.
#[derive(Debug, Clone)]
pub struct ToolModel {
    pub tool_path: String,
    pub encoding: TextEncoding,
    pub invoke: InvokeMode,
    pub output_template: String,
    pub output_suffix: Option<String>,
    pub quote_paths: bool,
    pub defaults: Vec<String>,
    pub default_tail: Vec<String>,
    pub includes_format: Option<CmdFormat>,
    pub defines_format: Option<CmdFormat>,
    pub libs_format: Option<CmdFormat>,
    pub language_c: Option<LanguageOption>,
    pub language_cpp: Option<LanguageOption>,
    pub list_path: Option<OptionDescriptor>,
    pub link_map: Option<OptionDescriptor>,
    pub map_suffix: String,
    pub command_location: CmdLocation,
    pub obj_path_sep: String,
    pub main_first: bool,
    pub lib_flags: Option<OptionDescriptor>,
    pub post_link: Vec<PostLinkStep>,
    pub extra_commands: Vec<ExtraCommand>,
    pub map_matchers: Vec<String>,
    pub ram_matcher: Option<String>,
    pub rom_matcher: Option<String>,
    /// Non-reserved options in declaration order (globals merged in front).
    pub options: Vec<(String, OptionDescriptor)>,
}

/// A whole compiler model document.
#[derive(Debug)]
pub struct CompilerModel {
    pub name: String,
    pub id: String,
    pub tool_prefix: String,
    pub use_unix_path: bool,
    pub err_level: i32,
    /// Defines the model itself contributes to every project using it.
    pub extra_defines: Vec<String>,
    groups: HashMap<String, ToolModel>,
}

impl CompilerModel {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read compiler model '{}'", path.display()))?;
        let root: Value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse compiler model '{}'", path.display()))?;
        Self::from_json(&root)
            .with_context(|| format!("invalid compiler model '{}'", path.display()))
    }

    pub fn from_json(root: &Value) -> Result<Self> {
        let obj = root
            .as_object()
            .ok_or_else(|| anyhow!("model root must be an object"))?;

        let name = str_field(obj, "name").unwrap_or("null").to_string();
        let id = str_field(obj, "id").unwrap_or(&name).to_string();
        let tool_prefix = str_field(obj, "toolPrefix").unwrap_or("").to_string();
        let use_unix_path = obj
            .get("useUnixPath")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let err_level = obj
            .get("ERR_LEVEL")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        let extra_defines = string_array(obj.get("defines"));

        let raw_groups = obj
            .get("groups")
            .and_then(Value::as_object)
            .ok_or_else(|| anyhow!("model has no 'groups' object"))?;

        let mut groups = HashMap::new();
        for (group_name, group_val) in raw_groups {
            let tool = parse_group(group_val)
                .with_context(|| format!("in tool group '{}'", group_name))?;
            groups.insert(group_name.clone(), tool);
        }

        // Merge global options into the front of each named group. Inserting
        // at index 0 per entry reverses the globals among themselves, which
        // matches the reference behavior downstream code depends on.
        if let Some(globals) = obj.get("global").and_then(Value::as_object) {
            for (key, val) in globals {
                let targets = val
                    .get("group")
                    .and_then(Value::as_array)
                    .ok_or_else(|| anyhow!("no 'group' list in global option '{}'", key))?;
                let desc: OptionDescriptor = serde_json::from_value(val.clone())
                    .with_context(|| format!("bad descriptor for global option '{}'", key))?;
                validate_descriptor(key, &desc)?;
                for target in targets.iter().filter_map(Value::as_str) {
                    if let Some(tool) = groups.get_mut(target) {
                        tool.options.insert(0, (key.clone(), desc.clone()));
                    }
                }
            }
        }

        Ok(CompilerModel {
            name,
            id,
            tool_prefix,
            use_unix_path,
            err_level,
            extra_defines,
            groups,
        })
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn group(&self, name: &str) -> Result<&ToolModel> {
        self.groups
            .get(name)
            .ok_or_else(|| anyhow!("tool group '{}' not found in compiler model", name))
    }
}

fn parse_group(val: &Value) -> Result<ToolModel> {
    let obj = val
        .as_object()
        .ok_or_else(|| anyhow!("tool group must be an object"))?;

    let tool_path = str_field(obj, "$path")
        .ok_or_else(|| anyhow!("missing '$path' (tool executable)"))?
        .to_string();

    let output_template = str_field(obj, "$output")
        .ok_or_else(|| anyhow!("missing '$output' template"))?
        .to_string();

    let encoding = str_field(obj, "$encoding")
        .map(TextEncoding::from_name)
        .unwrap_or(TextEncoding::Ansi);

    let invoke = match obj.get("$invoke") {
        Some(raw) => {
            let raw: RawInvoke = serde_json::from_value(raw.clone())
                .context("bad '$invoke' declaration")?;
            if raw.use_file {
                let template = raw
                    .body
                    .ok_or_else(|| anyhow!("'$invoke.useFile' set but no 'body' template"))?;
                if !template.contains("${value}") {
                    bail!("'$invoke.body' must contain a '${{value}}' placeholder");
                }
                InvokeMode::ResponseFile { template }
            } else {
                InvokeMode::Inline
            }
        }
        None => InvokeMode::Inline,
    };

    let mut options = Vec::new();
    for (key, entry) in obj {
        if key.starts_with('$') {
            continue;
        }
        let desc: OptionDescriptor = serde_json::from_value(entry.clone())
            .with_context(|| format!("bad descriptor for option '{}'", key))?;
        validate_descriptor(key, &desc)?;
        options.push((key.clone(), desc));
    }

    Ok(ToolModel {
        tool_path,
        encoding,
        invoke,
        output_template,
        output_suffix: str_field(obj, "$outputSuffix").map(str::to_string),
        quote_paths: obj
            .get("$quotePath")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        defaults: string_array(obj.get("$default")),
        default_tail: string_array(obj.get("$default-tail")),
        includes_format: format_field(obj, "$includes")?,
        defines_format: format_field(obj, "$defines")?,
        libs_format: format_field(obj, "$libs")?,
        language_c: language_field(obj, "$language-c")?,
        language_cpp: language_field(obj, "$language-cpp")?,
        list_path: descriptor_field(obj, "$listPath")?,
        link_map: descriptor_field(obj, "$linkMap")?,
        map_suffix: str_field(obj, "$mapSuffix").unwrap_or(".map").to_string(),
        command_location: match str_field(obj, "$commandLocation") {
            Some("end") => CmdLocation::End,
            _ => CmdLocation::Start,
        },
        obj_path_sep: str_field(obj, "$objPathSep").unwrap_or("\r\n").to_string(),
        main_first: obj
            .get("$mainFirst")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        lib_flags: descriptor_field(obj, "$LIB_FLAGS")?,
        post_link: typed_array(obj.get("$outputBin"), "$outputBin")?,
        extra_commands: typed_array(obj.get("$extraCommand"), "$extraCommand")?,
        map_matchers: string_array(obj.get("$matcher")),
        ram_matcher: str_field(obj, "$ramMatcher").map(str::to_string),
        rom_matcher: str_field(obj, "$romMatcher").map(str::to_string),
        options,
    })
}

/// A `selectable` without a `"false"` branch (or `keyValue` without
/// `"default"`) would only surface mid-render on some future project; reject
/// it up front instead.
fn validate_descriptor(key: &str, desc: &OptionDescriptor) -> Result<()> {
    match &desc.kind {
        OptionKind::Selectable { command } => {
            if !command.contains_key("false") {
                bail!("option '{}': 'selectable' needs a \"false\" fallback entry", key);
            }
        }
        OptionKind::KeyValue { variants, .. } => {
            if !variants.contains_key("default") {
                bail!("option '{}': 'keyValue' needs a \"default\" enum entry", key);
            }
        }
        OptionKind::Value { .. } | OptionKind::List { .. } => {}
    }
    Ok(())
}

fn str_field<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn string_array(val: Option<&Value>) -> Vec<String> {
    val.and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn format_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<CmdFormat>> {
    match obj.get(key) {
        Some(v) => Ok(Some(
            serde_json::from_value(v.clone())
                .with_context(|| format!("bad '{}' format declaration", key))?,
        )),
        None => Ok(None),
    }
}

fn descriptor_field(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<OptionDescriptor>> {
    match obj.get(key) {
        Some(v) => {
            let desc: OptionDescriptor = serde_json::from_value(v.clone())
                .with_context(|| format!("bad descriptor for '{}'", key))?;
            validate_descriptor(key, &desc)?;
            Ok(Some(desc))
        }
        None => Ok(None),
    }
}

fn language_field(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<LanguageOption>> {
    match obj.get(key) {
        Some(v) => {
            let lang: LanguageOption = serde_json::from_value(v.clone())
                .with_context(|| format!("bad descriptor for '{}'", key))?;
            validate_descriptor(key, &lang.option)?;
            Ok(Some(lang))
        }
        None => Ok(None),
    }
}

fn typed_array<T: serde::de::DeserializeOwned>(
    val: Option<&Value>,
    key: &str,
) -> Result<Vec<T>> {
    match val {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                serde_json::from_value(item.clone())
                    .with_context(|| format!("bad entry in '{}'", key))
            })
            .collect(),
        Some(_) => bail!("'{}' must be an array", key),
        None => Ok(Vec::new()),
    }
}
