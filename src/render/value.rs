//! Descriptor rendering primitives: single-option fragments, path quoting,
//! include/define/library blocks, and word-boundary flag stripping.

use crate::model::{CmdFormat, OptionDescriptor, OptionKind};
use crate::params::ParamValue;
use regex::Regex;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A parameter value whose shape does not fit the descriptor's kind.
/// Callers re-wrap this with the offending option key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub given: &'static str,
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected a '{}' value but a '{}' was given",
            self.expected, self.given
        )
    }
}

impl std::error::Error for TypeMismatch {}

/// Path rendering rules shared by every fragment: relative to the project
/// root where possible, unix separators when the model says so, quoted when
/// the path contains whitespace.
#[derive(Debug, Clone, Default)]
pub struct PathRender {
    pub cwd: Option<PathBuf>,
    pub unix: bool,
}

impl PathRender {
    pub fn quoted(&self, path: &Path) -> String {
        self.render(path, true)
    }

    pub fn render(&self, path: &Path, quote: bool) -> String {
        let path = match &self.cwd {
            Some(root) => to_relative(root, path).unwrap_or_else(|| path.to_path_buf()),
            None => path.to_path_buf(),
        };

        let mut text = path.to_string_lossy().into_owned();
        if self.unix {
            text = text.replace('\\', "/");
        }

        if quote && text.contains(' ') {
            format!("\"{}\"", text)
        } else {
            text
        }
    }

    fn normalize_value(&self, value: &str) -> String {
        if self.unix {
            value.replace('\\', "/")
        } else {
            value.to_string()
        }
    }
}

/// Express `abs` relative to `root` as `./...` when `root` is a component
/// prefix, keeping linker response files stable across checkouts.
fn to_relative(root: &Path, abs: &Path) -> Option<PathBuf> {
    let rest = abs.strip_prefix(root).ok()?;
    if rest.components().next().is_none() {
        return None;
    }
    let mut out = PathBuf::from(".");
    for comp in rest.components() {
        if let Component::Normal(c) = comp {
            out.push(c);
        }
    }
    Some(out)
}

/// Render one option descriptor against one (possibly absent) value.
///
/// `list` accepts a string as the one-element compatibility case; every
/// other shape mismatch is reported to the caller. `prefix`/`suffix` wrap
/// only a non-empty body, so an absent value never emits a bare prefix.
pub fn render_option(
    desc: &OptionDescriptor,
    value: Option<&ParamValue>,
    paths: &PathRender,
) -> Result<String, TypeMismatch> {
    let body = match &desc.kind {
        OptionKind::Selectable { command } => {
            let chosen = value
                .and_then(ParamValue::as_single)
                .and_then(|v| command.get(v));
            match chosen {
                Some(fragment) => fragment.clone(),
                None => {
                    check_scalar(value)?;
                    command["false"].clone()
                }
            }
        }
        OptionKind::KeyValue { command, variants } => {
            let key = match value {
                Some(ParamValue::Single(s)) => Some(s.as_str()),
                Some(other) => {
                    return Err(TypeMismatch {
                        expected: "string",
                        given: other.shape(),
                    });
                }
                None => None,
            };
            let fragment = key
                .and_then(|k| variants.get(k))
                .unwrap_or(&variants["default"]);
            format!("{}{}", command, fragment)
        }
        OptionKind::Value { command } => match value {
            Some(ParamValue::Single(s)) => format!("{}{}", command, paths.normalize_value(s)),
            Some(other) => {
                return Err(TypeMismatch {
                    expected: "string",
                    given: other.shape(),
                });
            }
            None => String::new(),
        },
        OptionKind::List { command } => match value {
            // A lone string is accepted where a list is declared.
            Some(ParamValue::Single(s)) => format!("{}{}", command, paths.normalize_value(s)),
            Some(ParamValue::Many(items)) => items
                .iter()
                .map(|item| format!("{}{}", command, paths.normalize_value(item)))
                .collect::<Vec<_>>()
                .join(" "),
            None => String::new(),
        },
    };

    if body.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!("{}{}{}", desc.prefix, body, desc.suffix))
    }
}

fn check_scalar(value: Option<&ParamValue>) -> Result<(), TypeMismatch> {
    match value {
        Some(ParamValue::Many(_)) => Err(TypeMismatch {
            expected: "string",
            given: "array",
        }),
        _ => Ok(()),
    }
}

/// Render an include or library search-path block: one `body` instance per
/// directory with `${value}` substituted, joined by the format's separator.
pub fn path_block(fmt: Option<&CmdFormat>, dirs: &[String], paths: &PathRender) -> String {
    let fmt = match fmt {
        Some(f) => f,
        None => return String::new(),
    };
    if dirs.is_empty() {
        return String::new();
    }

    let rendered: Vec<String> = dirs
        .iter()
        .map(|dir| {
            fmt.body
                .replace("${value}", &paths.render(Path::new(dir), !fmt.no_quotes))
        })
        .collect();

    format!("{}{}{}", fmt.prefix, rendered.join(&fmt.sep), fmt.suffix)
}

/// Render the define block. `NAME=value` substitutes both placeholders with
/// one layer of surrounding double quotes stripped from the value. A bare
/// `NAME` is asymmetric by toolchain convention: assemblers require an
/// explicit macro value, so they get `value` forced to `1`, while compilers
/// get the format body truncated after the `${key}` placeholder.
pub fn define_block(fmt: Option<&CmdFormat>, defines: &[String], is_asm: bool) -> String {
    let fmt = match fmt {
        Some(f) => f,
        None => return String::new(),
    };
    if defines.is_empty() {
        return String::new();
    }

    let bare_macro_trim = Regex::new(r"^([^$]*\$\{key\}).*$").unwrap();

    let rendered: Vec<String> = defines
        .iter()
        .map(|define| match define.split_once('=') {
            Some((macro_name, raw_value)) => {
                let value = strip_quotes(raw_value.trim());
                fmt.body
                    .replace("${key}", macro_name.trim())
                    .replace("${value}", value)
            }
            None => {
                let macro_name = define.trim();
                if is_asm {
                    fmt.body
                        .replace("${key}", macro_name)
                        .replace("${value}", "1")
                } else {
                    bare_macro_trim
                        .replace(&fmt.body, "$1")
                        .replace("${key}", macro_name)
                }
            }
        })
        .collect();

    format!("{}{}{}", fmt.prefix, rendered.join(&fmt.sep), fmt.suffix)
}

fn strip_quotes(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Remove every standalone occurrence of `token` from `line`. A match must
/// not touch a word character or `-` on either side, so stripping `-O2`
/// leaves `-O2x` and `--O2` alone.
pub fn strip_flag(line: &str, token: &str) -> String {
    if token.is_empty() {
        return line.to_string();
    }

    let mut out = String::with_capacity(line.len());
    let bytes = line.as_bytes();
    let mut pos = 0;

    while pos < line.len() {
        match line[pos..].find(token) {
            Some(offset) => {
                let start = pos + offset;
                let end = start + token.len();
                let left_ok = start == 0 || !is_word_byte(bytes[start - 1]);
                let right_ok = end == line.len() || !is_word_byte(bytes[end]);

                out.push_str(&line[pos..start]);
                if left_ok && right_ok {
                    pos = end;
                } else {
                    out.push_str(token);
                    pos = end;
                }
            }
            None => {
                out.push_str(&line[pos..]);
                break;
            }
        }
    }

    out
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}
