//! Model-driven command synthesis.
//!
//! [`CmdGenerator`] binds a compiler model to one project's parameter set.
//! Construction renders the per-tool *stable fragments* (everything that does
//! not depend on an individual source file); afterwards the generator hands
//! out compile, link and post-link commands on demand.

pub mod value;

use crate::model::{
    CmdLocation, CompilerModel, InvokeMode, LanguageOption, TextEncoding, ToolModel,
};
use crate::params::{ParamValue, ProjectParams};
use anyhow::{Context, Result, anyhow, bail};
use encoding::all::{UTF_8, UTF_16LE, WINDOWS_1252};
use encoding::{EncoderTrap, Encoding};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use value::{PathRender, define_block, path_block, render_option, strip_flag};

/// The four tool slots every build uses. `C` and `Cpp` may share one model
/// group (`c/cpp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    C,
    Cpp,
    Asm,
    Linker,
}

impl Tool {
    pub fn key(self) -> &'static str {
        match self {
            Tool::C => "c",
            Tool::Cpp => "cpp",
            Tool::Asm => "asm",
            Tool::Linker => "linker",
        }
    }

    fn language_key(self) -> Option<&'static str> {
        match self {
            Tool::C => Some("language-c"),
            Tool::Cpp => Some("language-cpp"),
            Tool::Asm | Tool::Linker => None,
        }
    }

    const ALL: [Tool; 4] = [Tool::C, Tool::Cpp, Tool::Asm, Tool::Linker];
}

/// A ready-to-execute command. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct RenderedCommand {
    /// Tool identity ("c", "cpp", "asm", "linker") or a post-link step name.
    pub tool: String,
    /// Human-readable step title (post-link steps only).
    pub title: Option<String>,
    pub exe_path: String,
    pub command_line: String,
    /// The input this command consumes. For the link command this is the
    /// map-report path, consumed downstream for RAM/ROM extraction.
    pub source_path: PathBuf,
    pub out_path: Option<PathBuf>,
}

/// Generator construction options supplied by the driver.
#[derive(Debug, Clone)]
pub struct GeneratorOption {
    /// Prefix for tool executable paths, typically `%TOOL_DIR%`.
    pub bin_dir: String,
    pub out_dir: PathBuf,
    /// Project root; rendered paths inside it become `./relative`.
    pub cwd: Option<PathBuf>,
    /// Suppress response files (dump mode prints inline command lines).
    pub inline_only: bool,
}

#[derive(Debug)]
pub struct CmdGenerator<'m> {
    model: &'m CompilerModel,
    params: &'m ProjectParams,
    opt: GeneratorOption,
    /// Present tool slots only. The linker is always present; a model may
    /// legitimately lack a `cpp` or `asm` group (8051 toolchains do).
    tools: HashMap<Tool, &'m ToolModel>,
    stable: HashMap<Tool, Vec<String>>,
    paths: PathRender,
    /// Lowercased output base names already claimed this session.
    name_counters: HashMap<String, u32>,
    /// Map-report matchers, compiled up front so a bad pattern is a
    /// configuration error rather than a post-link surprise.
    map_matchers: Vec<Regex>,
    ram_matcher: Option<Regex>,
    rom_matcher: Option<Regex>,
}

impl<'m> CmdGenerator<'m> {
    pub fn new(
        model: &'m CompilerModel,
        params: &'m ProjectParams,
        opt: GeneratorOption,
    ) -> Result<Self> {
        let mut tools = HashMap::new();
        for tool in Tool::ALL {
            if let Some(tm) = select_group(model, params, tool)? {
                tools.insert(tool, tm);
            }
        }

        let paths = PathRender {
            cwd: opt.cwd.clone(),
            unix: model.use_unix_path,
        };

        // select_group never leaves the linker slot empty
        let linker = tools[&Tool::Linker];
        let map_matchers = linker
            .map_matchers
            .iter()
            .map(|pattern| {
                Regex::new(&format!("(?i){}", pattern))
                    .with_context(|| format!("bad '$matcher' pattern '{}'", pattern))
            })
            .collect::<Result<Vec<_>>>()?;
        let ram_matcher = compile_matcher(linker.ram_matcher.as_deref(), "$ramMatcher")?;
        let rom_matcher = compile_matcher(linker.rom_matcher.as_deref(), "$romMatcher")?;

        let mut generator = CmdGenerator {
            model,
            params,
            opt,
            tools,
            stable: HashMap::new(),
            paths,
            name_counters: HashMap::new(),
            map_matchers,
            ram_matcher,
            rom_matcher,
        };

        // The link image claims the output name first, so a source file with
        // the same base name gets a numeric suffix instead of clobbering it.
        generator.unique_name(params.out_name());

        for tool in Tool::ALL {
            if !generator.tools.contains_key(&tool) {
                continue;
            }
            let fragments = generator
                .build_stable_fragment(tool)
                .with_context(|| format!("while preparing '{}' command line", tool.key()))?;
            generator.stable.insert(tool, fragments);
        }

        Ok(generator)
    }

    pub fn has_tool(&self, tool: Tool) -> bool {
        self.tools.contains_key(&tool)
    }

    /// The tool slots this model actually declares.
    pub fn present_tools(&self) -> Vec<Tool> {
        Tool::ALL
            .into_iter()
            .filter(|t| self.tools.contains_key(t))
            .collect()
    }

    fn tool_model(&self, tool: Tool) -> Result<&'m ToolModel> {
        self.tools.get(&tool).copied().ok_or_else(|| {
            anyhow!("no '{}' tool group in the compiler model", tool.key())
        })
    }

    /// Everything in a tool's command line that no single source file
    /// influences, in model declaration order.
    fn build_stable_fragment(&self, tool: Tool) -> Result<Vec<String>> {
        let tm = self.tools[&tool];
        let mut fragments: Vec<String> = Vec::new();

        fragments.extend(tm.defaults.iter().cloned());

        for (key, desc) in &tm.options {
            let value = self.params.resolve_option(tool.key(), key);
            let rendered = render_option(desc, value, &self.paths).map_err(|e| {
                anyhow!(
                    "option '{}': {} (check the project's compile options)",
                    key,
                    e
                )
            })?;
            let rendered = rendered.trim().to_string();
            if !rendered.is_empty() {
                fragments.push(rendered);
            }
        }

        if tool == Tool::Linker {
            let libs = path_block(tm.libs_format.as_ref(), &self.params.lib_dirs, &self.paths);
            if !libs.is_empty() {
                fragments.push(libs);
            }
        } else {
            let includes =
                path_block(tm.includes_format.as_ref(), &self.params.inc_dirs, &self.paths);
            if !includes.is_empty() {
                fragments.push(includes);
            }
            let defines = define_block(
                tm.defines_format.as_ref(),
                &self.params.defines,
                tool == Tool::Asm,
            );
            if !defines.is_empty() {
                fragments.push(defines);
            }
        }

        fragments.extend(tm.default_tail.iter().cloned());

        Ok(self.substitute_placeholders(tool, fragments))
    }

    /// Resolve `${name}` placeholders referring to other option keys of the
    /// same tool. Failed substitutions are skipped on purpose: templating is
    /// used for optional composite flags and must stay lenient.
    fn substitute_placeholders(&self, tool: Tool, fragments: Vec<String>) -> Vec<String> {
        let tm = self.tools[&tool];
        let placeholder = Regex::new(r"\$\{([^}]+)\}").unwrap();

        fragments
            .into_iter()
            .map(|fragment| {
                let keys: Vec<String> = placeholder
                    .captures_iter(&fragment)
                    .map(|c| c[1].to_string())
                    .collect();

                let mut out = fragment;
                for key in keys {
                    let desc = match tm.options.iter().find(|(k, _)| *k == key) {
                        Some((_, d)) => d,
                        None => continue,
                    };
                    let value = self.params.resolve_option(tool.key(), &key);
                    if let Ok(rendered) = render_option(desc, value, &self.paths) {
                        out = out.replace(&format!("${{{}}}", key), &rendered);
                    }
                }
                out
            })
            .collect()
    }

    pub fn from_c_file(&mut self, source: &Path) -> Result<RenderedCommand> {
        self.compile_command(Tool::C, source)
    }

    pub fn from_cpp_file(&mut self, source: &Path) -> Result<RenderedCommand> {
        self.compile_command(Tool::Cpp, source)
    }

    pub fn from_asm_file(&mut self, source: &Path) -> Result<RenderedCommand> {
        self.compile_command(Tool::Asm, source)
    }

    /// Render one compile/assemble command: source in, object out.
    pub fn compile_command(&mut self, tool: Tool, source: &Path) -> Result<RenderedCommand> {
        let tm = self.tool_model(tool)?;
        let quote = tm.quote_paths;

        let stem = source
            .file_stem()
            .ok_or_else(|| anyhow!("source file '{}' has no base name", source.display()))?
            .to_string_lossy()
            .into_owned();
        let unique = self.unique_name(&stem);

        let out_suffix = tm.output_suffix.as_deref().unwrap_or(".o");
        let out_path = self.opt.out_dir.join(format!("{}{}", unique, out_suffix));
        let ref_path = self.opt.out_dir.join(format!("{}.d", unique));
        let list_path = self.opt.out_dir.join(format!("{}.lst", unique));

        let mut commands: Vec<String> = Vec::new();
        let mut excludes: &[String] = &[];

        if let Some(lang_key) = tool.language_key() {
            if let Some(lang) = self.language_option(tm, tool) {
                let dialect = self
                    .params
                    .tool_options(tool.key())
                    .get(lang_key)
                    .cloned()
                    .unwrap_or_else(|| ParamValue::Single("default".into()));
                let rendered = render_option(&lang.option, Some(&dialect), &self.paths)
                    .map_err(|e| anyhow!("option '{}': {}", lang_key, e))?;
                commands.push(rendered);
                excludes = &lang.exclude;
            }
        }

        if let Some(list_opt) = &tm.list_path {
            let rendered = render_option(list_opt, empty_value(), &self.paths)
                .map_err(|e| anyhow!("option '$listPath': {}", e))?;
            commands.push(rendered.replace("${listPath}", &self.paths.render(&list_path, quote)));
        }

        let output = tm
            .output_template
            .replace("${out}", &self.paths.render(&out_path, quote))
            .replace("${refPath}", &self.paths.render(&ref_path, quote));

        if tm.output_template.contains("${in}") {
            commands.extend(self.stable[&tool].iter().cloned());
            commands.push(output.replace("${in}", &self.paths.render(source, quote)));
        } else {
            // Toolchains without an input placeholder take the source file
            // as the leading argument.
            commands.insert(0, self.paths.quoted(source));
            commands.extend(self.stable[&tool].iter().cloned());
            commands.push(output);
        }

        for token in excludes {
            for command in commands.iter_mut() {
                *command = strip_flag(command, token);
            }
        }
        commands.retain(|c| !c.trim().is_empty());

        let command_line = commands.join(" ");
        let response_suffix = if tool == Tool::Asm { "._ia" } else { ".__i" };
        let command_line =
            self.apply_invoke_mode(tm, &unique, response_suffix, command_line)?;

        Ok(RenderedCommand {
            tool: tool.key().to_string(),
            title: None,
            exe_path: self.tool_path(tool),
            command_line,
            source_path: source.to_path_buf(),
            out_path: Some(out_path),
        })
    }

    /// Render the link command over the collected objects and libraries.
    pub fn link_command(&self, objects: &[PathBuf]) -> Result<RenderedCommand> {
        let tm = self.tool_model(Tool::Linker)?;
        let linker_params = self.params.tool_options("linker");
        let sep = match tm.invoke {
            InvokeMode::ResponseFile { .. } if !self.opt.inline_only => "\r\n",
            _ => " ",
        };

        let out_name = self.params.out_name();
        let out_suffix = tm.output_suffix.as_deref().unwrap_or(".axf");
        let out_path = self.opt.out_dir.join(format!("{}{}", out_name, out_suffix));
        let map_path = self
            .opt
            .out_dir
            .join(format!("{}{}", out_name, tm.map_suffix));

        let mut objects: Vec<PathBuf> = objects.to_vec();
        if tm.main_first {
            let main_name = linker_params
                .get("$mainFileName")
                .and_then(ParamValue::as_single)
                .unwrap_or("main");
            let index = objects
                .iter()
                .position(|p| p.file_stem().map(|s| s == main_name).unwrap_or(false));
            match index {
                Some(i) => {
                    let entry = objects.remove(i);
                    objects.insert(0, entry);
                }
                None => bail!(
                    "entry object '{}' not found in the object list; this linker requires it to lead the list",
                    main_name
                ),
            }
        }

        let lib_flags = match (&tm.lib_flags, linker_params.get("LIB_FLAGS")) {
            (Some(desc), Some(value)) => render_option(desc, Some(value), &self.paths)
                .map_err(|e| anyhow!("option 'LIB_FLAGS': {}", e))?,
            _ => String::new(),
        };

        let map_flag = match &tm.link_map {
            Some(desc) => {
                let rendered = render_option(desc, empty_value(), &self.paths)
                    .map_err(|e| anyhow!("option '$linkMap': {}", e))?;
                Some(rendered.replace("${mapPath}", &self.paths.quoted(&map_path)))
            }
            None => None,
        };

        let stable = self.stable[&Tool::Linker].join(" ");
        let rendered_objs: Vec<String> =
            objects.iter().map(|p| self.paths.quoted(p)).collect();

        let output = tm
            .output_template
            .replace("${out}", &self.paths.quoted(&out_path))
            .replace("${in}", &rendered_objs.join(&tm.obj_path_sep))
            .replace("${lib_flags}", &lib_flags);

        let mut cmd_line = String::new();
        match tm.command_location {
            CmdLocation::Start => {
                cmd_line.push_str(&stable);
                if let Some(map_flag) = &map_flag {
                    cmd_line.push_str(sep);
                    cmd_line.push_str(map_flag);
                }
                cmd_line.push_str(sep);
                cmd_line.push_str(&output);
            }
            CmdLocation::End => {
                cmd_line.push_str(&output);
                if let Some(map_flag) = &map_flag {
                    cmd_line.push_str(sep);
                    cmd_line.push_str(map_flag);
                }
                cmd_line.push(' ');
                cmd_line.push_str(&stable);
            }
        }

        let command_line = self.apply_invoke_mode(tm, self.params.out_name(), ".lnp", cmd_line)?;

        Ok(RenderedCommand {
            tool: "linker".to_string(),
            title: None,
            exe_path: self.tool_path(Tool::Linker),
            command_line,
            source_path: map_path,
            out_path: Some(out_path),
        })
    }

    /// Post-link artifact steps (`$outputBin`): hex/bin extraction and the
    /// like. An undeclared block yields no commands.
    pub fn post_link_commands(&self, image: &Path) -> Vec<RenderedCommand> {
        let tm = self.tools[&Tool::Linker];
        let base = self.opt.out_dir.join(self.params.out_name());

        tm.post_link
            .iter()
            .map(|step| {
                let mut out_path = base.clone();
                if !step.output_suffix.is_empty() {
                    out_path = PathBuf::from(format!(
                        "{}{}",
                        base.to_string_lossy(),
                        step.output_suffix
                    ));
                }

                let command_line = step
                    .command
                    .replace("${linkerOutput}", &self.paths.quoted(image))
                    .replace("${output}", &self.paths.quoted(&out_path));

                RenderedCommand {
                    tool: "post-link".to_string(),
                    title: Some(step.name.clone()),
                    exe_path: self.expand_tool_path(&step.tool_path),
                    command_line,
                    source_path: image.to_path_buf(),
                    out_path: Some(out_path),
                }
            })
            .collect()
    }

    /// Extra vendor commands run on the link image (`$extraCommand`).
    pub fn extra_link_commands(&self, image: &Path) -> Vec<RenderedCommand> {
        let tm = self.tools[&Tool::Linker];

        tm.extra_commands
            .iter()
            .map(|step| {
                let exe_path = self.expand_tool_path(&step.tool_path);
                RenderedCommand {
                    tool: "post-link".to_string(),
                    title: Some(step.name.clone().unwrap_or_else(|| exe_path.clone())),
                    exe_path,
                    command_line: step
                        .command
                        .replace("${linkerOutput}", &self.paths.quoted(image)),
                    source_path: image.to_path_buf(),
                    out_path: None,
                }
            })
            .collect()
    }

    /// Regexes selecting map-report lines worth echoing to the console.
    pub fn map_matchers(&self) -> &[Regex] {
        &self.map_matchers
    }

    pub fn ram_matcher(&self) -> Option<&Regex> {
        self.ram_matcher.as_ref()
    }

    pub fn rom_matcher(&self) -> Option<&Regex> {
        self.rom_matcher.as_ref()
    }

    pub fn out_name(&self) -> &str {
        self.params.out_name()
    }

    pub fn model_name(&self) -> &str {
        &self.model.name
    }

    pub fn model_id(&self) -> &str {
        &self.model.id
    }

    pub fn tool_prefix(&self) -> &str {
        &self.model.tool_prefix
    }

    /// Tool executable path, prefixed with the generator's bin dir token.
    pub fn tool_path(&self, tool: Tool) -> String {
        self.expand_tool_path(&self.tools[&tool].tool_path)
    }

    /// Tool path relative to the toolchain root, prefix substituted.
    pub fn relative_tool_path(&self, tool: Tool) -> String {
        self.tools[&tool]
            .tool_path
            .replace("${toolPrefix}", &self.model.tool_prefix)
    }

    fn expand_tool_path(&self, template: &str) -> String {
        format!(
            "{}{}{}",
            self.opt.bin_dir,
            std::path::MAIN_SEPARATOR,
            template.replace("${toolPrefix}", &self.model.tool_prefix)
        )
    }

    fn language_option(&self, tm: &'m ToolModel, tool: Tool) -> Option<&'m LanguageOption> {
        match tool {
            Tool::C => tm.language_c.as_ref(),
            Tool::Cpp => tm.language_cpp.as_ref(),
            _ => None,
        }
    }

    /// Write the command text to a response file and return the invocation
    /// line, or pass the command through for inline tools.
    fn apply_invoke_mode(
        &self,
        tm: &ToolModel,
        base_name: &str,
        suffix: &str,
        command_line: String,
    ) -> Result<String> {
        match &tm.invoke {
            InvokeMode::ResponseFile { template } if !self.opt.inline_only => {
                let file_path = self.opt.out_dir.join(format!("{}{}", base_name, suffix));
                write_encoded(&file_path, &command_line, tm.encoding).with_context(|| {
                    format!("failed to write response file '{}'", file_path.display())
                })?;
                Ok(template.replace(
                    "${value}",
                    &format!("\"{}\"", file_path.to_string_lossy()),
                ))
            }
            _ => Ok(command_line),
        }
    }

    /// First claim of a base name (case-insensitive) keeps it; later claims
    /// get `_1`, `_2`, ... so same-named sources in different directories
    /// never collide in the flat output directory.
    fn unique_name(&mut self, wanted: &str) -> String {
        let key = wanted.to_lowercase();
        match self.name_counters.get_mut(&key) {
            Some(count) => {
                *count += 1;
                format!("{}_{}", wanted, count)
            }
            None => {
                self.name_counters.insert(key, 0);
                wanted.to_string()
            }
        }
    }
}

fn empty_value() -> Option<&'static ParamValue> {
    static EMPTY: std::sync::OnceLock<ParamValue> = std::sync::OnceLock::new();
    Some(EMPTY.get_or_init(|| ParamValue::Single(String::new())))
}

fn compile_matcher(pattern: Option<&str>, key: &str) -> Result<Option<Regex>> {
    match pattern {
        Some(p) => Ok(Some(
            Regex::new(&format!("(?i){}", p))
                .with_context(|| format!("bad '{}' pattern '{}'", key, p))?,
        )),
        None => Ok(None),
    }
}

/// Pick the model group backing one tool slot, honoring the `c/cpp` shared
/// group and the params' `$use` selectors.
///
/// A default group a model simply does not declare yields `None`; the error
/// then surfaces only if a source of that kind shows up. A group named by an
/// explicit `$use` selector, and the linker group, must exist.
fn select_group<'m>(
    model: &'m CompilerModel,
    params: &ProjectParams,
    tool: Tool,
) -> Result<Option<&'m ToolModel>> {
    let selector = |key: &str| {
        params
            .tool_options(key)
            .get("$use")
            .and_then(ParamValue::as_single)
            .map(str::to_string)
    };

    match tool {
        Tool::C | Tool::Cpp => {
            let name = if model.has_group("c/cpp") {
                "c/cpp"
            } else if tool == Tool::C {
                "c"
            } else {
                "cpp"
            };
            Ok(model.group(name).ok())
        }
        Tool::Asm => match selector("asm") {
            Some(name) => model.group(&name).map(Some).map_err(|_| {
                anyhow!(
                    "invalid '$use' selector: no '{}' group in the model (check 'asm-compiler.$use')",
                    name
                )
            }),
            None => Ok(model.group("asm").ok()),
        },
        Tool::Linker => {
            let name = selector("linker").unwrap_or_else(|| "linker".to_string());
            model.group(&name).map(Some).map_err(|_| {
                anyhow!(
                    "no '{}' linker group in the model (check 'linker.$use')",
                    name
                )
            })
        }
    }
}

/// Write `text` in the tool's declared response-file encoding.
fn write_encoded(path: &Path, text: &str, encoding: TextEncoding) -> Result<()> {
    let codec: &dyn Encoding = match encoding {
        TextEncoding::Utf8 => UTF_8,
        TextEncoding::Utf16 => UTF_16LE,
        TextEncoding::Ansi => WINDOWS_1252,
    };
    let bytes = codec
        .encode(text, EncoderTrap::Replace)
        .map_err(|e| anyhow!("encoding failed: {}", e))?;
    fs::write(path, bytes)?;
    Ok(())
}
