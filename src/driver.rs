//! Build driver: wires the model, parameters, renderer, tracker, executor
//! and console output into one build pass.

use crate::depscan::store::{StoreHandle, Table as StoreTable};
use crate::depscan::{DepTracker, FileState};
use crate::exec::{self, EnvMap};
use crate::model::CompilerModel;
use crate::params::ProjectParams;
use crate::render::{CmdGenerator, GeneratorOption, RenderedCommand, Tool};
use crate::tasks::{self, TaskEnv};
use crate::ui;
use anyhow::{Context, Result, anyhow};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

const BUILD_LOG: &str = "mcbuild.log";
/// Below this many pending commands a worker pool is not worth spinning up.
const PARALLEL_THRESHOLD: usize = 12;

#[derive(Debug)]
pub struct BuildRequest {
    pub model_path: PathBuf,
    pub params_path: PathBuf,
    /// Toolchain root; tool paths render against `%TOOL_DIR%`.
    pub bin_dir: PathBuf,
    /// Incremental mode: skip sources whose include closure is unchanged.
    pub fast: bool,
    /// Overrides the params' thread hint when set.
    pub jobs: Option<usize>,
}

/// Project sources bucketed by extension, order preserved, duplicates
/// removed case-insensitively.
struct SourceSet {
    c: Vec<PathBuf>,
    cpp: Vec<PathBuf>,
    asm: Vec<PathBuf>,
    libs: Vec<PathBuf>,
}

fn classify_sources(paths: &[PathBuf]) -> SourceSet {
    let c_file = Regex::new(r"(?i)\.c$").unwrap();
    let cpp_file = Regex::new(r"(?i)\.(cpp|cxx|cc|c\+\+)$").unwrap();
    let asm_file = Regex::new(r"(?i)\.(s|asm|a51)$").unwrap();
    let lib_file = Regex::new(r"(?i)\.(lib|a)$").unwrap();

    let mut seen: HashSet<String> = HashSet::new();
    let mut set = SourceSet {
        c: Vec::new(),
        cpp: Vec::new(),
        asm: Vec::new(),
        libs: Vec::new(),
    };

    for path in paths {
        let text = path.to_string_lossy().into_owned();
        if !seen.insert(text.to_lowercase()) {
            continue;
        }
        if c_file.is_match(&text) {
            set.c.push(path.clone());
        } else if cpp_file.is_match(&text) {
            set.cpp.push(path.clone());
        } else if asm_file.is_match(&text) {
            set.asm.push(path.clone());
        } else if lib_file.is_match(&text) {
            set.libs.push(path.clone());
        }
        // anything else (headers listed as sources, scripts) is ignored
    }
    set
}

/// Worker-count policy. A hint below 2 means the project never asked for
/// parallelism tuning, so a small default pool is used; otherwise the pool
/// shrinks with the pending command count.
fn calc_threads(pending: usize, hint: usize) -> usize {
    if hint < 2 {
        return 4;
    }
    let per_thread = pending / 8;
    if per_thread >= hint {
        hint
    } else if per_thread >= hint / 2 {
        hint / 2
    } else {
        // the floor must never push the pool past what was asked for
        std::cmp::min(std::cmp::max(hint / 4, 8), hint)
    }
}

pub fn run_build(req: &BuildRequest) -> Result<()> {
    let started = Instant::now();
    let result = build_inner(req);

    let outcome = match &result {
        Ok(()) => {
            println!(
                "\n{} build finished in {:.1}s",
                "✓".green().bold(),
                started.elapsed().as_secs_f32()
            );
            "ok".to_string()
        }
        Err(e) => format!("failed: {:#}", e),
    };

    // best effort: the log must never turn a finished build into a failure
    if let Ok(params) = ProjectParams::load(&req.params_path) {
        let _ = append_build_log(&params.dump_path, &outcome);
    }
    result
}

fn build_inner(req: &BuildRequest) -> Result<()> {
    let model = CompilerModel::load(&req.model_path)?;
    let mut params = ProjectParams::load(&req.params_path)?;
    params.defines.extend(model.extra_defines.iter().cloned());
    if let Some(jobs) = req.jobs {
        params.thread_num = jobs;
    }

    fs::create_dir_all(&params.out_dir).with_context(|| {
        format!("failed to create output directory '{}'", params.out_dir.display())
    })?;
    fs::create_dir_all(&params.dump_path)?;

    println!(
        "{} {} ({})",
        ">>".cyan().bold(),
        model.name.bold(),
        params.out_name()
    );

    let sources = classify_sources(&params.source_paths());
    let generator_opt = GeneratorOption {
        bin_dir: "%TOOL_DIR%".to_string(),
        out_dir: params.out_dir.clone(),
        cwd: Some(params.root_dir.clone()),
        inline_only: false,
    };
    let mut generator = CmdGenerator::new(&model, &params, generator_opt)?;

    let mut env = EnvMap::new();
    env.insert(
        "TOOL_DIR".to_string(),
        req.bin_dir.to_string_lossy().into_owned(),
    );
    let tool_paths: Vec<String> = generator
        .present_tools()
        .into_iter()
        .map(|t| generator.relative_tool_path(t))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    exec::check_tools(&req.bin_dir, &tool_paths)?;

    let task_env = TaskEnv::new(
        generator.out_name(),
        &params.out_dir.to_string_lossy(),
        &req.bin_dir.to_string_lossy(),
        generator.tool_prefix(),
        env.clone(),
    );
    tasks::run_hooks("before-build", &params.options.before_tasks, &task_env)?;

    // every per-file command renders up front on one thread; unique output
    // naming mutates generator state and must stay deterministic
    let mut compile_cmds: Vec<RenderedCommand> = Vec::new();
    for source in &sources.c {
        compile_cmds.push(generator.from_c_file(source)?);
    }
    for source in &sources.cpp {
        compile_cmds.push(generator.from_cpp_file(source)?);
    }
    for source in &sources.asm {
        compile_cmds.push(generator.from_asm_file(source)?);
    }

    // the object list for the link step comes from the full render pass,
    // before fast mode filters out anything already up to date
    let objects: Vec<PathBuf> = compile_cmds
        .iter()
        .filter_map(|cmd| cmd.out_path.clone())
        .collect();

    let mut store = StoreHandle::open(&params.dump_path)?;
    let total = compile_cmds.len();
    if req.fast {
        let mut tracker = DepTracker::new(&params.inc_dirs);
        tracker.load(&store);
        compile_cmds.retain(|cmd| {
            let stable = tracker.classify(&cmd.source_path) == FileState::Stable;
            let present = cmd.out_path.as_deref().map(Path::is_file).unwrap_or(false);
            !(stable && present)
        });
        tracker.persist(&mut store, StoreTable::Staging);
        store.save()?;
        println!(
            "{} fast mode: {} of {} sources need compiling",
            ">>".cyan().bold(),
            compile_cmds.len(),
            total
        );
    }

    let mut table = ui::Table::new(&["C", "C++", "ASM", "LIB", "compile"]);
    table.add_row(vec![
        sources.c.len().to_string(),
        sources.cpp.len().to_string(),
        sources.asm.len().to_string(),
        sources.libs.len().to_string(),
        compile_cmds.len().to_string(),
    ]);
    table.print();

    let err_level = model.err_level;
    compile_all(&compile_cmds, &env, err_level, params.thread_num)?;

    // a full build recompiled every source, so its freshly scanned records
    // are authoritative and go straight into the confirmed table
    if !req.fast {
        let mut tracker = DepTracker::new(&params.inc_dirs);
        for source in sources.c.iter().chain(&sources.cpp).chain(&sources.asm) {
            tracker.classify(source);
        }
        tracker.persist(&mut store, StoreTable::Confirmed);
        store.save()?;
    }

    let mut link_inputs = objects;
    link_inputs.extend(sources.libs.iter().cloned());

    let link = generator.link_command(&link_inputs)?;
    println!("{} linking {}", ">>".cyan().bold(), generator.out_name());
    let out = exec::run_tool(&link.exe_path, &link.command_line, &env)?;
    if !out.text.trim().is_empty() {
        println!("{}", ui::colorize_diagnostics(out.text.trim_end()));
    }
    if !out.success(err_level) {
        return Err(anyhow!("linker failed with exit code {}", out.code));
    }
    let image = link
        .out_path
        .clone()
        .ok_or_else(|| anyhow!("link command produced no output path"))?;

    for extra in generator.extra_link_commands(&image) {
        let out = exec::run_tool(&extra.exe_path, &extra.command_line, &env)?;
        if out.success(err_level) && !out.text.trim().is_empty() {
            println!("{}", out.text.trim_end());
        }
    }

    report_map_file(&generator, &link.source_path, &params)?;

    for step in generator.post_link_commands(&image) {
        let title = step.title.as_deref().unwrap_or(&step.tool);
        let line = format!("{} {}", step.exe_path, step.command_line);
        match exec::run_shell(&line, &env) {
            Ok(out) if out.code == 0 => {
                println!("  {} {}", "✓".green(), title);
            }
            Ok(out) => {
                println!("  {} {} (exit code {})", "!".yellow(), title, out.code);
                if !out.text.trim().is_empty() {
                    println!("{}", out.text.trim_end());
                }
            }
            Err(e) => {
                println!("  {} {}: {:#}", "!".yellow(), title, e);
            }
        }
    }

    if req.fast {
        store.promote();
        store.save()?;
    }

    tasks::run_hooks("after-build", &params.options.after_tasks, &task_env)?;
    Ok(())
}

fn compile_all(
    commands: &[RenderedCommand],
    env: &EnvMap,
    err_level: i32,
    thread_hint: usize,
) -> Result<()> {
    if commands.is_empty() {
        return Ok(());
    }

    if commands.len() < PARALLEL_THRESHOLD || thread_hint == 0 {
        for cmd in commands {
            run_compile(cmd, env, err_level, |text| {
                if !text.trim().is_empty() {
                    println!("{}", ui::colorize_diagnostics(text.trim_end()));
                }
            })?;
            println!(
                "  {} {}",
                "✓".green(),
                cmd.source_path.file_name().unwrap_or_default().to_string_lossy()
            );
        }
        return Ok(());
    }

    let threads = calc_threads(commands.len(), thread_hint);
    println!(
        "{} compiling {} files on {} threads",
        ">>".cyan().bold(),
        commands.len(),
        threads
    );

    let bar = ProgressBar::new(commands.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("  [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=> "),
    );

    let stop = AtomicBool::new(false);
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    let done: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("failed to start the compile worker pool")?;

    pool.scope(|scope| {
        for cmd in commands {
            let stop = &stop;
            let first_error = &first_error;
            let done = &done;
            let bar = &bar;
            scope.spawn(move |_| {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                let result = run_compile(cmd, env, err_level, |text| {
                    if !text.trim().is_empty() {
                        bar.println(ui::colorize_diagnostics(text.trim_end()));
                    }
                });
                match result {
                    Ok(()) => {
                        done.lock().unwrap().push(cmd.source_path.clone());
                        let name = cmd
                            .source_path
                            .file_name()
                            .unwrap_or_default()
                            .to_string_lossy()
                            .into_owned();
                        bar.set_message(name);
                        bar.inc(1);
                    }
                    Err(e) => {
                        stop.store(true, Ordering::SeqCst);
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            });
        }
    });
    bar.finish_and_clear();

    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(e);
    }
    println!(
        "  {} {} files compiled",
        "✓".green(),
        done.into_inner().unwrap().len()
    );
    Ok(())
}

fn run_compile(
    cmd: &RenderedCommand,
    env: &EnvMap,
    err_level: i32,
    mut emit: impl FnMut(&str),
) -> Result<()> {
    let out = exec::run_tool(&cmd.exe_path, &cmd.command_line, env)?;
    emit(&out.text);
    if out.success(err_level) {
        Ok(())
    } else {
        Err(anyhow!(
            "compilation of '{}' failed with exit code {}",
            cmd.source_path.display(),
            out.code
        ))
    }
}

/// Echo the interesting map-report lines and render the RAM/ROM bars.
/// A missing or unreadable report only warns.
fn report_map_file(
    generator: &CmdGenerator,
    map_path: &Path,
    params: &ProjectParams,
) -> Result<()> {
    let text = match fs::read_to_string(map_path) {
        Ok(text) => text,
        Err(e) => {
            println!(
                "  {} map report '{}' unreadable: {}",
                "!".yellow(),
                map_path.display(),
                e
            );
            return Ok(());
        }
    };

    let matchers = generator.map_matchers();
    if !matchers.is_empty() {
        for line in text.lines() {
            if matchers.iter().any(|m| m.is_match(line)) {
                println!("  {}", line.trim());
            }
        }
    }

    let extract = |matcher: Option<&Regex>| -> Option<u64> {
        matcher.and_then(|m| {
            text.lines().find_map(|line| {
                m.captures(line)
                    .and_then(|c| c.get(1))
                    .and_then(|v| v.as_str().trim().parse::<u64>().ok())
            })
        })
    };

    if let Some(used) = extract(generator.ram_matcher()) {
        println!("  {}", ui::usage_bar("RAM", used, params.ram.unwrap_or(0)));
    }
    if let Some(used) = extract(generator.rom_matcher()) {
        println!("  {}", ui::usage_bar("ROM", used, params.rom.unwrap_or(0)));
    }
    Ok(())
}

fn append_build_log(dump_dir: &Path, outcome: &str) -> Result<()> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dump_dir.join(BUILD_LOG))?;
    writeln!(file, "[{}] {}", stamp, outcome)?;
    Ok(())
}

/// `mcb dump`: print the fully rendered command lines without running
/// anything. Response files are suppressed so the lines read inline.
pub fn run_dump(model_path: &Path, params_path: &Path) -> Result<()> {
    let model = CompilerModel::load(model_path)?;
    let mut params = ProjectParams::load(params_path)?;
    params.defines.extend(model.extra_defines.iter().cloned());

    let opt = GeneratorOption {
        bin_dir: "%TOOL_DIR%".to_string(),
        out_dir: params.out_dir.clone(),
        cwd: Some(params.root_dir.clone()),
        inline_only: true,
    };
    let mut generator = CmdGenerator::new(&model, &params, opt)?;

    println!("{} {} ({})", ">>".cyan().bold(), model.name.bold(), model.id);

    let samples = [
        (Tool::C, PathBuf::from("sample.c")),
        (Tool::Cpp, PathBuf::from("sample.cpp")),
        (Tool::Asm, PathBuf::from("sample.s")),
    ];
    for (tool, source) in &samples {
        if !generator.has_tool(*tool) {
            continue;
        }
        let cmd = generator.compile_command(*tool, source)?;
        println!("\n{}:", tool.key().bold());
        println!("  {} {}", cmd.exe_path, cmd.command_line);
    }

    // "main.o" so a linker with an entry-object requirement still renders
    let link = generator.link_command(&[params.out_dir.join("main.o")])?;
    println!("\n{}:", "linker".bold());
    println!("  {} {}", link.exe_path, link.command_line);

    for step in generator.post_link_commands(link.out_path.as_deref().unwrap_or(Path::new(""))) {
        println!("\n{}:", step.title.as_deref().unwrap_or("post-link").bold());
        println!("  {} {}", step.exe_path, step.command_line);
    }
    Ok(())
}

/// `mcb cache flush`: promote staging records into the confirmed table.
pub fn run_cache_flush(dir: &Path) -> Result<()> {
    let mut store = StoreHandle::open(dir)?;
    store.promote();
    store.save()?;
    println!("{} dependency cache flushed", "✓".green());
    Ok(())
}

/// `mcb cache clear`: drop every record in both tables.
pub fn run_cache_clear(dir: &Path) -> Result<()> {
    let mut store = StoreHandle::open(dir)?;
    store.clear();
    store.save()?;
    println!("{} dependency cache cleared", "✓".green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sources() {
        let paths: Vec<PathBuf> = [
            "/p/main.c",
            "/p/app.CPP",
            "/p/startup.s",
            "/p/vendor.lib",
            "/p/MAIN.C",
            "/p/notes.txt",
            "/p/isr.a51",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();

        let set = classify_sources(&paths);
        assert_eq!(set.c, vec![PathBuf::from("/p/main.c")]);
        assert_eq!(set.cpp, vec![PathBuf::from("/p/app.CPP")]);
        assert_eq!(
            set.asm,
            vec![PathBuf::from("/p/startup.s"), PathBuf::from("/p/isr.a51")]
        );
        assert_eq!(set.libs, vec![PathBuf::from("/p/vendor.lib")]);
    }

    #[test]
    fn test_calc_threads_policy() {
        // no meaningful hint: small fixed pool
        assert_eq!(calc_threads(100, 0), 4);
        assert_eq!(calc_threads(100, 1), 4);
        // plenty of work per thread: take the full hint
        assert_eq!(calc_threads(128, 16), 16);
        // medium load: half the hint
        assert_eq!(calc_threads(64, 16), 8);
        // light load: quarter of the hint, floored
        assert_eq!(calc_threads(16, 16), 8);
        assert_eq!(calc_threads(200, 64), 64);
        assert_eq!(calc_threads(100, 64), 16);
        // a small hint is an upper bound, never inflated by the floor
        assert_eq!(calc_threads(5, 4), 4);
        assert_eq!(calc_threads(13, 6), 6);
    }
}
