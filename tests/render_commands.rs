//! End-to-end command rendering: model + parameter documents on disk,
//! loaded through the public API, rendered into command lines.

use mcbuild::model::CompilerModel;
use mcbuild::params::ProjectParams;
use mcbuild::render::{CmdGenerator, GeneratorOption, Tool};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    model: CompilerModel,
    params: ProjectParams,
    out_dir: PathBuf,
}

fn fixture(model_json: &str, params_json: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let out_dir = dir.path().join("build");
    fs::create_dir_all(&out_dir).unwrap();

    let model_path = dir.path().join("toolchain.model.json");
    fs::write(&model_path, model_json).unwrap();
    let params_path = dir.path().join("params.json");
    let params_json = params_json
        .replace("{root}", &dir.path().to_string_lossy())
        .replace("{out}", &out_dir.to_string_lossy());
    fs::write(&params_path, params_json).unwrap();

    Fixture {
        model: CompilerModel::load(&model_path).unwrap(),
        params: ProjectParams::load(&params_path).unwrap(),
        out_dir,
        _dir: dir,
    }
}

fn gcc_model() -> String {
    r#"{
        "name": "GNU Arm Embedded",
        "id": "GCC",
        "toolPrefix": "arm-none-eabi-",
        "groups": {
            "c/cpp": {
                "$path": "bin/${toolPrefix}gcc",
                "$output": "-o ${out} ${in}"
            },
            "asm": {
                "$path": "bin/${toolPrefix}gcc",
                "$output": "-o ${out} ${in}"
            },
            "linker": {
                "$path": "bin/${toolPrefix}gcc",
                "$output": "-o ${out} ${in}",
                "$objPathSep": " ",
                "$outputSuffix": ".elf"
            }
        }
    }"#
    .to_string()
}

fn minimal_params() -> String {
    r#"{
        "name": "fw",
        "rootDir": "{root}",
        "outDir": "{out}",
        "dumpPath": "{out}/log"
    }"#
    .to_string()
}

fn generator(fix: &Fixture, inline_only: bool) -> CmdGenerator<'_> {
    CmdGenerator::new(
        &fix.model,
        &fix.params,
        GeneratorOption {
            bin_dir: "%TOOL_DIR%".into(),
            out_dir: fix.out_dir.clone(),
            cwd: Some(fix.params.root_dir.clone()),
            inline_only,
        },
    )
    .unwrap()
}

#[test]
fn minimal_model_renders_minimal_command() {
    let fix = fixture(&gcc_model(), &minimal_params());
    let mut generator = generator(&fix, true);

    let cmd = generator.from_c_file(Path::new("main.c")).unwrap();
    let out_obj = fix.out_dir.join("main.o");
    assert_eq!(
        cmd.command_line,
        format!("-o {} main.c", out_obj.display())
    );
    assert_eq!(
        cmd.exe_path,
        format!("%TOOL_DIR%{}bin/arm-none-eabi-gcc", std::path::MAIN_SEPARATOR)
    );
}

#[test]
fn same_base_names_get_distinct_objects() {
    let fix = fixture(&gcc_model(), &minimal_params());
    let mut generator = generator(&fix, true);

    let a = generator.from_c_file(Path::new("a/util.c")).unwrap();
    let b = generator.from_c_file(Path::new("b/util.c")).unwrap();
    let c = generator.from_c_file(Path::new("c/UTIL.c")).unwrap();

    assert_eq!(a.out_path.unwrap(), fix.out_dir.join("util.o"));
    assert_eq!(b.out_path.unwrap(), fix.out_dir.join("util_1.o"));
    // collisions are case-insensitive but the original casing is kept
    assert_eq!(c.out_path.unwrap(), fix.out_dir.join("UTIL_2.o"));
}

#[test]
fn main_first_without_entry_object_is_fatal() {
    let mut model = gcc_model();
    model = model.replace(
        r#""$objPathSep": " ","#,
        r#""$objPathSep": " ", "$mainFirst": true,"#,
    );
    let fix = fixture(&model, &minimal_params());
    let generator = generator(&fix, true);

    let objs = [fix.out_dir.join("a.o"), fix.out_dir.join("b.o")];
    let err = generator.link_command(&objs).unwrap_err();
    assert!(err.to_string().contains("'main'"), "got: {}", err);

    let with_main = [
        fix.out_dir.join("a.o"),
        fix.out_dir.join("main.o"),
    ];
    let cmd = generator.link_command(&with_main).unwrap();
    let main_pos = cmd.command_line.find("main.o").unwrap();
    let a_pos = cmd.command_line.find("a.o").unwrap();
    assert!(main_pos < a_pos);
}

#[test]
fn link_reports_image_and_map_paths() {
    let fix = fixture(&gcc_model(), &minimal_params());
    let generator = generator(&fix, true);

    let cmd = generator.link_command(&[fix.out_dir.join("main.o")]).unwrap();
    assert_eq!(cmd.out_path.unwrap(), fix.out_dir.join("fw.elf"));
    assert_eq!(cmd.source_path, fix.out_dir.join("fw.map"));
}

#[test]
fn post_link_steps_follow_declaration() {
    let mut model = gcc_model();
    model = model.replace(
        r#""$outputSuffix": ".elf""#,
        r#""$outputSuffix": ".elf",
           "$outputBin": [{
               "name": "output hex file",
               "toolPath": "bin/${toolPrefix}objcopy",
               "outputSuffix": ".hex",
               "command": "-O ihex ${linkerOutput} ${output}"
           }]"#,
    );
    let fix = fixture(&model, &minimal_params());
    let generator = generator(&fix, true);

    let image = fix.out_dir.join("fw.elf");
    let steps = generator.post_link_commands(&image);
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].title.as_deref(), Some("output hex file"));
    assert!(steps[0].command_line.contains("-O ihex"));
    assert!(
        steps[0]
            .command_line
            .contains(&fix.out_dir.join("fw.hex").to_string_lossy().into_owned())
    );

    // an undeclared block renders nothing
    let bare = fixture(&gcc_model(), &minimal_params());
    let bare_generator = generator_for(&bare);
    assert!(bare_generator.post_link_commands(&image).is_empty());
}

fn generator_for(fix: &Fixture) -> CmdGenerator<'_> {
    generator(fix, true)
}

#[test]
fn response_file_written_in_declared_encoding() {
    let model = r#"{
        "name": "ARM Compiler 5",
        "id": "AC5",
        "groups": {
            "c/cpp": {
                "$path": "bin/armcc",
                "$encoding": "UTF8",
                "$invoke": { "useFile": true, "body": "--via ${value}" },
                "$output": "-o ${out} ${in}"
            },
            "asm": {
                "$path": "bin/armasm",
                "$output": "-o ${out} ${in}"
            },
            "linker": {
                "$path": "bin/armlink",
                "$output": "-o ${out} ${in}"
            }
        }
    }"#;
    let fix = fixture(model, &minimal_params());
    let mut generator = generator(&fix, false);

    let cmd = generator.from_c_file(Path::new("main.c")).unwrap();
    let via = fix.out_dir.join("main.__i");
    assert!(cmd.command_line.starts_with("--via "));
    assert!(cmd.command_line.contains("main.__i"));

    let body = fs::read(&via).unwrap();
    // UTF-8 without a byte order mark
    assert!(!body.starts_with(&[0xEF, 0xBB, 0xBF]));
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("-o"));
    assert!(text.contains("main.c"));
}

#[test]
fn tool_selection_honors_use_selector() {
    let model = r#"{
        "name": "Keil C51",
        "id": "C51",
        "groups": {
            "c": { "$path": "bin/c51", "$output": "${out} ${in}" },
            "asm": { "$path": "bin/a51", "$output": "${out} ${in}" },
            "asm-iasm": { "$path": "bin/iasm", "$output": "${out} ${in}" },
            "linker": { "$path": "bin/bl51", "$output": "${out} ${in}" }
        }
    }"#;
    let params = r#"{
        "rootDir": "{root}",
        "outDir": "{out}",
        "dumpPath": "{out}/log",
        "options": { "asm-compiler": { "$use": "asm-iasm" } }
    }"#;
    let fix = fixture(model, params);
    let generator = generator(&fix, true);
    assert!(generator.tool_path(Tool::Asm).ends_with("bin/iasm"));
    assert!(generator.tool_path(Tool::C).ends_with("bin/c51"));
}
