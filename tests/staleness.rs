//! Staleness tracking over real files: include resolution, cyclic headers,
//! classification across store round trips.

use mcbuild::depscan::store::{StoreHandle, Table};
use mcbuild::depscan::{DepTracker, FileState};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Project {
    dir: TempDir,
    inc: PathBuf,
}

impl Project {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let inc = dir.path().join("inc");
        fs::create_dir_all(&inc).unwrap();
        Project { dir, inc }
    }

    fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn inc_dirs(&self) -> Vec<String> {
        vec![self.inc.to_string_lossy().into_owned()]
    }

    fn store_dir(&self) -> PathBuf {
        self.dir.path().join("log")
    }
}

/// Backdate a file's mtime so a later rewrite registers as a change even on
/// a coarse-grained filesystem clock.
fn backdate(path: &Path) {
    let old = std::time::SystemTime::now() - std::time::Duration::from_secs(120);
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(old).unwrap();
}

#[test]
fn cyclic_headers_terminate_and_exclude_self() {
    let project = Project::new();
    // a.h -> b.h -> c.h -> a.h
    project.write("inc/a.h", "#include \"b.h\"\n");
    project.write("inc/b.h", "#include \"c.h\"\n");
    project.write("inc/c.h", "#include \"a.h\"\n");
    let a = project.inc.join("a.h");

    let mut tracker = DepTracker::new(&project.inc_dirs());
    let closure = tracker.transitive(&a);

    let names: Vec<String> = closure
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(closure.len(), 2);
    assert!(names.contains(&"b.h".to_string()));
    assert!(names.contains(&"c.h".to_string()));
    assert!(!names.contains(&"a.h".to_string()));
}

#[test]
fn include_resolution_rules() {
    let project = Project::new();
    project.write("inc/board.h", "");
    project.write("inc/sub/pins.h", "");
    project.write("src/local.h", "");
    let main = project.write(
        "src/main.c",
        "#include <BOARD.H>\n\
         #include \"sub/pins.h\"\n\
         #include \"./local.h\"\n\
         #include <no_such_file.h>\n",
    );

    let tracker = DepTracker::new(&project.inc_dirs());
    let deps = tracker.scan_includes(&main).unwrap();

    assert_eq!(deps.len(), 3);
    // bare names match case-insensitively against the flat index
    assert_eq!(deps[0], project.inc.join("board.h"));
    // separators resolve relative to a header directory
    assert_eq!(deps[1], project.inc.join("sub/pins.h"));
    // a leading dot resolves relative to the including file
    assert_eq!(deps[2].file_name().unwrap(), "local.h");
    assert!(deps[2].starts_with(project.dir.path().join("src")));
}

#[test]
fn classification_across_builds() {
    let project = Project::new();
    let header = project.write("inc/app.h", "#define APP 1\n");
    let main = project.write("src/main.c", "#include \"app.h\"\n");
    backdate(&header);
    backdate(&main);

    // first build: everything is new
    let mut store = StoreHandle::open(&project.store_dir()).unwrap();
    let mut tracker = DepTracker::new(&project.inc_dirs());
    tracker.load(&store);
    assert_eq!(tracker.classify(&main), FileState::New);
    tracker.persist(&mut store, Table::Confirmed);
    store.save().unwrap();

    // second build, nothing touched: stable
    let store = StoreHandle::open(&project.store_dir()).unwrap();
    let mut tracker = DepTracker::new(&project.inc_dirs());
    tracker.load(&store);
    assert_eq!(tracker.classify(&main), FileState::Stable);

    // third build after the header changed: the source is stale even
    // though its own text never moved
    project.write("inc/app.h", "#define APP 2\n");
    let store = StoreHandle::open(&project.store_dir()).unwrap();
    let mut tracker = DepTracker::new(&project.inc_dirs());
    tracker.load(&store);
    assert_eq!(tracker.classify(&main), FileState::Changed);
}

#[test]
fn backdated_file_with_stable_deps_stays_stable() {
    let project = Project::new();
    let main = project.write("src/main.c", "int main(void) { return 0; }\n");

    // seed a confirmed record stamped well after the file's actual mtime,
    // as if the tree were restored from a backup with old timestamps
    let current: u64 = mcbuild::depscan::mtime_stamp(&main)
        .unwrap()
        .parse()
        .unwrap();
    let mut store = StoreHandle::open(&project.store_dir()).unwrap();
    store.upsert(
        Table::Confirmed,
        main.clone(),
        mcbuild::depscan::store::DepRecord {
            mtime: (current + 100).to_string(),
            deps: Vec::new(),
        },
    );
    store.save().unwrap();

    let store = StoreHandle::open(&project.store_dir()).unwrap();
    let mut tracker = DepTracker::new(&project.inc_dirs());
    tracker.load(&store);
    assert_eq!(tracker.classify(&main), FileState::Stable);
}

#[test]
fn staging_then_promote_round_trip() {
    let project = Project::new();
    let main = project.write("src/main.c", "int main(void) { return 0; }\n");
    backdate(&main);

    let mut store = StoreHandle::open(&project.store_dir()).unwrap();
    let mut tracker = DepTracker::new(&project.inc_dirs());
    tracker.load(&store);
    tracker.classify(&main);
    tracker.persist(&mut store, Table::Staging);
    store.save().unwrap();

    // staging alone must not influence the next load
    let store = StoreHandle::open(&project.store_dir()).unwrap();
    let mut tracker = DepTracker::new(&project.inc_dirs());
    tracker.load(&store);
    assert_eq!(tracker.classify(&main), FileState::New);

    // promotion makes the staging records authoritative
    let mut store = StoreHandle::open(&project.store_dir()).unwrap();
    store.promote();
    store.save().unwrap();

    let store = StoreHandle::open(&project.store_dir()).unwrap();
    let mut tracker = DepTracker::new(&project.inc_dirs());
    tracker.load(&store);
    assert_eq!(tracker.classify(&main), FileState::Stable);
}

#[test]
fn corrupt_store_degrades_to_cold_cache() {
    let project = Project::new();
    let main = project.write("src/main.c", "\n");
    backdate(&main);

    fs::create_dir_all(project.store_dir()).unwrap();
    fs::write(
        project.store_dir().join(mcbuild::depscan::store::STORE_FILE),
        "not json at all",
    )
    .unwrap();

    let store = StoreHandle::open(&project.store_dir()).unwrap();
    let mut tracker = DepTracker::new(&project.inc_dirs());
    tracker.load(&store);
    assert_eq!(tracker.classify(&main), FileState::New);
}

#[test]
fn missing_file_classifies_as_changed() {
    let project = Project::new();
    let ghost = project.dir.path().join("src/ghost.c");

    let mut tracker = DepTracker::new(&project.inc_dirs());
    assert_eq!(tracker.classify(&ghost), FileState::Changed);
}
