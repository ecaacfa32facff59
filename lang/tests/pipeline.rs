//! End-to-end builds over real directories: discovery, compilation,
//! artifact layout, and the published index.

use std::{fs, path::Path};

use sable::{
    bytecode::{ArtifactHeader, Opcode},
    index::{Index, INDEX_FILE_NAME},
    pipeline::{name_hash, BuildRequest, DriverState, IdRule, Pipeline},
    RunError,
};

const COMPONENTS: &str = r#"
[[component]]
name = "ui"
id = 4

[[component.member]]
name = "say"
kind = "method"
args = ["string"]

[[component.member]]
name = "prompt"
kind = "method"
args = ["string"]
returns = "int"

[[component.member]]
name = "title"
kind = "field"
type = "string"
"#;

fn write_file(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn request(root: &Path) -> BuildRequest {
    BuildRequest {
        input_dir: root.join("scripts"),
        output_dir: root.join("out"),
        components_file: Some(root.join("components.toml")),
        id_rule: IdRule::default(),
        bindings_dir: None,
    }
}

fn setup(root: &Path) {
    write_file(&root.join("components.toml"), COMPONENTS);
    fs::create_dir_all(root.join("scripts")).unwrap();
}

#[test]
fn a_script_builds_into_an_artifact_and_an_index_entry() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(
        &dir.path().join("scripts/town/greet.script"),
        ".id 7\nconst greeting = \"hello\"\nui.say(greeting)\nreturn\n",
    );

    let mut pipeline = Pipeline::default();
    let report = pipeline.run(&request(dir.path())).unwrap();
    assert_eq!(report.compiled, 1);
    assert_eq!(pipeline.state(), DriverState::Done);

    let artifact = fs::read(dir.path().join("out/7.sbc")).unwrap();
    let header = ArtifactHeader::parse(&artifact).unwrap();
    assert_eq!(header.id, 7);
    assert_eq!(header.pool_count, 1);
    assert_eq!(header.code_len, 10);

    let index = Index::decode(&fs::read(&report.index_path).unwrap()).unwrap();
    assert_eq!(index.len(), 1);
    let entry = index.get(7).unwrap();
    assert_eq!(entry.offset, 26);
    assert_eq!(entry.length, 10);

    // The index entry points straight at the code section: push the
    // pooled string, invoke ui.say with one argument, return.
    let code = &artifact[entry.offset as usize..][..entry.length as usize];
    assert_eq!(
        code,
        [
            Opcode::Push as u8, 0, 0,
            Opcode::Invoke as u8, 4, 0, 0, 0, 1,
            Opcode::Ret as u8,
        ]
    );
}

#[test]
fn every_failing_script_is_reported_and_nothing_is_published() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(&dir.path().join("scripts/good.script"), "ui.say(\"hi\")\n");
    write_file(&dir.path().join("scripts/bad.script"), "goto nowhere\n");
    write_file(&dir.path().join("scripts/worse.script"), "x = 1\n");

    let mut pipeline = Pipeline::default();
    let err = pipeline.run(&request(dir.path())).unwrap_err();
    let RunError::Compile(diagnostics) = err else {
        panic!("expected compile diagnostics");
    };
    assert_eq!(diagnostics.len(), 2);
    let scripts: Vec<_> = diagnostics.iter().map(|d| d.script.as_str()).collect();
    assert!(scripts.contains(&"bad"));
    assert!(scripts.contains(&"worse"));
    assert_eq!(pipeline.state(), DriverState::Failed);
    assert!(!dir.path().join("out").exists());
}

#[test]
fn a_broken_interface_file_stops_the_run_before_compilation() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("components.toml"), "[[component]\nbroken");
    fs::create_dir_all(dir.path().join("scripts")).unwrap();

    let mut pipeline = Pipeline::default();
    let err = pipeline.run(&request(dir.path())).unwrap_err();
    assert!(matches!(err, RunError::Interface(_)));
    assert_eq!(pipeline.state(), DriverState::Failed);
}

#[test]
fn a_duplicate_component_id_aborts_with_both_names() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("components.toml"),
        r#"
[[component]]
name = "ui"
id = 4

[[component]]
name = "audio"
id = 4
"#,
    );
    fs::create_dir_all(dir.path().join("scripts")).unwrap();
    write_file(&dir.path().join("scripts/greet.script"), "return\n");

    let mut pipeline = Pipeline::default();
    let err = pipeline.run(&request(dir.path())).unwrap_err();
    let RunError::Interface(inner) = err else {
        panic!("expected an interface-load failure");
    };
    let message = inner.to_string();
    assert!(message.contains("ui"), "unexpected message: {message}");
    assert!(message.contains("audio"), "unexpected message: {message}");
    assert_eq!(pipeline.state(), DriverState::Failed);
    assert!(!dir.path().join("out").exists());
}

#[test]
fn forward_label_references_work_within_each_script() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(
        &dir.path().join("scripts/a.script"),
        ".id 9\ngoto start\nstart:\nreturn\n",
    );
    write_file(
        &dir.path().join("scripts/b.script"),
        ".id 3\ngoto start\nstart:\nreturn\n",
    );

    let mut pipeline = Pipeline::default();
    let report = pipeline.run(&request(dir.path())).unwrap();
    assert_eq!(report.compiled, 2);

    let index = Index::decode(&fs::read(&report.index_path).unwrap()).unwrap();
    let ids: Vec<u32> = index.entries().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![3, 9]);
}

#[test]
fn labels_are_invisible_across_scripts() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(&dir.path().join("scripts/a.script"), "start:\nreturn\n");
    write_file(&dir.path().join("scripts/b.script"), "goto start\n");

    let err = Pipeline::default().run(&request(dir.path())).unwrap_err();
    let RunError::Compile(diagnostics) = err else {
        panic!("expected compile diagnostics");
    };
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].script, "b");
    assert!(diagnostics[0].to_string().contains("start"));
}

#[test]
fn colliding_declared_ids_name_both_scripts() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(&dir.path().join("scripts/a.script"), ".id 9\nreturn\n");
    write_file(&dir.path().join("scripts/b.script"), ".id 9\nreturn\n");

    let mut pipeline = Pipeline::default();
    let err = pipeline.run(&request(dir.path())).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("\"a\""), "unexpected message: {message}");
    assert!(message.contains("\"b\""), "unexpected message: {message}");
    assert_eq!(pipeline.state(), DriverState::Failed);
    assert!(!dir.path().join("out").exists());
}

#[test]
fn rebuilding_clears_stale_output_and_stays_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(&dir.path().join("scripts/greet.script"), ".id 3\nui.say(\"hi\")\n");

    let req = request(dir.path());
    Pipeline::default().run(&req).unwrap();
    let first_artifact = fs::read(dir.path().join("out/3.sbc")).unwrap();
    let first_index = fs::read(dir.path().join("out").join(INDEX_FILE_NAME)).unwrap();

    // A stray file from an older build must not survive the rebuild.
    write_file(&dir.path().join("out/99.sbc"), "stale");
    Pipeline::default().run(&req).unwrap();
    assert!(!dir.path().join("out/99.sbc").exists());
    assert_eq!(fs::read(dir.path().join("out/3.sbc")).unwrap(), first_artifact);
    assert_eq!(
        fs::read(dir.path().join("out").join(INDEX_FILE_NAME)).unwrap(),
        first_index
    );
}

#[test]
fn the_index_is_published_without_a_staging_leftover() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(&dir.path().join("scripts/greet.script"), "return\n");

    Pipeline::default().run(&request(dir.path())).unwrap();
    assert!(dir.path().join("out").join(INDEX_FILE_NAME).is_file());
    assert!(!dir.path().join("out/index.sbi.tmp").exists());
}

#[test]
fn the_name_hash_rule_names_artifacts_after_the_hash() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(&dir.path().join("scripts/greet.script"), ".id 3\nreturn\n");

    let mut req = request(dir.path());
    req.id_rule = IdRule::NameHash;
    Pipeline::default().run(&req).unwrap();

    let expected = format!("{}.sbc", name_hash("greet"));
    assert!(dir.path().join("out").join(expected).is_file());
    assert!(!dir.path().join("out/3.sbc").exists());
}

#[test]
fn missing_directives_fail_under_the_declared_rule() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(&dir.path().join("scripts/greet.script"), "return\n");

    let mut req = request(dir.path());
    req.id_rule = IdRule::Declared;
    let err = Pipeline::default().run(&req).unwrap_err();
    let RunError::Compile(diagnostics) = err else {
        panic!("expected compile diagnostics");
    };
    assert!(diagnostics[0].to_string().contains(".id"));
}

#[test]
fn an_empty_input_tree_publishes_an_empty_index() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());

    let mut pipeline = Pipeline::default();
    let report = pipeline.run(&request(dir.path())).unwrap();
    assert_eq!(report.compiled, 0);
    assert_eq!(pipeline.state(), DriverState::Done);
    let index = Index::decode(&fs::read(&report.index_path).unwrap()).unwrap();
    assert!(index.is_empty());
}

#[test]
fn requested_bindings_land_next_to_the_build() {
    let dir = tempfile::tempdir().unwrap();
    setup(dir.path());
    write_file(&dir.path().join("scripts/greet.script"), "return\n");

    let mut req = request(dir.path());
    req.bindings_dir = Some(dir.path().join("api"));
    Pipeline::default().run(&req).unwrap();

    let root = fs::read_to_string(dir.path().join("api/mod.rs")).unwrap();
    assert!(root.contains("pub mod ui;"));
    let ui = fs::read_to_string(dir.path().join("api/ui.rs")).unwrap();
    assert!(ui.contains("pub const ID: u16 = 4;"));
}

#[test]
fn scripts_without_components_can_still_build() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("scripts")).unwrap();
    write_file(
        &dir.path().join("scripts/pure.script"),
        ".id 1\nlocal x: int\nx = 2 + 3 * 4\nreturn\n",
    );

    let mut req = request(dir.path());
    req.components_file = None;
    let report = Pipeline::default().run(&req).unwrap();
    assert_eq!(report.compiled, 1);
    assert!(dir.path().join("out/1.sbc").is_file());
}
