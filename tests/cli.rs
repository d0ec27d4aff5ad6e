mod common;

use assert_cmd::Command;
use common::TestWorkspace;
use predicates::prelude::*;
use predicates::str::contains;
use sheet_importer::{cell::Cell, store::JsonRecordStore, template::CATEGORY, terms::Term};

fn sheet_importer() -> Command {
    Command::cargo_bin("sheet-importer").expect("binary exists")
}

fn seed(workspace: &TestWorkspace) -> (String, String, String) {
    let rows = workspace.write_csv(
        "rows.csv",
        &[
            &["Title", "Cat", "UID"],
            &["Alpha", "news|tech", "1"],
            &["Beta", "sports", "2"],
        ],
    );
    let mapping = workspace.write(
        "mapping.yaml",
        "uniqid: UID\ncore/title: Title\nclassify/category: Cat\n",
    );
    let state = workspace.path().join("state");
    (
        rows.to_string_lossy().into_owned(),
        mapping.to_string_lossy().into_owned(),
        state.to_string_lossy().into_owned(),
    )
}

#[test]
fn columns_lists_codes_and_slugs() {
    let workspace = TestWorkspace::new();
    let (rows, _, _) = seed(&workspace);
    sheet_importer()
        .args(["columns", "-i", rows.as_str()])
        .assert()
        .success()
        .stdout(contains("1    A     title  Title"))
        .stdout(contains("3    C     uid    UID"));
}

#[test]
fn import_persists_records_progress_and_history() {
    let workspace = TestWorkspace::new();
    let (rows, mapping, state) = seed(&workspace);

    sheet_importer()
        .args([
            "import", "-i", rows.as_str(), "-m", mapping.as_str(), "--state-dir", state.as_str(), "--kind", "post",
            "--principal", "5",
        ])
        .assert()
        .success()
        .stdout(contains("status: complete"))
        .stdout(contains("processed: 2/2"))
        .stdout(contains("1=inserted, 2=inserted"));

    let store = JsonRecordStore::open(&workspace.path().join("state/records.json"))
        .expect("record store written");
    let (_, alpha) = store
        .entities()
        .find(|(_, entity)| entity.field("title") == Some(&Cell::from("Alpha")))
        .expect("Alpha imported");
    assert_eq!(alpha.terms(CATEGORY), &[Term::from("news"), Term::from("tech")]);

    sheet_importer()
        .args([
            "progress", "--state-dir", state.as_str(), "--kind", "post", "--principal", "5", "--json",
        ])
        .assert()
        .success()
        .stdout(contains("\"status\": \"complete\""));

    sheet_importer()
        .args(["progress", "--state-dir", state.as_str(), "--kind", "post", "--principal", "6"])
        .assert()
        .success()
        .stdout(contains("status: none"));

    sheet_importer()
        .args(["history", "--state-dir", state.as_str(), "--kind", "post", "--detailed"])
        .assert()
        .success()
        .stdout(contains("rows.csv"))
        .stdout(contains("complete"))
        .stdout(contains("record 2: inserted"));
}

#[test]
fn second_import_updates_instead_of_duplicating() {
    let workspace = TestWorkspace::new();
    let (rows, mapping, state) = seed(&workspace);
    let args = ["import", "-i", rows.as_str(), "-m", mapping.as_str(), "--state-dir", state.as_str()];

    sheet_importer().args(args).assert().success();
    sheet_importer()
        .args(args)
        .assert()
        .success()
        .stdout(contains("1=updated, 2=updated"));

    let store = JsonRecordStore::open(&workspace.path().join("state/records.json")).unwrap();
    assert_eq!(store.entities().count(), 2);
}

#[test]
fn cell_filter_expression_transforms_values() {
    let workspace = TestWorkspace::new();
    let (rows, mapping, state) = seed(&workspace);

    sheet_importer()
        .args([
            "import",
            "-i",
            rows.as_str(),
            "-m",
            mapping.as_str(),
            "--state-dir",
            state.as_str(),
            "--cell-filter",
            "Title=str::to_uppercase(value)",
        ])
        .assert()
        .success();

    let store = JsonRecordStore::open(&workspace.path().join("state/records.json")).unwrap();
    assert!(
        store
            .entities()
            .any(|(_, entity)| entity.field("title") == Some(&Cell::from("ALPHA")))
    );
}

#[test]
fn failed_import_reports_error_and_keeps_history() {
    let workspace = TestWorkspace::new();
    let (rows, _, state) = seed(&workspace);
    let mapping = workspace.write("broken.yaml", "core/title: Title\n");
    let mapping = mapping.to_string_lossy().into_owned();

    sheet_importer()
        .args(["import", "-i", rows.as_str(), "-m", mapping.as_str(), "--state-dir", state.as_str()])
        .assert()
        .failure()
        .stderr(contains("error:").and(contains("A unique ID must be established")));

    sheet_importer()
        .args(["history", "--state-dir", state.as_str()])
        .assert()
        .success()
        .stdout(contains("rows.csv").and(contains("error")));
}

#[test]
fn unsupported_file_type_is_rejected() {
    let workspace = TestWorkspace::new();
    let (_, mapping, state) = seed(&workspace);
    let notes = workspace.write("notes.txt", "hello\n");
    let notes = notes.to_string_lossy().into_owned();

    sheet_importer()
        .args(["import", "-i", notes.as_str(), "-m", mapping.as_str(), "--state-dir", state.as_str()])
        .assert()
        .failure()
        .stderr(contains("is not supported"));
}
