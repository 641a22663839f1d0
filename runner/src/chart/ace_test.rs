use super::*;
use flate2::{write::GzEncoder, Compression};
use serde_json::json;
use std::{io::Write, os::unix::fs::PermissionsExt, path::PathBuf};

fn table() -> Value {
    json!({
        "  version": "acmacs-ace-v1",
        "c": {
            "i": {"D": "20210301", "l": "CDC"},
            "a": [{"N": "A/HK/1/2020"}, {"N": "A/HK/2/2020"}, {"N": "A/HK/3/2020"}],
            "s": [
                {"N": "A/HK/1/2020", "I": "F1"},
                {"N": "A/HK/2/2020", "R": "NYMC-1", "a": ["BOOST"], "I": "F2"}
            ],
            "t": {"l": [["40", "<10"], ["320", "*"], [">1280", "20"]]}
        }
    })
}

fn write_chart(dir: &Path, name: &str, value: &Value) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_vec(value).unwrap()).unwrap();
    path
}

#[test]
fn logged_titers() {
    assert_eq!(logged_titer("40"), Some(2.0));
    assert_eq!(logged_titer("<10"), Some(-1.0));
    assert_eq!(logged_titer(">1280"), Some(8.0));
    assert_eq!(logged_titer("*"), None);
    assert_eq!(logged_titer(""), None);
}

#[test]
fn summary_of_a_single_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_chart(dir.path(), "t.ace", &table());

    let summary = AceStore::new("chart-merge").summary(&path).unwrap();

    assert_eq!(
        summary,
        ChartSummary {
            date: String::from("20210301"),
            layers: 0,
            projections: 0,
            antigens: 3,
            sera: 2,
            stress: None,
        }
    );
}

#[test]
fn summary_of_a_merge() {
    let dir = tempfile::tempdir().unwrap();
    let merge = json!({"c": {
        "i": {"S": [{"D": "20210301"}, {"D": "20200101"}, {"D": "20201001"}]},
        "a": [], "s": [],
        "t": {"L": [{}, {}, {}]},
        "P": [{"s": 1234.5}, {"s": 1300.0}]
    }});
    let path = write_chart(dir.path(), "m.ace", &merge);

    let summary = AceStore::new("chart-merge").summary(&path).unwrap();

    assert_eq!(summary.date, "20200101-20210301");
    assert_eq!(summary.layers, 3);
    assert_eq!(summary.projections, 2);
    assert_eq!(summary.stress, Some(1234.5));
}

#[test]
fn gzip_compressed_charts_are_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.ace");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&serde_json::to_vec(&table()).unwrap())
        .unwrap();
    fs::write(&path, encoder.finish().unwrap()).unwrap();

    assert_eq!(AceStore::new("m").summary(&path).unwrap().sera, 2);
}

#[test]
fn charts_without_date_are_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_chart(dir.path(), "t.ace", &json!({"c": {"a": [], "s": []}}));

    assert!(matches!(
        AceStore::new("m").summary(&path),
        Err(ChartError::Invalid { .. })
    ));
}

#[test]
fn column_bases_from_titers() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_chart(dir.path(), "t.ace", &table());
    let store = AceStore::new("m");

    let bases = store.column_bases(&path, &MinimumColumnBasis::None).unwrap();
    assert_eq!(
        bases,
        [
            SerumColumnBasis {
                serum: String::from("A/HK/1/2020 F1"),
                column_basis: 8.0
            },
            SerumColumnBasis {
                serum: String::from("A/HK/2/2020 NYMC-1 BOOST F2"),
                column_basis: 1.0
            }
        ]
    );

    let clamped = store
        .column_bases(&path, &MinimumColumnBasis::Titer(1280))
        .unwrap();
    assert_eq!(clamped[0].column_basis, 8.0);
    assert_eq!(clamped[1].column_basis, 7.0);
}

#[test]
fn sparse_titers() {
    let dir = tempfile::tempdir().unwrap();
    let mut chart = table();
    chart["c"]["t"] = json!({"d": [{"0": "40"}, {"1": "160"}, {"0": "80", "1": "<10"}]});
    let path = write_chart(dir.path(), "t.ace", &chart);

    let bases = AceStore::new("m")
        .column_bases(&path, &MinimumColumnBasis::None)
        .unwrap();

    assert_eq!(bases[0].column_basis, 3.0);
    assert_eq!(bases[1].column_basis, 4.0);
}

#[test]
fn exported_column_bases_are_forced() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_chart(dir.path(), "t.ace", &table());
    let output = dir.path().join("t.mcb-table.ace");
    let store = AceStore::new("m");

    store
        .export_with_column_bases(&source, &[9.0, 7.5], &output)
        .unwrap();

    let bases = store
        .column_bases(&output, &MinimumColumnBasis::Titer(20480))
        .unwrap();
    assert_eq!(bases[0].column_basis, 9.0);
    assert_eq!(bases[1].column_basis, 7.5);

    assert!(matches!(
        store.export_with_column_bases(&source, &[9.0], &output),
        Err(ChartError::Invalid { .. })
    ));
}

fn merge_script(dir: &Path, body: &str) -> String {
    let path = dir.join("chart-merge");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn merge_runs_the_merge_program() {
    let dir = tempfile::tempdir().unwrap();
    let program = merge_script(
        dir.path(),
        r#"echo "$@" > "$(dirname "$0")/arguments"
while [ $# -gt 0 ]; do if [ "$1" = "-o" ]; then shift; out="$1"; fi; shift; done
echo merged > "$out""#,
    );
    let output = dir.path().join("001.merge.ace");

    AceStore::new(program)
        .merge_incremental(
            Path::new("a.ace"),
            Path::new("b.ace"),
            &output,
            &MergeOptions {
                combine_cheating_assays: true,
            },
        )
        .unwrap();

    assert!(output.exists());
    let arguments = fs::read_to_string(dir.path().join("arguments")).unwrap();
    assert_eq!(
        arguments.trim(),
        format!(
            "--match strict --merge-type incremental --combine-cheating-assays -o {} a.ace b.ace",
            output.display()
        )
    );
}

#[test]
fn failed_merge_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let program = merge_script(dir.path(), "echo 'no common antigens' >&2\nexit 4");

    let result = AceStore::new(program).merge_incremental(
        Path::new("a.ace"),
        Path::new("b.ace"),
        &dir.path().join("m.ace"),
        &MergeOptions::default(),
    );

    match result {
        Err(ChartError::Merge { output, .. }) => assert!(output.contains("no common antigens")),
        other => panic!("unexpected merge result: {other:?}"),
    }
}
