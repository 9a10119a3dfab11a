use assert_cmd::cargo::cargo_bin_cmd;
use std::{error::Error, fs};
use tempfile::tempdir;

fn beat_list(n: usize, interval: f64) -> String {
    (0..n).map(|i| format!("{}\n", i as f64 * interval)).collect()
}

#[test]
fn rate_csv_from_stdin() -> Result<(), Box<dyn Error>> {
    let mut cmd = cargo_bin_cmd!("beatfix");
    cmd.args(["rate", "--window", "1", "--unit", "hz"])
        .write_stdin(beat_list(12, 0.25));
    let output = cmd.assert().success().get_output().stdout.clone();
    let text = String::from_utf8(output)?;
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("time,rate_hz"));
    assert_eq!(lines.next(), Some("0.000000,"));
    assert_eq!(text.lines().last(), Some("2.750000,4.000000"));
    Ok(())
}

#[test]
fn exclusions_blank_the_rate() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("beats.txt");
    let out = dir.path().join("rate.csv");
    fs::write(&input, beat_list(40, 0.25))?;
    let mut cmd = cargo_bin_cmd!("beatfix");
    cmd.args([
        "rate",
        "--input",
        input.to_str().expect("utf8 path"),
        "--window",
        "1",
        "--exclude",
        "3:4",
        "--out",
        out.to_str().expect("utf8 path"),
    ]);
    cmd.assert().success();
    let text = fs::read_to_string(&out)?;
    for line in text.lines().skip(1) {
        let (time, rate) = line.split_once(',').expect("two columns");
        let time: f64 = time.parse()?;
        if (3.0..=5.0).contains(&time) {
            assert!(rate.is_empty(), "{line}");
        } else if time >= 1.0 {
            assert_eq!(rate, "240.000000", "{line}");
        }
    }
    Ok(())
}

#[test]
fn unsorted_beats_are_rejected() {
    let mut cmd = cargo_bin_cmd!("beatfix");
    cmd.args(["rate"]).write_stdin("0.5\n0.2\n");
    cmd.assert().failure();
}

#[test]
fn plot_rate_needs_a_defined_rate() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let session = dir.path().join("session.json");
    fs::write(
        &session,
        r#"{
            "provenance": {"source_path": "rec.txt", "created": "2024-01-01T00:00:00Z"},
            "raw_fs": 2000.0,
            "processing_fs": 2000.0,
            "heart_beats": [0.5],
            "parameters": {"schema_version": 2, "species": "mouse"}
        }"#,
    )?;
    let mut cmd = cargo_bin_cmd!("beatfix");
    cmd.args([
        "plot-rate",
        "--session",
        session.to_str().expect("utf8 path"),
        "--out",
        dir.path().join("rate.png").to_str().expect("utf8 path"),
    ]);
    cmd.assert().failure();
    Ok(())
}
