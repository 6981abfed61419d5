use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_mastermarksd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("MASTERMARKS_WORKSPACE")
        .spawn()
        .expect("spawn mastermarksd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(value["ok"], true, "{} failed: {}", method, value);
    value["result"].clone()
}

fn error_code(value: &serde_json::Value) -> &str {
    value["error"]["code"].as_str().unwrap_or("")
}

#[test]
fn weights_default_until_updated_and_reject_bad_values() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );

    let initial = request_ok(&mut stdin, &mut reader, "2", "weights.get", json!({}));
    assert_eq!(initial["isDefault"], true);
    assert_eq!(initial["midWeight"], 10);
    assert_eq!(initial["classWeight"], 20);
    assert_eq!(initial["examWeight"], 70);
    assert_eq!(initial["sumIs100"], true);

    // Sum is not enforced, only reported.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "weights.update",
        json!({ "midWeight": 15, "classWeight": 25, "examWeight": 50 }),
    );
    assert_eq!(updated["sum"], 90);
    assert_eq!(updated["sumIs100"], false);

    let stored = request_ok(&mut stdin, &mut reader, "4", "weights.get", json!({}));
    assert_eq!(stored["isDefault"], false);
    assert_eq!(stored["midWeight"], 15);
    assert_eq!(stored["examWeight"], 50);

    for (i, params) in [
        json!({ "midWeight": -1, "classWeight": 20, "examWeight": 70 }),
        json!({ "midWeight": 10.5, "classWeight": 20, "examWeight": 70 }),
        json!({ "midWeight": 10, "examWeight": 70 }),
    ]
    .into_iter()
    .enumerate()
    {
        let id = format!("bad-{}", i);
        let resp = request(&mut stdin, &mut reader, &id, "weights.update", params);
        assert_eq!(resp["ok"], false);
        assert_eq!(error_code(&resp), "bad_params");
    }

    // Rejected updates leave the stored row alone.
    let after = request_ok(&mut stdin, &mut reader, "5", "weights.get", json!({}));
    assert_eq!(after["midWeight"], 15);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn remark_bands_replace_list_and_report_coverage() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );

    let empty = request_ok(&mut stdin, &mut reader, "2", "remarks.coverage", json!({}));
    assert_eq!(empty["gaps"], json!([{ "from": 0.0, "to": 100.0 }]));

    let replaced = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "remarks.replace",
        json!({
            "bands": [
                { "minMark": 80, "maxMark": 100, "grade": "A", "remark": "Excellent" },
                { "minMark": 70, "maxMark": 79, "grade": "B", "remark": "Very Good" },
                { "minMark": 0, "maxMark": 72, "grade": "F", "remark": "Fail" }
            ]
        }),
    );
    assert_eq!(replaced["count"], 3);
    assert_eq!(
        replaced["coverage"]["gaps"],
        json!([{ "from": 79.01, "to": 79.99 }])
    );
    assert_eq!(
        replaced["coverage"]["overlaps"],
        json!([{ "winner": 1, "shadowed": 2, "range": { "from": 70.0, "to": 72.0 } }])
    );

    let listed = request_ok(&mut stdin, &mut reader, "4", "remarks.list", json!({}));
    let grades: Vec<&str> = listed["bands"]
        .as_array()
        .expect("bands")
        .iter()
        .map(|b| b["grade"].as_str().expect("grade"))
        .collect();
    assert_eq!(grades, vec!["A", "B", "F"]);
    assert_eq!(listed["bands"][1]["remark"], "Very Good");

    let coverage = request_ok(&mut stdin, &mut reader, "5", "remarks.coverage", json!({}));
    assert_eq!(coverage["overlaps"].as_array().expect("overlaps").len(), 1);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn remark_bands_validate_before_replacing() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "remarks.replace",
        json!({ "bands": [{ "minMark": 0, "maxMark": 100, "grade": "P", "remark": "Pass" }] }),
    );

    let inverted = request(
        &mut stdin,
        &mut reader,
        "3",
        "remarks.replace",
        json!({ "bands": [{ "minMark": 60, "maxMark": 50, "grade": "C" }] }),
    );
    assert_eq!(error_code(&inverted), "bad_params");
    assert_eq!(inverted["error"]["details"]["index"], 0);

    let out_of_range = request(
        &mut stdin,
        &mut reader,
        "4",
        "remarks.replace",
        json!({ "bands": [
            { "minMark": 0, "maxMark": 50, "grade": "C" },
            { "minMark": 51, "maxMark": 101, "grade": "A" }
        ] }),
    );
    assert_eq!(error_code(&out_of_range), "bad_params");
    assert_eq!(out_of_range["error"]["details"]["index"], 1);

    let blank_grade = request(
        &mut stdin,
        &mut reader,
        "5",
        "remarks.replace",
        json!({ "bands": [{ "minMark": 0, "maxMark": 50, "grade": "  " }] }),
    );
    assert_eq!(error_code(&blank_grade), "bad_params");

    let not_a_list = request(
        &mut stdin,
        &mut reader,
        "6",
        "remarks.replace",
        json!({ "bands": "A=80-100" }),
    );
    assert_eq!(error_code(&not_a_list), "bad_params");

    let listed = request_ok(&mut stdin, &mut reader, "7", "remarks.list", json!({}));
    assert_eq!(listed["bands"].as_array().expect("bands").len(), 1);
    assert_eq!(listed["bands"][0]["grade"], "P");

    drop(stdin);
    let _ = child.wait();
}
