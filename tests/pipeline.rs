//! Integration tests for the certificate pipeline.
//!
//! The renderer is replaced by small `sh` scripts written into a temp
//! directory, so these tests need a POSIX shell and run on unix only.
//! Scripts are run as `sh <script>` rather than executed directly, which
//! avoids "text file busy" races on freshly written files.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

#![cfg(unix)]

use certpress::{
    CertError, CertificatePipeline, ImageUpload, PipelineObserver, RejectReason, RenderFailure,
    RunState, ServiceConfig, ServiceConfigBuilder, Submission, REQUIRED_FIELDS,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ── Test helpers ─────────────────────────────────────────────────────────────

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

/// Copies the JSON record into the output.
const ECHO_RECORD: &str = r#"cp "$1" "$2""#;

/// Copies the staged photo into the output.
const ECHO_PHOTO: &str = r#"p=$(sed -n 's/.*"photo_path":"\([^"]*\)".*/\1/p' "$1")
[ -f "$p" ] || { echo "photo missing: $p" >&2; exit 9; }
cp "$p" "$2""#;

struct Harness {
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        std::fs::create_dir(dir.path().join("staging")).expect("staging root");
        Self { dir }
    }

    fn staging(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    /// Write `body` as a shell script and return its path.
    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        path
    }

    fn config(&self, script_body: &str) -> ServiceConfigBuilder {
        let script = self.script("renderer.sh", script_body);
        ServiceConfig::builder()
            .staging_root(self.staging())
            .renderer("sh", [script.to_string_lossy().into_owned()])
            .render_timeout_secs(10)
    }

    fn pipeline(&self, script_body: &str) -> CertificatePipeline {
        CertificatePipeline::new(self.config(script_body).build().unwrap()).unwrap()
    }

    /// Entries left anywhere under the staging root.
    fn leftovers(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            for entry in std::fs::read_dir(dir).into_iter().flatten().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                }
                out.push(path);
            }
        }
        let mut out = Vec::new();
        walk(&self.staging(), &mut out);
        out
    }
}

fn submission(child_name: &str) -> Submission {
    REQUIRED_FIELDS.iter().fold(Submission::new(), |s, key| {
        let value = if *key == "child_name" {
            child_name.to_string()
        } else {
            format!("{key} value")
        };
        s.with_field(*key, value)
    })
}

fn record_of(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).expect("renderer output is the JSON record")
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<RunState>>,
    rejections: Mutex<Vec<RejectReason>>,
}

impl PipelineObserver for Recorder {
    fn on_transition(&self, _run_id: &str, _from: RunState, to: RunState) {
        self.states.lock().unwrap().push(to);
    }

    fn on_upload_rejected(&self, _run_id: &str, reason: &RejectReason) {
        self.rejections.lock().unwrap().push(reason.clone());
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_field_fails_before_any_staging() {
    let h = Harness::new();
    let p = h.pipeline(ECHO_RECORD);
    for &missing in REQUIRED_FIELDS {
        let mut s = submission("Amal");
        s.fields.remove(missing);
        match p.generate(s).await {
            Err(CertError::Validation { field }) => assert_eq!(field, missing),
            other => panic!("expected validation error for {missing}, got {other:?}"),
        }
    }
    assert!(h.leftovers().is_empty());
}

// ── Success paths ────────────────────────────────────────────────────────────

#[tokio::test]
async fn success_without_image() {
    let h = Harness::new();
    let rec = Arc::new(Recorder::default());
    let p = CertificatePipeline::new(h.config(ECHO_RECORD).observer(rec.clone()).build().unwrap())
        .unwrap();

    let doc = p.generate(submission("Amal")).await.unwrap();
    let record = record_of(&doc.bytes);
    assert_eq!(record["child_name"], "Amal");
    assert_eq!(record["amount"], "amount value");
    assert!(record["photo_filename"].is_null());
    assert_eq!(doc.content_type, "application/pdf");
    assert!(h.leftovers().is_empty());

    use RunState::*;
    assert_eq!(
        *rec.states.lock().unwrap(),
        vec![Validated, Staged, Rendering, Succeeded, Cleaned]
    );
    assert_eq!(*rec.rejections.lock().unwrap(), vec![RejectReason::Absent]);
}

#[tokio::test]
async fn photo_is_staged_for_the_renderer() {
    let h = Harness::new();
    let p = h.pipeline(ECHO_PHOTO);
    let s = submission("Amal").with_image(ImageUpload::new("Family Photo.PNG", PNG));
    let doc = p.generate(s).await.unwrap();
    assert_eq!(doc.bytes, PNG);
    assert!(h.leftovers().is_empty());
}

#[tokio::test]
async fn attachment_name_comes_from_child_name() {
    let h = Harness::new();
    let p = h.pipeline(ECHO_RECORD);

    let doc = p.generate(submission("Amal Hassan")).await.unwrap();
    assert_eq!(doc.filename, "adoption_certificate_Amal_Hassan.pdf");

    let doc = p.generate(submission("../../etc/passwd")).await.unwrap();
    assert_eq!(doc.filename, "adoption_certificate_etc_passwd.pdf");

    let doc = p.generate(submission("محمد")).await.unwrap();
    assert_eq!(doc.filename, "adoption_certificate.pdf");
}

#[tokio::test]
async fn executable_upload_is_silently_dropped() {
    let h = Harness::new();
    let rec = Arc::new(Recorder::default());
    let p = CertificatePipeline::new(h.config(ECHO_RECORD).observer(rec.clone()).build().unwrap())
        .unwrap();

    let s = submission("Amal").with_image(ImageUpload::new("setup.exe", b"MZ\x90\0".to_vec()));
    let doc = p.generate(s).await.unwrap();
    assert!(record_of(&doc.bytes)["photo_filename"].is_null());
    assert_eq!(
        *rec.rejections.lock().unwrap(),
        vec![RejectReason::DisallowedExtension(Some("exe".into()))]
    );
    assert!(h.leftovers().is_empty());
}

// ── Renderer failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn nonzero_exit_is_a_render_error() {
    let h = Harness::new();
    let rec = Arc::new(Recorder::default());
    let p = CertificatePipeline::new(
        h.config("echo 'ReferenceError: amount is not defined' >&2; exit 2")
            .observer(rec.clone())
            .build()
            .unwrap(),
    )
    .unwrap();

    let s = submission("Amal").with_image(ImageUpload::new("me.png", PNG));
    match p.generate(s).await {
        Err(CertError::Render(RenderFailure::Exited { code, diagnostic })) => {
            assert_eq!(code, Some(2));
            assert!(diagnostic.contains("ReferenceError"));
        }
        other => panic!("expected render error, got {other:?}"),
    }
    assert!(h.leftovers().is_empty());
    use RunState::*;
    assert_eq!(
        *rec.states.lock().unwrap(),
        vec![Validated, Staged, Rendering, Failed, Cleaned]
    );
}

#[tokio::test]
async fn zero_exit_without_output_is_a_render_error() {
    let h = Harness::new();
    let p = h.pipeline("exit 0");
    let err = p.generate(submission("Amal")).await.unwrap_err();
    assert!(
        matches!(err, CertError::Render(RenderFailure::MissingOutput { .. })),
        "got {err:?}"
    );
    assert!(h.leftovers().is_empty());
}

#[tokio::test]
async fn missing_renderer_is_a_render_error() {
    let h = Harness::new();
    let config = ServiceConfig::builder()
        .staging_root(h.staging())
        .renderer(h.dir.path().join("no-such-renderer"), Vec::<String>::new())
        .build()
        .unwrap();
    let p = CertificatePipeline::new(config).unwrap();
    let err = p.generate(submission("Amal")).await.unwrap_err();
    assert!(matches!(err, CertError::Render(RenderFailure::Spawn { .. })));
    assert!(h.leftovers().is_empty());
}

/// Renderer that records its own pid and a forked helper's pid, then
/// hangs on the helper.
fn forking_hang(h: &Harness) -> (String, PathBuf, PathBuf) {
    let renderer_pid = h.dir.path().join("renderer.pid");
    let helper_pid = h.dir.path().join("helper.pid");
    let body = format!(
        "echo $$ > '{}'\nsleep 30 &\necho $! > '{}'\nwait",
        renderer_pid.display(),
        helper_pid.display()
    );
    (body, renderer_pid, helper_pid)
}

fn pid_in(file: &Path) -> i32 {
    std::fs::read_to_string(file)
        .expect("pid file written")
        .trim()
        .parse()
        .expect("numeric pid")
}

/// True while `pid` exists and is not a zombie awaiting its reaper.
fn is_running(pid: i32) -> bool {
    if Path::new("/proc/self/stat").exists() {
        return std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| stat.rsplit_once(") ").map(|(_, rest)| !rest.starts_with('Z')))
            .unwrap_or(false);
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

async fn gone_within(pid: i32, limit: Duration) -> bool {
    let deadline = std::time::Instant::now() + limit;
    while std::time::Instant::now() < deadline {
        if !is_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !is_running(pid)
}

async fn wait_for_file(path: &Path) {
    for _ in 0..100 {
        if path.exists() && std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never appeared", path.display());
}

#[tokio::test]
async fn hung_renderer_is_killed_and_cleaned_up() {
    let h = Harness::new();
    let (body, renderer_pid, helper_pid) = forking_hang(&h);
    let p = CertificatePipeline::new(h.config(&body).render_timeout_secs(1).build().unwrap())
        .unwrap();

    let started = std::time::Instant::now();
    let err = p
        .generate(submission("Amal").with_image(ImageUpload::new("me.png", PNG)))
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::RenderTimeout { secs: 1 }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(h.leftovers().is_empty());

    for file in [&renderer_pid, &helper_pid] {
        let pid = pid_in(file);
        assert!(gone_within(pid, Duration::from_secs(5)).await, "pid {pid} still alive");
    }
}

#[tokio::test]
async fn dropped_run_cleans_up_without_a_connection() {
    let h = Harness::new();
    let (body, renderer_pid, helper_pid) = forking_hang(&h);
    let p = CertificatePipeline::new(h.config(&body).render_timeout_secs(30).build().unwrap())
        .unwrap();

    let run = p.generate(submission("Amal").with_image(ImageUpload::new("me.png", PNG)));
    let watcher = async {
        wait_for_file(&helper_pid).await;
        assert!(!h.leftovers().is_empty(), "inputs should be staged mid-render");
    };
    // The run never finishes on its own; it is dropped once the helper is up.
    tokio::select! {
        res = run => panic!("run finished unexpectedly: {res:?}"),
        _ = watcher => {}
    }

    assert!(h.leftovers().is_empty(), "left behind: {:?}", h.leftovers());
    for file in [&renderer_pid, &helper_pid] {
        let pid = pid_in(file);
        assert!(gone_within(pid, Duration::from_secs(5)).await, "pid {pid} still alive");
    }
    assert_eq!(p.available_render_slots(), 4);
}

// ── Concurrency ──────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn colliding_uploads_get_distinct_names() {
    let h = Harness::new();
    let p = Arc::new(CertificatePipeline::new(
        h.config(ECHO_RECORD).max_concurrent_renders(32).build().unwrap(),
    )
    .unwrap());

    let tasks: Vec<_> = (0..24)
        .map(|i| {
            let p = Arc::clone(&p);
            tokio::spawn(async move {
                let s = submission(&format!("child{i}"))
                    .with_image(ImageUpload::new("photo.png", PNG));
                p.generate(s).await
            })
        })
        .collect();

    let mut names = HashSet::new();
    for t in futures::future::join_all(tasks).await {
        let doc = t.unwrap().unwrap();
        let record = record_of(&doc.bytes);
        let name = record["photo_filename"].as_str().unwrap().to_string();
        assert!(name.ends_with("_photo.png"), "{name}");
        names.insert(name);
    }
    assert_eq!(names.len(), 24);
    assert!(h.leftovers().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mixed_runs_leak_nothing() {
    let h = Harness::new();
    let script = r#"grep -q '"child_name":"fail' "$1" && { echo boom >&2; exit 1; }
cp "$1" "$2""#;
    let p = Arc::new(CertificatePipeline::new(
        h.config(script).max_concurrent_renders(4).build().unwrap(),
    )
    .unwrap());

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let p = Arc::clone(&p);
            tokio::spawn(async move {
                let name = if i % 2 == 0 { format!("ok{i}") } else { format!("fail{i}") };
                let mut s = submission(&name).with_image(ImageUpload::new("p.png", PNG));
                if i % 5 == 0 {
                    s.fields.remove("amount");
                }
                (i, p.generate(s).await)
            })
        })
        .collect();

    for t in futures::future::join_all(tasks).await {
        let (i, result) = t.unwrap();
        match (i % 5 == 0, i % 2 == 0, result) {
            (true, _, Err(CertError::Validation { .. })) => {}
            (false, true, Ok(_)) => {}
            (false, false, Err(CertError::Render(_))) => {}
            (_, _, other) => panic!("run {i}: unexpected {other:?}"),
        }
    }
    assert!(h.leftovers().is_empty(), "leaked: {:?}", h.leftovers());
    assert_eq!(p.available_render_slots(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_when_slots_are_exhausted() {
    let h = Harness::new();
    let p = Arc::new(CertificatePipeline::new(
        h.config(&format!("sleep 2\n{ECHO_RECORD}"))
            .max_concurrent_renders(1)
            .queue_timeout_secs(0)
            .build()
            .unwrap(),
    )
    .unwrap());

    let first = {
        let p = Arc::clone(&p);
        tokio::spawn(async move { p.generate(submission("first")).await })
    };
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while p.available_render_slots() > 0 {
        assert!(std::time::Instant::now() < deadline, "first run never took a slot");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = p.generate(submission("second")).await.unwrap_err();
    assert!(matches!(err, CertError::Busy { .. }), "got {err:?}");

    assert!(first.await.unwrap().is_ok());
    assert!(h.leftovers().is_empty());
}
