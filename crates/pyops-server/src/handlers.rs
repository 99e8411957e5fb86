use crate::body::{Payload, Upload, WordList};
use crate::respond::Reply;
use crate::App;
use pyops_env::{remove_environment, validate_env_name, Environment};
use pyops_exec::{run, stream, stream_with_input, ExecError, Invocation, RunOutput};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use tempfile::{NamedTempFile, TempPath};
use tracing::{info, warn};

/// A request rejected before any process was touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub message: String,
}

impl Rejection {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
        }
    }

    pub fn into_json(self) -> Reply {
        Reply::Json(self.status, json!({ "ok": false, "message": self.message }))
    }

    pub fn into_text(self) -> Reply {
        Reply::Text(self.status, format!("error: {}\n", self.message))
    }
}

type Handled = Result<Reply, Rejection>;

#[derive(Debug, Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct InstallRequest {
    env: String,
    #[serde(default)]
    pkgs: WordList,
}

#[derive(Debug, Deserialize)]
struct RequirementsRequest {
    env: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    env: String,
    path: String,
    #[serde(default)]
    args: WordList,
}

#[derive(Debug, Deserialize)]
struct SnippetRequest {
    env: String,
    code: String,
    #[serde(default)]
    args: WordList,
}

fn typed<T: DeserializeOwned>(payload: Payload) -> Result<(T, Option<Upload>), Rejection> {
    payload
        .into_typed()
        .map_err(|e| Rejection::bad_request(e.to_string()))
}

fn checked_name(name: &str) -> Result<&str, Rejection> {
    validate_env_name(name).map_err(|e| Rejection::bad_request(e.to_string()))?;
    Ok(name)
}

fn roots_json(app: &App) -> Vec<String> {
    app.registry
        .roots()
        .iter()
        .map(|r| r.display().to_string())
        .collect()
}

/// Environment for a streaming entry point: must exist and carry an interpreter.
fn existing_env(app: &App, name: &str) -> Result<Environment, Rejection> {
    let env = app
        .registry
        .resolve(name)
        .ok_or_else(|| Rejection::not_found(format!("environment '{name}' not found")))?;
    if !env.python().is_file() {
        return Err(Rejection::not_found(format!(
            "environment '{name}' has no interpreter at {}",
            env.python().display()
        )));
    }
    Ok(env)
}

fn pip(env: &Environment) -> Invocation {
    Invocation::new(env.python()).args(["-m", "pip", "install"])
}

/// Shape a buffered result. A child that could not be started is a non-ok
/// value, not a fault.
fn buffered_json(result: Result<RunOutput, ExecError>) -> Handled {
    match result {
        Ok(out) => Ok(Reply::ok(json!({
            "ok": out.success(),
            "code": out.exit_code,
            "stdout": out.output,
            "stderr": "",
        }))),
        Err(ExecError::Spawn { program, source }) => Ok(Reply::ok(json!({
            "ok": false,
            "code": Value::Null,
            "stdout": "",
            "stderr": format!("failed to start {program}: {source}"),
        }))),
        Err(ExecError::TimedOut { command, after, output }) => Ok(Reply::ok(json!({
            "ok": false,
            "code": Value::Null,
            "stdout": output,
            "stderr": format!("{command} timed out after {}s", after.as_secs()),
        }))),
        Err(e) => Err(Rejection::internal(e.to_string())),
    }
}

/// Requirements input: an upload (materialized to a temp file) wins over `path`.
fn requirements_file(
    upload: Option<Upload>,
    path: Option<String>,
) -> Result<(PathBuf, Option<TempPath>), Rejection> {
    if let Some(upload) = upload {
        let temp = materialize(&upload.data, "pyops-reqs-", ".txt")
            .map_err(|e| Rejection::internal(format!("cannot store upload: {e}")))?;
        info!(
            "materialized upload '{}' ({} bytes) to {}",
            upload.filename,
            upload.data.len(),
            temp.display()
        );
        return Ok((temp.to_path_buf(), Some(temp)));
    }
    match path.filter(|p| !p.trim().is_empty()) {
        Some(p) => {
            let p = PathBuf::from(p.trim());
            if !p.is_file() {
                return Err(Rejection::bad_request(format!(
                    "requirements file {} does not exist",
                    p.display()
                )));
            }
            Ok((p, None))
        }
        None => Err(Rejection::bad_request(
            "either an uploaded 'file' or a 'path' is required",
        )),
    }
}

fn materialize(data: &[u8], prefix: &str, suffix: &str) -> std::io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile()?;
    file.write_all(data)?;
    file.flush()?;
    Ok(NamedTempFile::into_temp_path(file))
}

pub fn health(app: &App) -> Handled {
    Ok(Reply::ok(json!({ "ok": true, "roots": roots_json(app) })))
}

pub fn list_envs(app: &App) -> Handled {
    Ok(Reply::ok(json!({
        "envs": app.registry.list(),
        "roots": roots_json(app),
    })))
}

pub fn create_venv(app: &App, payload: Payload) -> Handled {
    let (req, _): (NameRequest, _) = typed(payload)?;
    let name = checked_name(&req.name)?;

    if let Some(env) = app.registry.resolve(name) {
        info!("environment '{name}' already exists at {}", env.path.display());
        return Ok(Reply::ok(json!({
            "ok": true,
            "exists": true,
            "message": "exists",
            "env": name,
            "path": env.path.display().to_string(),
            "stdout": "",
            "stderr": "",
        })));
    }

    let path = app.registry.default_path_for(name);
    if let Err(e) = std::fs::create_dir_all(app.registry.default_root()) {
        warn!("cannot create default root: {e}");
    }
    info!("creating environment '{name}' at {}", path.display());
    let result = run(&Invocation::new(&app.base_python)
        .args(["-m", "venv"])
        .arg(&path));

    let (ok, code, stdout, stderr) = match result {
        Ok(out) => (out.success(), json!(out.exit_code), out.output, String::new()),
        Err(e) => (false, Value::Null, String::new(), e.to_string()),
    };
    Ok(Reply::ok(json!({
        "ok": ok,
        "exists": false,
        "env": name,
        "path": path.display().to_string(),
        "code": code,
        "stdout": stdout,
        "stderr": stderr,
    })))
}

pub fn delete_venv(app: &App, payload: Payload) -> Handled {
    let (req, _): (NameRequest, _) = typed(payload)?;
    let name = checked_name(&req.name)?;

    match remove_environment(&app.registry, &app.guard, name) {
        Ok(path) => Ok(Reply::ok(json!({
            "ok": true,
            "message": format!("deleted {}", path.display()),
        }))),
        Err(denial) => {
            info!("delete of '{name}' denied: {denial}");
            Ok(Reply::ok(json!({ "ok": false, "message": denial.to_string() })))
        }
    }
}

pub fn pip_install(app: &App, payload: Payload) -> Handled {
    let (req, _): (InstallRequest, _) = typed(payload)?;
    let name = checked_name(&req.env)?;
    let pkgs = req.pkgs.into_vec();
    if pkgs.is_empty() {
        return Err(Rejection::bad_request("no packages given"));
    }
    let env = app.registry.locate(name);
    buffered_json(run(&pip(&env).args(&pkgs)))
}

pub fn pip_install_reqs(app: &App, payload: Payload) -> Handled {
    let (req, upload): (RequirementsRequest, _) = typed(payload)?;
    let name = checked_name(&req.env)?;
    let (path, _temp) = requirements_file(upload, req.path)?;
    let env = app.registry.locate(name);
    buffered_json(run(&pip(&env).arg("-r").arg(&path)))
}

pub fn pip_install_stream(app: &App, payload: Payload) -> Handled {
    let (req, _): (InstallRequest, _) = typed(payload)?;
    let name = checked_name(&req.env)?;
    let pkgs = req.pkgs.into_vec();
    if pkgs.is_empty() {
        return Err(Rejection::bad_request("no packages given"));
    }
    let env = existing_env(app, name)?;
    let lines = stream(&pip(&env).args(&pkgs)).map_err(start_failure)?;
    Ok(Reply::Stream(lines))
}

pub fn pip_install_reqs_stream(app: &App, payload: Payload) -> Handled {
    let (req, upload): (RequirementsRequest, _) = typed(payload)?;
    let name = checked_name(&req.env)?;
    let env = existing_env(app, name)?;
    let (path, temp) = requirements_file(upload, req.path)?;
    let lines =
        stream_with_input(&pip(&env).arg("-r").arg(&path), temp).map_err(start_failure)?;
    Ok(Reply::Stream(lines))
}

fn start_failure(e: ExecError) -> Rejection {
    match e {
        ExecError::Spawn { .. } => Rejection::bad_request(e.to_string()),
        other => Rejection::internal(other.to_string()),
    }
}

/// Absolute location of a script; relative paths are taken from the
/// service's working directory.
fn script_path(raw: &str) -> Result<PathBuf, Rejection> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Rejection::bad_request("script path is required"));
    }
    std::fs::canonicalize(raw)
        .map_err(|e| Rejection::bad_request(format!("cannot open script {raw}: {e}")))
}

pub fn run_script(app: &App, payload: Payload) -> Handled {
    let (req, _): (RunRequest, _) = typed(payload)?;
    let name = checked_name(&req.env)?;
    let script = script_path(&req.path)?;
    let env = app.registry.locate(name);

    let mut invocation = Invocation::new(env.python())
        .arg(&script)
        .args(req.args.into_vec());
    if let Some(dir) = script.parent() {
        invocation = invocation.current_dir(dir);
    }
    buffered_json(run(&invocation))
}

pub fn run_snippet(app: &App, payload: Payload) -> Handled {
    let (req, _): (SnippetRequest, _) = typed(payload)?;
    let name = checked_name(&req.env)?;
    let env = app.registry.locate(name);

    let snippet = materialize(req.code.as_bytes(), "pyops-snippet-", ".py")
        .map_err(|e| Rejection::internal(format!("cannot store snippet: {e}")))?;
    let invocation = Invocation::new(env.python())
        .arg(&*snippet)
        .args(req.args.into_vec())
        .timeout(app.snippet_timeout);

    let text = match run(&invocation) {
        Ok(out) => out.output,
        Err(ExecError::TimedOut { output, after, .. }) => {
            let mut text = output;
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("[timeout after {}s]\n", after.as_secs()));
            text
        }
        Err(e) => format!("error: {e}\n"),
    };
    if let Err(e) = snippet.close() {
        warn!("failed to remove snippet file: {e}");
    }
    Ok(Reply::Text(200, text))
}
