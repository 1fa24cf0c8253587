//! Isolation primitives that turn deployed source into an invocable function.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::types::{Digest, Error, Result};

/// Config key carrying the scoped module path.
pub const MODULE_PATH_KEY: &str = "FABRIC_MODULE_PATH";

/// Node-level configuration pushed by the coordinator via `SetConfig`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeConfig {
    values: Map<String, Value>,
}

impl NodeConfig {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Module resolution is only granted for a meaningful path.
    pub fn module_path(&self) -> Option<&str> {
        self.values
            .get(MODULE_PATH_KEY)
            .and_then(Value::as_str)
            .filter(|p| p.len() > 1)
    }

    /// Capability set a deployed function runs with under this config.
    pub fn capabilities(&self) -> Value {
        json!({
            "timers": true,
            "buffer": true,
            "modules": self.module_path().is_some(),
        })
    }
}

/// A loaded, invocable function.
#[async_trait]
pub trait Function: Send + Sync {
    async fn call(&self, context: Value) -> Result<Value>;
}

/// Loads deployed source into a function.
pub trait Sandbox: Send + Sync + fmt::Debug {
    fn load(&self, digest: &Digest, source: &[u8], config: &NodeConfig) -> Result<Arc<dyn Function>>;
}

// =============================================================================
// NativeSandbox
// =============================================================================

type NativeFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Sandbox whose "source" names one of a fixed table of Rust functions.
///
/// Only registered entry points can ever run, which makes it the restricted
/// interpreter of choice for embedding and tests.
#[derive(Clone, Default)]
pub struct NativeSandbox {
    functions: HashMap<String, NativeFn>,
}

impl fmt::Debug for NativeSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("NativeSandbox").field("functions", &names).finish()
    }
}

impl NativeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous entry point.
    pub fn register<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.functions.insert(
            name.into(),
            Arc::new(move |context| {
                let f = f.clone();
                Box::pin(async move { f(context) })
            }),
        );
        self
    }

    /// Register an asynchronous entry point.
    pub fn register_async<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.functions
            .insert(name.into(), Arc::new(move |context| Box::pin(f(context))));
        self
    }
}

struct NativeFunction {
    f: NativeFn,
}

#[async_trait]
impl Function for NativeFunction {
    async fn call(&self, context: Value) -> Result<Value> {
        (self.f)(context).await
    }
}

impl Sandbox for NativeSandbox {
    fn load(&self, _digest: &Digest, source: &[u8], _config: &NodeConfig) -> Result<Arc<dyn Function>> {
        let name = std::str::from_utf8(source)
            .map_err(|_| Error::validation("native entry point must be UTF-8"))?
            .trim();
        let f = self
            .functions
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no native function named {:?}", name)))?;
        Ok(Arc::new(NativeFunction { f: f.clone() }))
    }
}

// =============================================================================
// ScriptSandbox
// =============================================================================

/// Sandbox running deployed source as a shell script in a child process.
///
/// The script gets a cleared environment (only `PATH` and, when granted, the
/// module path), the context as JSON on stdin, and must print its response as
/// JSON on stdout. A non-zero exit is a worker error carrying the exit code.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    shell: PathBuf,
}

impl ScriptSandbox {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[derive(Debug)]
struct ScriptFunction {
    shell: PathBuf,
    script: String,
    env: Vec<(String, String)>,
}

impl Sandbox for ScriptSandbox {
    fn load(&self, digest: &Digest, source: &[u8], config: &NodeConfig) -> Result<Arc<dyn Function>> {
        let script = String::from_utf8(source.to_vec())
            .map_err(|_| Error::validation(format!("source of {} is not UTF-8", digest)))?;

        let mut env = Vec::new();
        if let Ok(path) = std::env::var("PATH") {
            env.push(("PATH".to_string(), path));
        }
        if let Some(module_path) = config.module_path() {
            env.push((MODULE_PATH_KEY.to_string(), module_path.to_string()));
        }

        Ok(Arc::new(ScriptFunction {
            shell: self.shell.clone(),
            script,
            env,
        }))
    }
}

#[async_trait]
impl Function for ScriptFunction {
    async fn call(&self, context: Value) -> Result<Value> {
        let mut child = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(&self.script)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = serde_json::to_vec(&context)?;
            // A script that never reads stdin closes the pipe early; that's fine.
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!("script did not consume its context: {}", e);
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("script exited with {}", output.status)
            } else {
                stderr
            };
            return Err(Error::worker(message, output.status.code().map(i64::from)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(stdout.trim())?)
    }
}
