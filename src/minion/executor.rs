//! Functions a minion can execute on behalf of a published job.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::master::target::Grains;
use crate::minion::session::MasterLink;
use crate::protocol::PeerKind;

/// How long a peer call waits for the master's answer.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of running one function.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub ret: Value,
}

impl ExecutionResult {
    pub fn ok(ret: Value) -> Self {
        Self { success: true, ret }
    }

    pub fn failed(message: impl fmt::Display) -> Self {
        Self {
            success: false,
            ret: Value::String(message.to_string()),
        }
    }
}

/// What a function gets to see about the job and the minion running it.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub jid: String,
    pub minion_id: String,
    pub grains: Grains,
    /// Present when the job came in over a live session.
    pub link: Option<MasterLink>,
}

#[async_trait]
pub trait MinionFunction: Send + Sync {
    async fn call(&self, ctx: &CallContext, args: &[Value]) -> ExecutionResult;
}

/// Function table keyed by `module.function`.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn MinionFunction>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `test.*`, `grains.*`, `cmd.run` and the peer functions
    /// `publish.publish` / `publish.runner`.
    pub fn with_builtins() -> Self {
        Self::new()
            .with_function("test.ping", Arc::new(TestPing))
            .with_function("test.echo", Arc::new(TestEcho))
            .with_function("test.arg", Arc::new(TestArg))
            .with_function("test.sleep", Arc::new(TestSleep))
            .with_function("grains.items", Arc::new(GrainsItems))
            .with_function("grains.get", Arc::new(GrainsGet))
            .with_function("cmd.run", Arc::new(CmdRun))
            .with_function("publish.publish", Arc::new(Peer(PeerKind::Publish)))
            .with_function("publish.runner", Arc::new(Peer(PeerKind::Run)))
    }

    pub fn with_function(mut self, name: &str, function: Arc<dyn MinionFunction>) -> Self {
        self.functions.insert(name.to_string(), function);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub async fn execute(&self, name: &str, ctx: &CallContext, args: &[Value]) -> ExecutionResult {
        let Some(function) = self.functions.get(name) else {
            tracing::warn!(jid = %ctx.jid, function = name, "Function not available");
            return ExecutionResult::failed(format!("'{}' is not available", name));
        };
        tracing::info!(jid = %ctx.jid, function = name, "Executing function");
        let result = function.call(ctx, args).await;
        tracing::info!(jid = %ctx.jid, function = name, success = result.success, "Function completed");
        result
    }
}

struct TestPing;

#[async_trait]
impl MinionFunction for TestPing {
    async fn call(&self, _ctx: &CallContext, _args: &[Value]) -> ExecutionResult {
        ExecutionResult::ok(Value::Bool(true))
    }
}

struct TestEcho;

#[async_trait]
impl MinionFunction for TestEcho {
    async fn call(&self, _ctx: &CallContext, args: &[Value]) -> ExecutionResult {
        ExecutionResult::ok(args.first().cloned().unwrap_or(Value::Null))
    }
}

struct TestArg;

#[async_trait]
impl MinionFunction for TestArg {
    async fn call(&self, _ctx: &CallContext, args: &[Value]) -> ExecutionResult {
        ExecutionResult::ok(Value::Array(args.to_vec()))
    }
}

/// `test.sleep <seconds>`
struct TestSleep;

#[async_trait]
impl MinionFunction for TestSleep {
    async fn call(&self, _ctx: &CallContext, args: &[Value]) -> ExecutionResult {
        let Some(secs) = args.first().and_then(Value::as_f64) else {
            return ExecutionResult::failed("test.sleep needs a number of seconds");
        };
        if !secs.is_finite() || secs < 0.0 {
            return ExecutionResult::failed("test.sleep needs a non-negative duration");
        }
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        ExecutionResult::ok(Value::Bool(true))
    }
}

struct GrainsItems;

#[async_trait]
impl MinionFunction for GrainsItems {
    async fn call(&self, ctx: &CallContext, _args: &[Value]) -> ExecutionResult {
        ExecutionResult::ok(json!(ctx.grains))
    }
}

/// `grains.get <key[:nested...]>`
struct GrainsGet;

#[async_trait]
impl MinionFunction for GrainsGet {
    async fn call(&self, ctx: &CallContext, args: &[Value]) -> ExecutionResult {
        let Some(path) = args.first().and_then(Value::as_str) else {
            return ExecutionResult::failed("grains.get needs a key");
        };
        let mut parts = path.split(':');
        let mut current = parts.next().and_then(|head| ctx.grains.get(head));
        for part in parts {
            current = current.and_then(|v| match v {
                Value::Object(map) => map.get(part),
                Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            });
        }
        ExecutionResult::ok(current.cloned().unwrap_or(Value::String(String::new())))
    }
}

/// `cmd.run <command>` through `sh -c`.
struct CmdRun;

#[async_trait]
impl MinionFunction for CmdRun {
    async fn call(&self, ctx: &CallContext, args: &[Value]) -> ExecutionResult {
        let Some(command) = args.first().and_then(Value::as_str) else {
            return ExecutionResult::failed("cmd.run needs a command");
        };
        tracing::debug!(jid = %ctx.jid, command, "Running shell command");

        let result = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                if output.status.success() {
                    ExecutionResult::ok(Value::String(stdout))
                } else {
                    ExecutionResult {
                        success: false,
                        ret: json!({
                            "retcode": output.status.code(),
                            "stdout": stdout,
                            "stderr": stderr,
                        }),
                    }
                }
            }
            Err(e) => {
                tracing::error!(jid = %ctx.jid, error = %e, "Failed to spawn shell");
                ExecutionResult::failed(e)
            }
        }
    }
}

/// Ask the master to act on this minion's behalf.
///
/// `publish.publish <tgt> <fun> [arg...]` and `publish.runner <fun> [arg...]`.
struct Peer(PeerKind);

#[async_trait]
impl MinionFunction for Peer {
    async fn call(&self, ctx: &CallContext, args: &[Value]) -> ExecutionResult {
        let Some(link) = &ctx.link else {
            return ExecutionResult::failed("no master session to send the request on");
        };
        let strings: Vec<Option<&str>> = args.iter().map(Value::as_str).collect();
        let (tgt, fun, rest) = match (self.0, strings.as_slice()) {
            (PeerKind::Publish, [Some(tgt), Some(fun), ..]) => (*tgt, *fun, &args[2..]),
            (PeerKind::Run, [Some(fun), ..]) => ("", *fun, &args[1..]),
            (PeerKind::Publish, _) => return ExecutionResult::failed("publish.publish needs a target and a function"),
            (PeerKind::Run, _) => return ExecutionResult::failed("publish.runner needs a function"),
        };
        match link
            .peer(self.0, fun, rest.to_vec(), tgt, "glob", PEER_TIMEOUT)
            .await
        {
            Ok(reply) => ExecutionResult {
                success: reply.ok,
                ret: reply.data,
            },
            Err(e) => ExecutionResult::failed(e),
        }
    }
}
