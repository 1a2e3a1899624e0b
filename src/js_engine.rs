use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Runtime, Value as JsValue};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::capabilities::{CapabilityError, ExecutionNamespace};
use crate::config::ExecutionConfig;
use crate::error::{ExecutionError, ExecutionErrorKind};

/// Resource bounds for one script run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl ExecutionLimits {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            timeout: config.timeout(),
            memory_limit_bytes: config.memory_limit_mb.saturating_mul(1024 * 1024),
            max_stack_bytes: 1024 * 1024,
        }
    }
}

// Builds the script-facing globals from the native dispatcher. Every
// capability becomes a frozen object whose methods forward their arguments
// as JSON. `page.setPageConfig` is accepted and ignored.
const PRELUDE: &str = r#"
(function (api, report) {
    "use strict";
    const host = globalThis.__host;
    delete globalThis.__host;
    const call = function (capability, operation, args) {
        const payload = JSON.stringify(Array.prototype.slice.call(args));
        return JSON.parse(host(capability, operation, payload));
    };
    Object.keys(api).forEach(function (capability) {
        const target = {};
        api[capability].forEach(function (operation) {
            target[operation] = function () {
                return call(capability, operation, arguments);
            };
        });
        if (capability === "page") {
            target.setPageConfig = function () {};
            target.set_page_config = target.setPageConfig;
        }
        globalThis[capability] = Object.freeze(target);
    });
    globalThis.REPORT = Object.freeze(report);
})"#;

/// Run `script` to completion against `namespace` in a fresh runtime.
///
/// Faults raised by the script are classified and returned; they never
/// propagate as panics. The runtime is dropped before returning.
pub fn execute(
    script: &str,
    namespace: &ExecutionNamespace,
    limits: &ExecutionLimits,
) -> Result<(), ExecutionError> {
    let started = Instant::now();
    let rt = Runtime::new()
        .map_err(|e| ExecutionError::engine(format!("failed to create runtime: {}", e)))?;
    rt.set_memory_limit(limits.memory_limit_bytes);
    rt.set_max_stack_size(limits.max_stack_bytes);

    let deadline = started + limits.timeout;
    let timed_out = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&timed_out);
    rt.set_interrupt_handler(Some(Box::new(move || {
        if Instant::now() >= deadline {
            flag.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    })));

    // Promises rejected with no handler attached; popped again when a handler shows up late.
    let unhandled: Arc<Mutex<Vec<ExecutionError>>> = Arc::default();
    let tracked = Arc::clone(&unhandled);
    rt.set_host_promise_rejection_tracker(Some(Box::new(
        move |ctx: Ctx<'_>, _promise: JsValue<'_>, reason: JsValue<'_>, is_handled: bool| {
            let Ok(mut pending) = tracked.lock() else {
                return;
            };
            if is_handled {
                pending.pop();
            } else {
                pending.push(describe(&ctx, caught_value(reason)));
            }
        },
    )));

    let context = Context::full(&rt)
        .map_err(|e| ExecutionError::engine(format!("failed to create context: {}", e)))?;

    let namespace = Arc::new(namespace.clone());
    let result = context
        .with(|ctx| -> Result<(), ExecutionError> {
            install_namespace(&ctx, Arc::clone(&namespace)).map_err(|e| {
                ExecutionError::engine(format!("failed to install host capabilities: {}", e))
            })?;

            match ctx.eval::<(), _>(script).catch(&ctx) {
                Ok(()) => Ok(()),
                Err(caught) => Err(classify(
                    &ctx,
                    caught,
                    timed_out.load(Ordering::SeqCst),
                    limits,
                )),
            }
        })
        .and_then(|()| drain_jobs(&rt, deadline, &timed_out, limits))
        .and_then(|()| match unhandled.lock() {
            Ok(mut pending) if !pending.is_empty() => Err(pending.remove(0)),
            _ => Ok(()),
        });

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(()) => debug!(elapsed_ms, "script finished"),
        Err(e) => warn!(elapsed_ms, kind = ?e.kind, error = %e, "script failed"),
    }
    result
}

/// Run queued promise jobs until the queue is empty or the deadline passes.
fn drain_jobs(
    rt: &Runtime,
    deadline: Instant,
    timed_out: &AtomicBool,
    limits: &ExecutionLimits,
) -> Result<(), ExecutionError> {
    loop {
        if Instant::now() >= deadline {
            timed_out.store(true, Ordering::SeqCst);
            return Err(ExecutionError::timeout(limits.timeout.as_millis() as u64));
        }
        match rt.execute_pending_job() {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(job) => {
                return Err(job.0.with(|ctx| {
                    let caught = CaughtError::from_error(&ctx, rquickjs::Error::Exception);
                    classify(&ctx, caught, timed_out.load(Ordering::SeqCst), limits)
                }));
            }
        }
    }
}

fn install_namespace<'js>(
    ctx: &Ctx<'js>,
    namespace: Arc<ExecutionNamespace>,
) -> rquickjs::Result<()> {
    let dispatch_ns = Arc::clone(&namespace);
    let host = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'_>,
              capability: String,
              operation: String,
              payload: String|
              -> rquickjs::Result<String> {
            let args: Vec<Value> = serde_json::from_str(&payload).map_err(|e| {
                Exception::throw_type(&ctx, &format!("arguments are not serializable: {}", e))
            })?;
            let target = dispatch_ns.get(&capability).ok_or_else(|| {
                Exception::throw_reference(&ctx, &format!("{} is not available", capability))
            })?;
            match target.call(&operation, &args) {
                Ok(value) => Ok(value.to_string()),
                Err(e @ CapabilityError::Portal(_)) => {
                    Err(Exception::throw_message(&ctx, &e.to_string()))
                }
                Err(e) => Err(Exception::throw_type(
                    &ctx,
                    &format!("{}.{}: {}", capability, operation, e),
                )),
            }
        },
    )?;
    ctx.globals().set("__host", host)?;

    let api: serde_json::Map<String, Value> = namespace
        .capabilities()
        .iter()
        .map(|c| {
            (
                c.name().to_string(),
                Value::from(c.operations().to_vec()),
            )
        })
        .collect();
    let source = format!(
        "{}({}, {});",
        PRELUDE,
        Value::Object(api),
        namespace.report
    );
    ctx.eval::<(), _>(source)
}

fn classify<'js>(
    ctx: &Ctx<'js>,
    caught: CaughtError<'js>,
    timed_out: bool,
    limits: &ExecutionLimits,
) -> ExecutionError {
    if timed_out {
        return ExecutionError::timeout(limits.timeout.as_millis() as u64);
    }
    describe(ctx, caught)
}

fn caught_value(value: JsValue<'_>) -> CaughtError<'_> {
    match value
        .as_object()
        .and_then(|obj| Exception::from_object(obj.clone()))
    {
        Some(exception) => CaughtError::Exception(exception),
        None => CaughtError::Value(value),
    }
}

fn describe<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>) -> ExecutionError {
    match caught {
        CaughtError::Exception(exception) => {
            let message = exception.message().unwrap_or_default();
            let name = exception
                .as_object()
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .unwrap_or_else(|| "Error".to_string());
            let kind = if is_out_of_memory(&message) {
                ExecutionErrorKind::OutOfMemory
            } else {
                ExecutionErrorKind::Script
            };
            ExecutionError::new(kind, name, message).with_trace(exception.stack())
        }
        CaughtError::Value(value) => {
            let message = if let Some(s) = value.as_string() {
                s.to_string().unwrap_or_default()
            } else {
                ctx.json_stringify(value)
                    .ok()
                    .flatten()
                    .and_then(|s| s.to_string().ok())
                    .unwrap_or_else(|| "script threw a non-error value".to_string())
            };
            ExecutionError::new(ExecutionErrorKind::Script, "Error", message)
        }
        CaughtError::Error(rquickjs::Error::Allocation) => ExecutionError::new(
            ExecutionErrorKind::OutOfMemory,
            "InternalError",
            "out of memory",
        ),
        CaughtError::Error(e) if is_out_of_memory(&e.to_string()) => {
            ExecutionError::new(ExecutionErrorKind::OutOfMemory, "InternalError", e.to_string())
        }
        CaughtError::Error(e) => ExecutionError::new(ExecutionErrorKind::Script, "Error", e.to_string()),
    }
}

fn is_out_of_memory(message: &str) -> bool {
    message.contains("out of memory")
}
