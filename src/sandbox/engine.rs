//! QuickJS-backed sandbox
//!
//! Each call builds a fresh runtime and context, installs the bindings the
//! request allows, evaluates the code, drains promise jobs and classifies any
//! fault. Nothing survives the call.

use rquickjs::convert::Coerced;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Runtime, Value};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::bindings;
use super::context::{InterruptReason, SandboxContext};
use crate::model::ErrorKind;

/// Fault raised by executing code, already classified
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct SandboxFault {
    pub kind: ErrorKind,
    pub message: String,
}

impl SandboxFault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn interrupted(reason: InterruptReason, timeout: Duration) -> Self {
        match reason {
            InterruptReason::Timeout => Self::new(
                ErrorKind::Timeout,
                format!("execution exceeded the {}ms time limit", timeout.as_millis()),
            ),
            InterruptReason::Cancelled => Self::new(ErrorKind::Cancelled, "execution cancelled"),
        }
    }
}

/// Messages QuickJS uses when a runtime limit trips
const EXHAUSTION_MESSAGES: &[&str] = &[
    "out of memory",
    "stack overflow",
    "Maximum call stack size exceeded",
];

/// Rejected promises nobody has handled yet, in rejection order
#[derive(Debug, Default)]
struct Rejections(Mutex<Vec<String>>);

impl Rejections {
    fn record(&self, reason: String, handled: bool) {
        let mut pending = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if handled {
            if let Some(index) = pending.iter().position(|r| *r == reason) {
                pending.remove(index);
            }
        } else {
            pending.push(reason);
        }
    }

    fn first_unhandled(&self) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }
}

/// Stateless JavaScript sandbox
#[derive(Debug, Default, Clone, Copy)]
pub struct Sandbox;

impl Sandbox {
    pub fn new() -> Self {
        Self
    }

    /// Run `code` inside a fresh engine bound to `context`.
    ///
    /// Meant to run once per process: a run interrupted inside a promise job
    /// leaks its engine rather than freeing it.
    pub fn run(&self, code: &str, context: &SandboxContext) -> Result<(), SandboxFault> {
        let runtime = Runtime::new().map_err(|e| engine_fault(context, e))?;
        runtime.set_memory_limit(context.limits.memory_bytes);
        runtime.set_max_stack_size(context.limits.max_stack_bytes);

        let interrupt = context.interrupt.clone();
        let deadline = context.deadline;
        let cancel = context.cancel.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.poll(deadline, &cancel))));

        let rejections = Arc::new(Rejections::default());
        let tracker = rejections.clone();
        runtime.set_host_promise_rejection_tracker(Some(Box::new(
            move |ctx: Ctx<'_>, _promise: Value<'_>, reason: Value<'_>, is_handled: bool| {
                tracker.record(describe_rejection(&ctx, &reason), is_handled);
            },
        )));

        let js = Context::full(&runtime).map_err(|e| engine_fault(context, e))?;

        js.with(|ctx| {
            bindings::install(&ctx, context)
                .catch(&ctx)
                .map_err(|e| classify(context, e))?;

            ctx.eval::<Value, _>(code)
                .catch(&ctx)
                .map(|_| ())
                .map_err(|e| classify(context, e))
        })?;

        // Microtasks queued by the snippet still belong to this execution
        if let Err(fault) = drain_jobs(&runtime, &js, context) {
            if context.interrupt.reason().is_some() {
                // QuickJS cannot free a runtime whose job was cut short
                std::mem::forget(js);
                std::mem::forget(runtime);
            }
            return Err(fault);
        }

        // A snippet may swallow the limit error and finish normally
        if context.interrupt.output_limit_hit() {
            return Err(output_limit_fault(context));
        }
        if let Some(reason) = context.interrupt.reason() {
            return Err(SandboxFault::interrupted(reason, context.timeout));
        }
        if let Some(reason) = rejections.first_unhandled() {
            debug!(%reason, "unhandled promise rejection");
            return Err(rejection_fault(reason));
        }

        Ok(())
    }
}

fn drain_jobs(
    runtime: &Runtime,
    js: &Context,
    context: &SandboxContext,
) -> Result<(), SandboxFault> {
    loop {
        match runtime.execute_pending_job() {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(_) => {
                // The engine state is not trustworthy after an interrupt
                if let Some(reason) = context.interrupt.reason() {
                    return Err(SandboxFault::interrupted(reason, context.timeout));
                }
                return Err(js.with(|ctx| {
                    match Err::<(), _>(rquickjs::Error::Exception).catch(&ctx) {
                        Err(caught) => classify(context, caught),
                        Ok(()) => SandboxFault::new(
                            ErrorKind::RuntimeError,
                            "unhandled error in promise job",
                        ),
                    }
                }));
            }
        }
    }
}

/// `Name: message` for error objects, the coerced value otherwise
fn describe_rejection(ctx: &Ctx<'_>, reason: &Value<'_>) -> String {
    if let Some(object) = reason.as_object() {
        let name = object.get::<_, Option<String>>("name");
        let message = object.get::<_, Option<String>>("message");
        match (name, message) {
            (Ok(Some(name)), Ok(Some(message))) => return format!("{}: {}", name, message),
            (Ok(_), Ok(_)) => {}
            _ => {
                let _ = ctx.catch();
            }
        }
    }

    match reason.get::<Coerced<String>>() {
        Ok(shown) => shown.0,
        Err(_) => {
            let _ = ctx.catch();
            "<unprintable value>".to_string()
        }
    }
}

fn rejection_fault(reason: String) -> SandboxFault {
    let kind = if EXHAUSTION_MESSAGES.iter().any(|m| reason.contains(m)) {
        ErrorKind::ResourceLimitExceeded
    } else {
        ErrorKind::RuntimeError
    };
    SandboxFault::new(kind, format!("Uncaught (in promise) {}", reason))
}

fn output_limit_fault(context: &SandboxContext) -> SandboxFault {
    SandboxFault::new(
        ErrorKind::ResourceLimitExceeded,
        format!(
            "output limit of {} bytes exceeded",
            context.limits.max_output_bytes
        ),
    )
}

fn engine_fault(context: &SandboxContext, error: rquickjs::Error) -> SandboxFault {
    match error {
        rquickjs::Error::Allocation => SandboxFault::new(
            ErrorKind::ResourceLimitExceeded,
            format!(
                "memory limit of {} bytes exceeded",
                context.limits.memory_bytes
            ),
        ),
        other => SandboxFault::new(
            ErrorKind::RuntimeError,
            format!("engine error: {}", other),
        ),
    }
}

/// Map a caught engine error onto the failure taxonomy.
///
/// Interrupts and tripped limits take precedence over whatever the engine
/// reported, since the engine only sees their side effects.
fn classify(context: &SandboxContext, error: CaughtError<'_>) -> SandboxFault {
    if let Some(reason) = context.interrupt.reason() {
        return SandboxFault::interrupted(reason, context.timeout);
    }
    if context.interrupt.output_limit_hit() {
        return output_limit_fault(context);
    }

    match error {
        CaughtError::Error(e) => engine_fault(context, e),
        CaughtError::Exception(exception) => {
            let name: String = exception
                .as_object()
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .unwrap_or_else(|| "Error".to_string());
            let message = exception.message().unwrap_or_default();
            debug!(%name, %message, "snippet raised");

            if EXHAUSTION_MESSAGES.iter().any(|m| message.contains(m)) {
                return SandboxFault::new(ErrorKind::ResourceLimitExceeded, message);
            }

            let kind = if name == "SyntaxError" {
                ErrorKind::SyntaxError
            } else {
                ErrorKind::RuntimeError
            };
            let mut text = format!("{}: {}", name, message);
            if let Some(stack) = exception.stack().filter(|s| !s.trim().is_empty()) {
                text.push('\n');
                text.push_str(stack.trim_end());
            }
            SandboxFault::new(kind, text)
        }
        CaughtError::Value(value) => {
            let shown = value
                .get::<Coerced<String>>()
                .map(|c| c.0)
                .unwrap_or_else(|_| "<unprintable value>".to_string());
            SandboxFault::new(ErrorKind::RuntimeError, format!("Uncaught {}", shown))
        }
    }
}
