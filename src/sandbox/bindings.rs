//! Global bindings exposed to executing code
//!
//! Always present: `print`, `console`, `process.stdout` / `process.stderr`.
//! Present only when granted: `fs` (read and/or write under a root) and `env`.

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Exception, Function, Object, Result as JsResult, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::context::{InterruptState, SandboxContext};
use crate::capture::{CaptureError, OutputTarget};
use crate::model::Capability;

/// Writes from bindings into the execution's sink
#[derive(Clone)]
struct Writer {
    sink: Arc<dyn OutputTarget>,
    interrupt: Arc<InterruptState>,
}

impl Writer {
    fn write(&self, ctx: &Ctx<'_>, text: &str) -> JsResult<()> {
        if self.interrupt.output_limit_hit() {
            return Err(Exception::throw_range(ctx, "output limit exceeded"));
        }
        match self.sink.append(text) {
            Ok(()) => Ok(()),
            Err(CaptureError::OutputLimit { limit }) => {
                self.interrupt.mark_output_limit();
                Err(Exception::throw_range(
                    ctx,
                    &format!("output limit of {} bytes exceeded", limit),
                ))
            }
            Err(e) => Err(Exception::throw_internal(ctx, &e.to_string())),
        }
    }
}

/// Install every binding the context allows into the global object
pub fn install<'js>(ctx: &Ctx<'js>, context: &SandboxContext) -> JsResult<()> {
    let globals = ctx.globals();
    let writer = Writer {
        sink: context.sink.clone(),
        interrupt: context.interrupt.clone(),
    };

    globals.set("print", raw_writer(ctx, writer.clone())?)?;

    let console = Object::new(ctx.clone())?;
    for name in ["log", "info", "debug", "error", "warn"] {
        console.set(name, line_writer(ctx, writer.clone())?)?;
    }
    globals.set("console", console)?;

    let process = Object::new(ctx.clone())?;
    for name in ["stdout", "stderr"] {
        let stream = Object::new(ctx.clone())?;
        let w = writer.clone();
        stream.set(
            "write",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, chunk: Value<'js>| -> JsResult<bool> {
                    let text = format_value(&ctx, chunk)?;
                    w.write(&ctx, &text)?;
                    Ok(true)
                },
            )?,
        )?;
        process.set(name, stream)?;
    }
    globals.set("process", process)?;

    let fs = Object::new(ctx.clone())?;
    let mut fs_granted = false;
    for capability in &context.capabilities {
        match capability {
            Capability::FsRead { root } => {
                install_fs_read(ctx, &fs, root.clone())?;
                fs_granted = true;
                debug!(root = %root.display(), "granted fs read");
            }
            Capability::FsWrite { root } => {
                install_fs_write(ctx, &fs, root.clone())?;
                fs_granted = true;
                debug!(root = %root.display(), "granted fs write");
            }
            Capability::Env { vars } => {
                globals.set("env", env_object(ctx, vars.clone())?)?;
                debug!(?vars, "granted env");
            }
        }
    }
    if fs_granted {
        globals.set("fs", fs)?;
    }

    Ok(())
}

/// `print(...)`: arguments joined by a space, no newline
fn raw_writer<'js>(ctx: &Ctx<'js>, writer: Writer) -> JsResult<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> JsResult<()> {
            let text = format_values(&ctx, args)?;
            writer.write(&ctx, &text)
        },
    )
}

/// `console.*(...)`: arguments joined by a space, newline terminated
fn line_writer<'js>(ctx: &Ctx<'js>, writer: Writer) -> JsResult<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> JsResult<()> {
            let mut text = format_values(&ctx, args)?;
            text.push('\n');
            writer.write(&ctx, &text)
        },
    )
}

fn format_values<'js>(ctx: &Ctx<'js>, args: Rest<Value<'js>>) -> JsResult<String> {
    let mut parts = Vec::with_capacity(args.0.len());
    for value in args.0 {
        parts.push(format_value(ctx, value)?);
    }
    Ok(parts.join(" "))
}

/// Strings verbatim, plain objects and arrays as JSON, the rest coerced
fn format_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> JsResult<String> {
    if let Some(s) = value.as_string() {
        return s.to_string();
    }

    if value.is_object() && !value.is_function() {
        let coerced = value.get::<Coerced<String>>()?.0;
        if coerced != "[object Object]" && !value.is_array() {
            // Errors, dates and objects with their own toString
            return Ok(coerced);
        }
        match ctx.json_stringify(value) {
            Ok(Some(json)) => return json.to_string(),
            Ok(None) => return Ok(coerced),
            Err(_) => {
                // Circular structures; drop the pending exception
                let _ = ctx.catch();
                return Ok(coerced);
            }
        }
    }

    Ok(value.get::<Coerced<String>>()?.0)
}

/// Resolve a snippet-supplied path under `root`.
///
/// Only plain relative components are accepted, and the resolved path (or
/// its parent, for files that do not exist yet) must stay inside the root
/// after following symlinks.
pub(crate) fn confine(root: &Path, requested: &str) -> Option<PathBuf> {
    if requested.is_empty() {
        return None;
    }
    let relative = Path::new(requested);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    let root = root.canonicalize().ok()?;
    let joined = root.join(relative);
    let anchor = if joined.exists() {
        joined.canonicalize().ok()?
    } else {
        joined.parent()?.canonicalize().ok()?
    };
    anchor.starts_with(&root).then_some(joined)
}

fn denied(ctx: &Ctx<'_>, path: &str) -> rquickjs::Error {
    Exception::throw_message(
        ctx,
        &format!("EACCES: path is outside the sandbox root: {}", path),
    )
}

fn install_fs_read<'js>(ctx: &Ctx<'js>, fs: &Object<'js>, root: PathBuf) -> JsResult<()> {
    let read_root = root.clone();
    fs.set(
        "readFile",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, path: String| -> JsResult<String> {
                let target = confine(&read_root, &path).ok_or_else(|| denied(&ctx, &path))?;
                std::fs::read_to_string(&target).map_err(|e| {
                    Exception::throw_message(&ctx, &format!("{}: {}", path, e))
                })
            },
        )?,
    )?;

    fs.set(
        "exists",
        Function::new(ctx.clone(), move |path: String| -> bool {
            confine(&root, &path).map(|p| p.exists()).unwrap_or(false)
        })?,
    )?;

    Ok(())
}

fn install_fs_write<'js>(ctx: &Ctx<'js>, fs: &Object<'js>, root: PathBuf) -> JsResult<()> {
    fs.set(
        "writeFile",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, path: String, data: Coerced<String>| -> JsResult<()> {
                let target = confine(&root, &path).ok_or_else(|| denied(&ctx, &path))?;
                std::fs::write(&target, data.0.as_bytes()).map_err(|e| {
                    Exception::throw_message(&ctx, &format!("{}: {}", path, e))
                })
            },
        )?,
    )?;

    Ok(())
}

fn env_object<'js>(ctx: &Ctx<'js>, vars: Vec<String>) -> JsResult<Object<'js>> {
    let env = Object::new(ctx.clone())?;
    env.set(
        "get",
        Function::new(ctx.clone(), move |name: String| -> Option<String> {
            if vars.iter().any(|v| *v == name) {
                std::env::var(&name).ok()
            } else {
                None
            }
        })?,
    )?;
    Ok(env)
}
