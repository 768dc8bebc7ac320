//! # nativetrace - Diagnostic Entry Point
//!
//! Exercises the engine inside its own process:
//! - **trace** (default): unwinds a fixed two-level call chain and prints
//!   every frame the configured symbolizer can describe
//! - **modules**: lists loaded modules, their unwind tables and debug info
//! - **stats**: traces once and prints the process-wide counters

use std::hint::black_box;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use nativetrace::cli::{Args, Command};
use nativetrace::symbolization::loaded_modules;
use nativetrace::unwind::{self, tables, UnwindRequest};
use nativetrace::{context, stats, CallContext, Config, Tracer};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.is::<nativetrace::TraceError>()) {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let base = Config::from_env().context("invalid NATIVETRACE_* environment")?;
    let tracer = nativetrace::init(args.config(base));

    match args.command.clone().unwrap_or_default() {
        Command::Trace { depth, via_context } => trace(tracer, depth, via_context),
        Command::Modules => modules(tracer),
        Command::Stats => {
            trace(tracer, 64, false)?;
            println!();
            println!("{}", stats::snapshot());
            Ok(())
        }
    }
}

fn trace(tracer: &Tracer, depth: usize, via_context: bool) -> Result<()> {
    if depth == 0 {
        anyhow::bail!("--depth must be at least 1");
    }
    let mut buf = vec![0usize; depth];
    let count = black_box(fixture_outer(&mut buf, via_context));
    info!("recorded {count} frames with the {} backend", tracer.backend());

    if count == 0 {
        println!("no frames recorded (tracing disabled?)");
        return Ok(());
    }

    for (i, &pc) in buf[..count].iter().enumerate() {
        println!("{}", tracer.resolve(pc as u64).format(i));
    }
    Ok(())
}

#[inline(never)]
fn fixture_outer(buf: &mut [usize], via_context: bool) -> usize {
    black_box(fixture_inner(buf, via_context))
}

#[inline(never)]
fn fixture_inner(buf: &mut [usize], via_context: bool) -> usize {
    let count = if via_context {
        let token = context::enter(CallContext::NULL);
        let mut req = UnwindRequest::new(buf).with_context(token);
        unwind::unwind(&mut req);
        let count = req.count();
        context::leave(token);
        count
    } else {
        unwind::capture(buf)
    };
    black_box(count)
}

fn modules(tracer: &Tracer) -> Result<()> {
    tracer.refresh_modules();

    let mut table_rows = std::collections::HashMap::new();
    for info in tables::tables() {
        if !info.retired {
            table_rows.insert(info.id, info.rows);
        }
    }
    let failures: std::collections::HashMap<_, _> = tables::failures().into_iter().collect();

    let modules = loaded_modules();
    if modules.is_empty() {
        anyhow::bail!("no loaded modules reported by the dynamic loader");
    }

    println!("{:<18} {:>8}  {}", "BIAS", "ROWS", "MODULE");
    for module in &modules {
        let rows = match (table_rows.get(&module.id), failures.get(&module.id)) {
            (Some(rows), _) => rows.to_string(),
            (None, Some(_)) => "failed".to_string(),
            (None, None) => "-".to_string(),
        };
        println!("0x{:016x} {:>8}  {}", module.id.bias, rows, module.path().display());
        if let Some(reason) = failures.get(&module.id) {
            println!("{:>29}{reason}", "");
        }
    }

    println!("\nbackend: {}", tracer.backend());
    let symbolizer = tracer.resolver().symbolizer();
    for module in &modules {
        if let Some(has_dwarf) = symbolizer.has_line_info(module) {
            let status = if has_dwarf { "dwarf" } else { "symbols" };
            println!("{status:>8}  {}", module.path().display());
        }
    }
    Ok(())
}
