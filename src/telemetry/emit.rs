use anyhow::Result;
use serde::Serialize;

use crate::output::config::{OutputConfig, OutputFormat};
use crate::output::presenter::Emitter;
use crate::output::types::{Envelope, Meta};

fn emitter() -> Emitter {
    let mut cfg = OutputConfig::from_env();
    // --json always means machine-readable output
    if super::config::json_mode() { cfg.format = OutputFormat::Json; }
    Emitter::from_env(cfg)
}

pub fn print_plan<T: Serialize>(op: &'static str, plan: &T, meta: Option<Meta>) -> Result<()> {
    let env = Envelope::plan(op, plan, meta)?;
    emitter().emit(&env)?;
    Ok(())
}

pub fn print_result<T: Serialize>(op: &'static str, result: &T, meta: Option<Meta>) -> Result<()> {
    let env = Envelope::result(op, result, meta)?;
    emitter().emit(&env)?;
    Ok(())
}
