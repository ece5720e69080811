//! # Engine Configuration
//!
//! Limits for the bytecode interpreters and decode scheduling.
//!
//! ## Environment Variables
//!
//! - `DWARFSCOPE_EXPR_BUDGET`: operations a location expression may execute (default: 10000)
//! - `DWARFSCOPE_CFI_BUDGET`: call-frame instructions replayed per FDE (default: 10000)
//! - `DWARFSCOPE_STACK_LIMIT`: maximum expression stack depth (default: 1024)
//! - `DWARFSCOPE_PARALLEL`: decode units on the rayon pool (`1`/`true` or `0`/`false`, default: true)

use std::env;
use std::str::FromStr;

/// Tunables shared by every decoder and interpreter in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig
{
    /// Maximum number of location-expression operations per evaluation
    pub expression_budget: usize,
    /// Maximum number of call-frame instructions replayed per CIE/FDE pair
    pub cfi_budget: usize,
    /// Maximum depth of the expression stack
    pub max_stack_depth: usize,
    /// Decode compilation units in parallel
    pub parallel: bool,
}

impl Default for EngineConfig
{
    fn default() -> Self
    {
        Self {
            expression_budget: 10_000,
            cfi_budget: 10_000,
            max_stack_depth: 1024,
            parallel: true,
        }
    }
}

impl EngineConfig
{
    /// Defaults, overridden by any `DWARFSCOPE_*` variables that parse.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self
    {
        let mut config = Self::default();
        if let Some(value) = read_env("DWARFSCOPE_EXPR_BUDGET") {
            config.expression_budget = value;
        }
        if let Some(value) = read_env("DWARFSCOPE_CFI_BUDGET") {
            config.cfi_budget = value;
        }
        if let Some(value) = read_env("DWARFSCOPE_STACK_LIMIT") {
            config.max_stack_depth = value;
        }
        if let Ok(raw) = env::var("DWARFSCOPE_PARALLEL") {
            match parse_bool(&raw) {
                Some(value) => config.parallel = value,
                None => tracing::warn!(value = %raw, "ignoring invalid DWARFSCOPE_PARALLEL"),
            }
        }
        config
    }

    #[must_use]
    pub fn with_expression_budget(mut self, budget: usize) -> Self
    {
        self.expression_budget = budget;
        self
    }

    #[must_use]
    pub fn with_cfi_budget(mut self, budget: usize) -> Self
    {
        self.cfi_budget = budget;
        self
    }

    #[must_use]
    pub fn with_max_stack_depth(mut self, depth: usize) -> Self
    {
        self.max_stack_depth = depth;
        self
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self
    {
        self.parallel = parallel;
        self
    }
}

fn read_env<T: FromStr>(name: &str) -> Option<T>
{
    let raw = env::var(name).ok()?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(variable = name, value = %raw, "ignoring unparseable setting");
    }
    parsed
}

fn parse_bool(raw: &str) -> Option<bool>
{
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
