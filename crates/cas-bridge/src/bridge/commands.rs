//! Typed command catalog.
//!
//! The wire carries `start` payloads as `{command_type, start_args}` with
//! opaque arguments. This module gives each known command a typed argument
//! struct and each known result a typed value, validated at the boundary:
//! the host serializes through [`Command::into_payload`], a worker parses
//! through [`Command::from_payload`] and rejects anything that does not fit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::protocol::{RequestId, StartPayload};

/// Evaluation context for an expression: symbol assumptions, variable and
/// function definitions, unit system and solution domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Symbol name → assumptions (`"positive"`, `"integer"`, ...).
    #[serde(default)]
    pub symbols: BTreeMap<String, Vec<String>>,
    /// Variable name → defining expression.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub args: Vec<String>,
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateArgs {
    pub expression: String,
    #[serde(default)]
    pub environment: Environment,
}

impl EvaluateArgs {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            environment: Environment::default(),
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConvertArgs {
    pub expression: String,
    #[serde(default)]
    pub environment: Environment,
    pub target_units: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveArgs {
    pub expression: String,
    #[serde(default)]
    pub environment: Environment,
    /// Symbols to solve for. Empty lets the worker pick.
    #[serde(default)]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolSetArgs {
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruthTableFormat {
    /// Markdown table with LaTeX entries.
    #[serde(rename = "md")]
    Markdown,
    /// LaTeX `array`, renderable by MathJax.
    #[serde(rename = "latex-array")]
    LatexArray,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthTableArgs {
    pub expression: String,
    #[serde(default)]
    pub environment: Environment,
    pub truth_table_format: TruthTableFormat,
}

/// Test-only command: the worker sleeps for `hang_time` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestHangArgs {
    pub hang_time: f64,
}

/// Every command type the host knows how to build.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Eval(EvaluateArgs),
    Evalf(EvaluateArgs),
    Expand(EvaluateArgs),
    Factor(EvaluateArgs),
    Apart(EvaluateArgs),
    ConvertUnits(UnitConvertArgs),
    Solve(SolveArgs),
    SolveInfo(EvaluateArgs),
    SymbolSets(SymbolSetArgs),
    ConvertSympy(EvaluateArgs),
    TruthTable(TruthTableArgs),
    TestHang(TestHangArgs),
}

/// Failure to interpret a `start` payload as a [`Command`].
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Unsupported command type: {0}")]
    Unsupported(String),
    #[error("invalid arguments for `{command_type}`: {source}")]
    InvalidArgs {
        command_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Command {
    pub const EVAL: &'static str = "eval";
    pub const EVALF: &'static str = "evalf";
    pub const EXPAND: &'static str = "expand";
    pub const FACTOR: &'static str = "factor";
    pub const APART: &'static str = "apart";
    pub const CONVERT_UNITS: &'static str = "convert-units";
    pub const SOLVE: &'static str = "solve";
    pub const SOLVE_INFO: &'static str = "solve-info";
    pub const SYMBOL_SETS: &'static str = "symbolsets";
    pub const CONVERT_SYMPY: &'static str = "convert-sympy";
    pub const TRUTH_TABLE: &'static str = "truth-table";
    pub const TEST_HANG: &'static str = "test-hang";

    pub fn command_type(&self) -> &'static str {
        match self {
            Self::Eval(_) => Self::EVAL,
            Self::Evalf(_) => Self::EVALF,
            Self::Expand(_) => Self::EXPAND,
            Self::Factor(_) => Self::FACTOR,
            Self::Apart(_) => Self::APART,
            Self::ConvertUnits(_) => Self::CONVERT_UNITS,
            Self::Solve(_) => Self::SOLVE,
            Self::SolveInfo(_) => Self::SOLVE_INFO,
            Self::SymbolSets(_) => Self::SYMBOL_SETS,
            Self::ConvertSympy(_) => Self::CONVERT_SYMPY,
            Self::TruthTable(_) => Self::TRUTH_TABLE,
            Self::TestHang(_) => Self::TEST_HANG,
        }
    }

    pub fn into_payload(self) -> Result<StartPayload, serde_json::Error> {
        let command_type = self.command_type().to_string();
        let start_args = match self {
            Self::Eval(a)
            | Self::Evalf(a)
            | Self::Expand(a)
            | Self::Factor(a)
            | Self::Apart(a)
            | Self::SolveInfo(a)
            | Self::ConvertSympy(a) => serde_json::to_value(a)?,
            Self::ConvertUnits(a) => serde_json::to_value(a)?,
            Self::Solve(a) => serde_json::to_value(a)?,
            Self::SymbolSets(a) => serde_json::to_value(a)?,
            Self::TruthTable(a) => serde_json::to_value(a)?,
            Self::TestHang(a) => serde_json::to_value(a)?,
        };
        Ok(StartPayload {
            command_type,
            start_args,
        })
    }

    pub fn from_payload(payload: StartPayload) -> Result<Self, CommandError> {
        let StartPayload {
            command_type,
            start_args,
        } = payload;

        fn args<T: serde::de::DeserializeOwned>(
            command_type: &str,
            start_args: serde_json::Value,
        ) -> Result<T, CommandError> {
            serde_json::from_value(start_args).map_err(|source| CommandError::InvalidArgs {
                command_type: command_type.to_string(),
                source,
            })
        }

        let ct = command_type.as_str();
        let command = match ct {
            Self::EVAL => Self::Eval(args(ct, start_args)?),
            Self::EVALF => Self::Evalf(args(ct, start_args)?),
            Self::EXPAND => Self::Expand(args(ct, start_args)?),
            Self::FACTOR => Self::Factor(args(ct, start_args)?),
            Self::APART => Self::Apart(args(ct, start_args)?),
            Self::CONVERT_UNITS => Self::ConvertUnits(args(ct, start_args)?),
            Self::SOLVE => Self::Solve(args(ct, start_args)?),
            Self::SOLVE_INFO => Self::SolveInfo(args(ct, start_args)?),
            Self::SYMBOL_SETS => Self::SymbolSets(args(ct, start_args)?),
            Self::CONVERT_SYMPY => Self::ConvertSympy(args(ct, start_args)?),
            Self::TRUTH_TABLE => Self::TruthTable(args(ct, start_args)?),
            Self::TEST_HANG => Self::TestHang(args(ct, start_args)?),
            _ => return Err(CommandError::Unsupported(ct.to_string())),
        };
        Ok(command)
    }
}

/// Success `type` used by every catalog command.
pub const RESULT_KIND: &str = "result";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateMetadata {
    /// Relation symbol to put between the input and the result (`=`, `\approx`, ...).
    pub separator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateResult {
    pub evaluated_expression: String,
    #[serde(default)]
    pub metadata: EvaluateMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveResult {
    pub solution_set: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatexMathSymbol {
    pub sympy_symbol: String,
    pub latex_symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveInfoResult {
    pub required_symbols: u32,
    pub available_symbols: Vec<LatexMathSymbol>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSetsResult {
    pub symbol_sets: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertSympyResult {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthTableResult {
    pub truth_table: String,
}

/// Value of the success response to an `interrupt` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptResult {
    /// Targets that were still running and got cancelled.
    #[serde(default)]
    pub interrupted: Vec<RequestId>,
}
