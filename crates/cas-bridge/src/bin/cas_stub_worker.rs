//! Minimal worker for exercising the bridge without a real algebra backend.
//!
//! Usage: cas-stub-worker <port> [--ignore-exit]

use std::process;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

use cas_bridge::bridge::commands::{EvaluateArgs, EvaluateMetadata, EvaluateResult, TestHangArgs};
use cas_bridge::{Command, CommandOutput, HandlerError, HandlerRegistry, WorkerConfig};

struct Args {
    port: u16,
    ignore_exit: bool,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut port: Option<u16> = None;
    let mut ignore_exit = false;

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--ignore-exit" => ignore_exit = true,
            "--help" | "-h" => return Err(String::new()),
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            value => {
                if port.is_some() {
                    return Err(format!("unexpected argument: {value}"));
                }
                port = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid port: {value}"))?,
                );
            }
        }
    }

    let port = port.ok_or("missing required argument: <port>")?;
    Ok(Args { port, ignore_exit })
}

/// Sum of integers joined by `+` and `-`.
fn eval_sum(expression: &str) -> Result<i64, String> {
    let mut total: i64 = 0;
    let mut sign: i64 = 1;
    let mut current: Option<i64> = None;

    for c in expression.chars().filter(|c| !c.is_whitespace()) {
        match c {
            '0'..='9' => {
                let digit = i64::from(c as u8 - b'0');
                let value = current
                    .unwrap_or(0)
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(digit))
                    .ok_or("integer overflow")?;
                current = Some(value);
            }
            '+' | '-' => {
                if let Some(value) = current.take() {
                    total = total.checked_add(sign * value).ok_or("integer overflow")?;
                    sign = 1;
                }
                if c == '-' {
                    sign = -sign;
                }
            }
            other => return Err(format!("unsupported character `{other}`")),
        }
    }

    let value = current.ok_or("expression is empty or ends with an operator")?;
    total.checked_add(sign * value).ok_or_else(|| "integer overflow".to_string())
}

async fn eval(args: Value) -> Result<CommandOutput, HandlerError> {
    let args: EvaluateArgs =
        serde_json::from_value(args).map_err(|e| HandlerError::invalid_args(Command::EVAL, e))?;
    let value = eval_sum(&args.expression).map_err(|e| {
        HandlerError::new(
            "Could not evaluate expression",
            format!("eval `{}`: {}", args.expression, e),
        )
    })?;
    CommandOutput::result(&EvaluateResult {
        evaluated_expression: value.to_string(),
        metadata: EvaluateMetadata {
            separator: "=".to_string(),
            start_line: None,
            end_line: None,
        },
    })
}

async fn test_hang(args: Value) -> Result<CommandOutput, HandlerError> {
    let args: TestHangArgs = serde_json::from_value(args)
        .map_err(|e| HandlerError::invalid_args(Command::TEST_HANG, e))?;
    if !args.hang_time.is_finite() || args.hang_time < 0.0 {
        return Err(HandlerError::invalid_args(
            Command::TEST_HANG,
            format!("hang_time must be a non-negative number, got {}", args.hang_time),
        ));
    }
    tokio::time::sleep(Duration::from_secs_f64(args.hang_time)).await;
    CommandOutput::result(&serde_json::json!({}))
}

async fn fail(_args: Value) -> Result<CommandOutput, HandlerError> {
    Err(HandlerError::new(
        "The fail command always fails",
        "stub worker: fail command invoked",
    ))
}

fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .register_fn(Command::EVAL, eval)
        .register_fn(Command::TEST_HANG, test_hang)
        .register_fn("fail", fail)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: cas-stub-worker <port> [--ignore-exit]");
            process::exit(2);
        }
    };

    cas_bridge::logging::init_tracing();
    tracing::info!(port = args.port, ignore_exit = args.ignore_exit, "Stub worker starting");

    let config = WorkerConfig {
        ignore_exit: args.ignore_exit,
    };
    cas_bridge::run_worker(args.port, registry(), config)
        .await
        .with_context(|| format!("worker on port {} failed", args.port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("cas-stub-worker")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_port_and_flag() {
        let args = parse_args(&argv(&["4100", "--ignore-exit"])).unwrap();
        assert_eq!(args.port, 4100);
        assert!(args.ignore_exit);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&argv(&[])).is_err());
        assert!(parse_args(&argv(&["notaport"])).is_err());
        assert!(parse_args(&argv(&["1", "2"])).is_err());
        assert!(parse_args(&argv(&["1", "--verbose"])).is_err());
    }

    #[test]
    fn sums_integers() {
        assert_eq!(eval_sum("1 + 1"), Ok(2));
        assert_eq!(eval_sum("10 - 3 + 5"), Ok(12));
        assert_eq!(eval_sum("-4 + 1"), Ok(-3));
        assert_eq!(eval_sum("2 - -1"), Ok(3));
    }

    #[test]
    fn rejects_non_sums() {
        assert!(eval_sum("").is_err());
        assert!(eval_sum("1 +").is_err());
        assert!(eval_sum("x + 1").is_err());
        assert!(eval_sum("2 * 3").is_err());
    }

    #[tokio::test]
    async fn eval_handler_returns_evaluate_result() {
        let output = eval(serde_json::json!({"expression": "1 + 1"})).await.unwrap();
        assert_eq!(output.kind, "result");
        assert_eq!(output.value["evaluated_expression"], "2");
    }

    #[tokio::test]
    async fn eval_handler_rejects_missing_expression() {
        let err = eval(serde_json::json!({})).await.unwrap_err();
        assert!(err.dev_message.contains("eval"));
    }
}
