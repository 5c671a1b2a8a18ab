//! Output writer: every CLI handler builds a small serializable result
//! and hands it to a `Writer`, which renders it as a one-line-ish text
//! summary or as JSON, with a structured error shape for scripting.

use crate::config::Config;
use crate::error::Error;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    Text,
    Json { pretty: bool },
}

impl Writer {
    /// Precedence: explicit `--format` flag > `TICKETFLOW_OUTPUT_FORMAT` >
    /// `output.default_format` in config > built-in default `text`.
    pub fn resolve(config: &Config, cli_format: Option<&str>) -> Self {
        let format = cli_format
            .map(str::to_string)
            .or_else(|| std::env::var("TICKETFLOW_OUTPUT_FORMAT").ok())
            .unwrap_or_else(|| config.output.default_format.clone());

        if format.eq_ignore_ascii_case("json") {
            Writer::Json {
                pretty: config.output.json_pretty,
            }
        } else {
            Writer::Text
        }
    }

    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) {
        match self {
            Writer::Text => println!("{}", text(value)),
            Writer::Json { pretty } => {
                let rendered = if *pretty {
                    serde_json::to_string_pretty(value)
                } else {
                    serde_json::to_string(value)
                };
                match rendered {
                    Ok(s) => println!("{s}"),
                    Err(err) => eprintln!("Error: failed to serialize output: {err}"),
                }
            }
        }
    }

    /// Renders an error in a stable, structured shape, returning the
    /// process exit code it implies.
    pub fn emit_error(&self, err: &Error) -> i32 {
        match self {
            Writer::Text => {
                eprintln!("Error: {err}");
                let suggestions = err.suggestions();
                if !suggestions.is_empty() {
                    eprintln!("Suggestions:");
                    for suggestion in &suggestions {
                        eprintln!("  - {suggestion}");
                    }
                }
            }
            Writer::Json { pretty } => {
                let payload = json!({
                    "error": {
                        "code": err.code(),
                        "message": err.to_string(),
                        "details": serde_json::Value::Null,
                        "suggestions": err.suggestions(),
                    }
                });
                let rendered = if *pretty {
                    serde_json::to_string_pretty(&payload)
                } else {
                    serde_json::to_string(&payload)
                };
                if let Ok(s) = rendered {
                    eprintln!("{s}");
                }
            }
        }
        err.exit_code()
    }
}
