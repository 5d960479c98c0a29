//! Newline-delimited JSON exchanged with the Python worker.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::scope::{BaselineEntry, MissingModule, TurnContext};
use super::SandboxError;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request<'a> {
    Init {
        modules: &'a [(String, String)],
        tools: &'a str,
    },
    Exec {
        code: &'a str,
        context: &'a TurnContext,
    },
    Call {
        tool: &'a str,
        args: &'a serde_json::Value,
        bind: &'a str,
        context: &'a TurnContext,
    },
}

#[derive(Debug, Deserialize)]
pub struct InitReply {
    pub pid: u32,
    pub python: String,
    pub baseline: Vec<BaselineEntry>,
    #[serde(default)]
    pub missing: Vec<MissingModule>,
}

#[derive(Debug, Deserialize)]
pub struct ExecReply {
    pub output: String,
    #[serde(default)]
    pub failed: bool,
    pub context: TurnContext,
    #[serde(default)]
    pub stale: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallReply {
    pub repr: String,
    #[serde(default)]
    pub printed: String,
    pub context: TurnContext,
    #[serde(default)]
    pub stale: Vec<String>,
}

/// A request the worker answered with `"ok": false`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Failure {
    pub error: String,
    #[serde(default)]
    pub stale: Vec<String>,
}

#[derive(Deserialize)]
struct Envelope {
    ok: bool,
}

pub fn encode(request: &Request<'_>) -> Result<String, SandboxError> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    Ok(line)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<Result<T, Failure>, SandboxError> {
    let envelope: Envelope = serde_json::from_str(line)?;
    if envelope.ok {
        Ok(Ok(serde_json::from_str(line)?))
    } else {
        Ok(Err(serde_json::from_str(line)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::scope::ContextValue;

    #[test]
    fn exec_request_shape() {
        let mut ctx = TurnContext::new();
        ctx.insert("x", ContextValue::json(1));
        let line = encode(&Request::Exec { code: "print(x)", context: &ctx }).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "op": "exec",
                "code": "print(x)",
                "context": {"x": {"kind": "json", "value": 1}}
            })
        );
    }

    #[test]
    fn init_request_lists_module_pairs() {
        let modules = vec![("np".to_string(), "numpy".to_string())];
        let line = encode(&Request::Init { modules: &modules, tools: "" }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["modules"], serde_json::json!([["np", "numpy"]]));
    }

    #[test]
    fn replies_split_on_ok() {
        let ok: Result<ExecReply, Failure> =
            decode(r#"{"ok":true,"output":"hi\n","failed":false,"context":{},"stale":[]}"#).unwrap();
        assert_eq!(ok.unwrap().output, "hi\n");

        let failed: Result<ExecReply, Failure> =
            decode(r#"{"ok":false,"error":"KeyError: 'op'"}"#).unwrap();
        assert_eq!(failed.unwrap_err().error, "KeyError: 'op'");

        assert!(decode::<ExecReply>("not json").is_err());
    }
}
