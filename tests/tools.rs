//! Tool dispatch through a real Python worker, with stand-in tool functions.
//! Each test returns early when no `python3` is on PATH.

use std::{process::Command, sync::Arc, time::Duration};

use adsorb_agent::{
    sandbox::{ContextValue, Sandbox, SandboxOptions, TurnContext},
    tools::{ToolError, ToolRegistry, TOOL_SOURCE},
};

const STAND_INS: &str = r#"
__all__ = ["read_structure", "enumerate_sites", "relax"]

def read_structure(path):
    print("reading", path)
    return {"path": path, "atoms": 4}

def enumerate_sites(structure):
    return [structure["atoms"]]

def relax(structure, output_dir="./"):
    return output_dir
"#;

fn python() -> Option<String> {
    let ok = Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !ok {
        eprintln!("python3 not found, skipping");
    }
    ok.then(|| "python3".to_string())
}

async fn start(tools_source: &str) -> Option<Arc<Sandbox>> {
    let python = python()?;
    let options = SandboxOptions {
        python,
        modules: vec![],
        tools_source: tools_source.to_string(),
        timeout: Some(Duration::from_secs(30)),
    };
    Some(Arc::new(Sandbox::start(options).await.unwrap()))
}

#[tokio::test]
async fn results_are_bound_and_usable_from_code() {
    let Some(sb) = start(STAND_INS).await else { return };
    let dir = tempfile::tempdir().unwrap();
    let registry = ToolRegistry::new(Arc::clone(&sb), dir.path());

    let out = registry
        .execute("read_structure", r#"{"path": "cu.xyz", "bind_to": "slab"}"#, &TurnContext::new())
        .await
        .unwrap();
    assert_eq!(out.bound_to, "slab");
    assert!(out.summary.starts_with("slab = {'path': 'cu.xyz', 'atoms': 4}"));
    assert!(out.summary.contains("Printed output:\nreading cu.xyz"));
    assert!(matches!(out.context.get("slab"), Some(ContextValue::Handle { .. })));

    let sites = registry
        .execute("enumerate_sites", r#"{"structure": "slab"}"#, &out.context)
        .await
        .unwrap();
    assert_eq!(sites.summary, "enumerate_sites_result = [4]");
    assert!(sites.context.contains("slab"));

    let eval = sb.evaluate("print(slab['atoms'], enumerate_sites_result)", &sites.context).await;
    assert_eq!(eval.output, "4 [4]\n");
}

#[tokio::test]
async fn unresolved_references_are_caught_before_the_worker() {
    let Some(sb) = start(STAND_INS).await else { return };
    let registry = ToolRegistry::new(sb, "outputs");
    let err = registry
        .execute("enumerate_sites", r#"{"structure": "slab"}"#, &TurnContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::UnresolvedReference { tool: "enumerate_sites", ref name } if name == "slab"));

    let err = registry.execute("dissolve", "{}", &TurnContext::new()).await.unwrap_err();
    assert!(matches!(err, ToolError::UnknownTool(_)));

    let err = registry
        .execute("read_structure", "{not json", &TurnContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::InvalidArguments { .. }));
}

#[tokio::test]
async fn python_failures_come_back_as_errors() {
    let Some(sb) = start(STAND_INS).await else { return };
    let registry = ToolRegistry::new(Arc::clone(&sb), "outputs");
    let ctx = sb.evaluate("n = 5", &TurnContext::new()).await.context;
    let err = registry
        .execute("enumerate_sites", r#"{"structure": "n"}"#, &ctx)
        .await
        .unwrap_err();
    match err {
        ToolError::Failed { tool, trace } => {
            assert_eq!(tool, "enumerate_sites");
            assert!(trace.contains("TypeError"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn output_directories_are_created() {
    let Some(sb) = start(STAND_INS).await else { return };
    let dir = tempfile::tempdir().unwrap();
    let registry = ToolRegistry::new(Arc::clone(&sb), dir.path().join("default"));
    let ctx = sb.evaluate("s = {'atoms': 1}", &TurnContext::new()).await.context;

    let nested = dir.path().join("runs").join("a");
    let args = serde_json::json!({"structure": "s", "output_dir": nested.to_string_lossy()}).to_string();
    registry.execute("relax", &args, &ctx).await.unwrap();
    assert!(nested.is_dir());

    registry.execute("relax", r#"{"structure": "s"}"#, &ctx).await.unwrap();
    assert!(dir.path().join("default").is_dir());
}

#[tokio::test]
async fn real_tools_fail_cleanly_on_missing_files() {
    let Some(sb) = start(TOOL_SOURCE).await else { return };
    let registry = ToolRegistry::new(sb, "outputs");
    let err = registry
        .execute("read_structure", r#"{"path": "/definitely/not/here.xyz"}"#, &TurnContext::new())
        .await
        .unwrap_err();
    // Either ase is missing or the file is; both surface as a traceback.
    assert!(matches!(err, ToolError::Failed { tool: "read_structure", .. }));
}

#[tokio::test]
async fn failed_calls_still_name_bindings_lost_with_the_old_worker() {
    let Some(sb) = start(STAND_INS).await else { return };
    let registry = ToolRegistry::new(Arc::clone(&sb), "outputs");
    let ctx = sb.evaluate("s = {'atoms': 1}\nn = 5", &TurnContext::new()).await.context;
    assert!(matches!(ctx.get("s"), Some(ContextValue::Handle { .. })));

    let crash = sb.evaluate("import os\nos._exit(1)", &TurnContext::new()).await;
    assert!(crash.failed);

    let err = registry
        .execute("enumerate_sites", r#"{"structure": "n"}"#, &ctx)
        .await
        .unwrap_err();
    match err {
        ToolError::Failed { trace, .. } => {
            assert!(trace.contains("TypeError"));
            assert!(trace.contains("dropped bindings held by a previous worker: s"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
