//! Exercises the evaluator against a real Python worker.
//! Each test returns early when no `python3` is on PATH.

use std::{process::Command, sync::Arc, time::Duration};

use adsorb_agent::{
    sandbox::{BindingKind, ContextValue, Sandbox, SandboxOptions, TurnContext, ERROR_PREFIX, NO_OUTPUT},
    tools::TOOL_SOURCE,
};

fn python() -> Option<String> {
    let ok = Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if ok {
        Some("python3".to_string())
    } else {
        eprintln!("python3 not found, skipping");
        None
    }
}

fn options(python: String, timeout: Option<Duration>) -> SandboxOptions {
    SandboxOptions {
        python,
        modules: vec![
            ("math".into(), "math".into()),
            ("nope".into(), "surely_not_an_installed_module".into()),
        ],
        tools_source: TOOL_SOURCE.to_string(),
        timeout,
    }
}

async fn sandbox() -> Option<Arc<Sandbox>> {
    let python = python()?;
    Some(Arc::new(
        Sandbox::start(options(python, Some(Duration::from_secs(30)))).await.unwrap(),
    ))
}

#[tokio::test]
async fn prints_and_binds() {
    let Some(sb) = sandbox().await else { return };
    let eval = sb.evaluate("print('hi')\nx = 5", &TurnContext::new()).await;
    assert_eq!(eval.output, "hi\n");
    assert!(!eval.failed);
    assert_eq!(eval.context.len(), 1);
    assert_eq!(eval.context.get("x"), Some(&ContextValue::json(5)));
}

#[tokio::test]
async fn faults_are_reported_not_raised() {
    let Some(sb) = sandbox().await else { return };
    let eval = sb.evaluate("1/0", &TurnContext::new()).await;
    assert!(eval.failed);
    assert!(eval.output.starts_with(ERROR_PREFIX));
    assert!(eval.output.contains("ZeroDivisionError"));

    let eval = sb.evaluate("raise ValueError('bad site index')", &TurnContext::new()).await;
    assert!(eval.output.contains("bad site index"));

    let eval = sb.evaluate("def (", &TurnContext::new()).await;
    assert!(eval.output.contains("SyntaxError"));

    let eval = sb.evaluate("import sys\nsys.exit(3)", &TurnContext::new()).await;
    assert!(eval.failed);
    assert!(eval.output.contains("SystemExit"));

    // The worker survives all of the above.
    let eval = sb.evaluate("print(2 + 2)", &TurnContext::new()).await;
    assert_eq!(eval.output, "4\n");
}

#[tokio::test]
async fn silent_code_gets_the_placeholder() {
    let Some(sb) = sandbox().await else { return };
    let eval = sb.evaluate("y = 1", &TurnContext::new()).await;
    assert_eq!(eval.output, NO_OUTPUT);
}

#[tokio::test]
async fn empty_code_leaves_context_alone() {
    let Some(sb) = sandbox().await else { return };
    let first = sb
        .evaluate("x = 1\nclass K:\n    pass\nk = K()\nname = 'cu111'", &TurnContext::new())
        .await;
    let ctx = first.context.clone();
    assert!(!ctx.contains("K"));

    let eval = sb.evaluate("", &ctx).await;
    assert_eq!(eval.output, NO_OUTPUT);
    assert_eq!(eval.context, ctx);
    assert_eq!(ctx, first.context);
}

#[tokio::test]
async fn turns_are_isolated_unless_threaded() {
    let Some(sb) = sandbox().await else { return };
    let first = sb.evaluate("x = 5", &TurnContext::new()).await;

    let fresh = sb.evaluate("print(x)", &TurnContext::new()).await;
    assert!(fresh.failed);
    assert!(fresh.output.contains("NameError"));

    let threaded = sb.evaluate("print(x)", &first.context).await;
    assert_eq!(threaded.output, "5\n");
}

#[tokio::test]
async fn baseline_names_can_be_shadowed_per_context() {
    let Some(sb) = sandbox().await else { return };
    let same = sb.evaluate("import math as math\nprint(math)", &TurnContext::new()).await;
    assert!(same.output.starts_with("<module 'math'"));
    assert!(!same.context.contains("math"));

    let shadowed = sb.evaluate("import json as math", &TurnContext::new()).await;
    assert_eq!(
        shadowed.context.get("math"),
        Some(&ContextValue::Module { name: "json".into() })
    );
    let eval = sb.evaluate("print(math.__name__)", &shadowed.context).await;
    assert_eq!(eval.output, "json\n");

    let eval = sb.evaluate("print(math.__name__)", &TurnContext::new()).await;
    assert_eq!(eval.output, "math\n");
}

#[tokio::test]
async fn functions_and_objects_carry_over() {
    let Some(sb) = sandbox().await else { return };
    let first = sb
        .evaluate(
            "def double(v):\n    return 2 * v\nclass Site:\n    pass\ns = Site()\na = [1]\nb = a",
            &TurnContext::new(),
        )
        .await;
    let ctx = first.context;
    assert!(!ctx.contains("Site"));
    assert!(matches!(
        ctx.get("s"),
        Some(ContextValue::Handle { type_name, .. }) if type_name == "Site"
    ));

    let eval = sb.evaluate("print(double(21))", &ctx).await;
    assert_eq!(eval.output, "42\n");

    let eval = sb.evaluate("b.append(2)\nprint(a)", &ctx).await;
    assert_eq!(eval.output, "[1, 2]\n");
}

#[tokio::test]
async fn baseline_manifest_reports_tools_and_missing_modules() {
    let Some(sb) = sandbox().await else { return };
    let baseline = sb.baseline();
    assert_eq!(baseline.get("math"), Some(BindingKind::Module));
    assert_eq!(baseline.get("print"), Some(BindingKind::Callable));
    assert_eq!(baseline.get("place_fragment"), Some(BindingKind::Callable));
    assert!(!baseline.contains("nope"));
    assert_eq!(baseline.missing().len(), 1);
    assert_eq!(baseline.missing()[0].alias, "nope");
    assert!(baseline.python_version().starts_with('3'));
}

#[tokio::test]
async fn hung_and_crashed_workers_are_replaced() {
    let Some(python) = python() else { return };
    let sb = Sandbox::start(options(python, Some(Duration::from_secs(1)))).await.unwrap();

    let held = sb.evaluate("items = [1, 2]", &TurnContext::new()).await;
    assert!(matches!(held.context.get("items"), Some(ContextValue::Handle { .. })));

    let eval = sb.evaluate("while True:\n    pass", &TurnContext::new()).await;
    assert!(eval.failed);
    assert!(eval.output.contains("exceeded"));

    let eval = sb.evaluate("print('back')", &held.context).await;
    assert!(eval.output.starts_with("back\n"));
    assert!(eval
        .output
        .contains("dropped bindings held by a previous worker: items"));
    assert!(!eval.context.contains("items"));

    let eval = sb.evaluate("import os\nos._exit(1)", &TurnContext::new()).await;
    assert!(eval.failed);
    assert!(eval.output.contains("worker exited unexpectedly"));

    let eval = sb.evaluate("print('again')", &TurnContext::new()).await;
    assert_eq!(eval.output, "again\n");
}

#[tokio::test]
async fn interrupts_and_other_base_exceptions_are_contained() {
    let Some(sb) = sandbox().await else { return };
    let held = sb.evaluate("items = [1, 2]", &TurnContext::new()).await;

    let eval = sb.evaluate("raise KeyboardInterrupt('stop the relaxation')", &held.context).await;
    assert!(eval.failed);
    assert!(eval.output.starts_with(ERROR_PREFIX));
    assert!(eval.output.contains("KeyboardInterrupt: stop the relaxation"));
    assert!(!eval.output.contains("dropped bindings"));

    let eval = sb.evaluate("raise GeneratorExit('gen')", &held.context).await;
    assert!(eval.output.contains("GeneratorExit"));

    let eval = sb.evaluate("print(items)", &held.context).await;
    assert_eq!(eval.output, "[1, 2]\n");
}

#[tokio::test]
async fn snippets_cannot_read_the_request_pipe() {
    let Some(python) = python() else { return };
    let sb = Sandbox::start(options(python, None)).await.unwrap();
    let held = sb.evaluate("items = [1]", &TurnContext::new()).await;

    let eval = sb.evaluate("x = input()", &held.context).await;
    assert!(eval.failed);
    assert!(eval.output.contains("EOFError"));

    let eval = sb.evaluate("import sys\nprint(repr(sys.stdin.read()))", &held.context).await;
    assert_eq!(eval.output, "''\n");

    let eval = sb.evaluate("print(items)", &held.context).await;
    assert_eq!(eval.output, "[1]\n");
}

#[tokio::test]
async fn unencodable_strings_do_not_break_the_turn() {
    let Some(sb) = sandbox().await else { return };
    let held = sb.evaluate("items = [1]", &TurnContext::new()).await;

    let eval = sb.evaluate("s = '\\udcff'\nprint('ok')", &held.context).await;
    assert!(!eval.failed, "{}", eval.output);
    assert_eq!(eval.output, "ok\n");
    assert!(matches!(eval.context.get("s"), Some(ContextValue::Handle { .. })));

    let eval = sb.evaluate("print(s)\nprint(len(s))", &eval.context).await;
    assert!(!eval.failed, "{}", eval.output);
    assert_eq!(eval.output, "\\udcff\n1\n");

    let eval = sb.evaluate("raise ValueError('bad \\udcff byte')", &held.context).await;
    assert!(eval.failed);
    assert!(eval.output.contains("bad \\udcff byte"));

    let eval = sb.evaluate("print(items)", &eval.context).await;
    assert_eq!(eval.output, "[1]\n");
}

#[tokio::test]
async fn stdout_is_restored_after_a_fault_mid_print() {
    let Some(sb) = sandbox().await else { return };
    let eval = sb
        .evaluate(
            "class Loud:\n    def __str__(self):\n        raise RuntimeError('no text form')\nprint('before')\nprint(Loud())",
            &TurnContext::new(),
        )
        .await;
    assert!(eval.failed);
    assert!(eval.output.starts_with(ERROR_PREFIX));
    assert!(eval.output.contains("RuntimeError: no text form"));

    let eval = sb.evaluate("print('after')", &TurnContext::new()).await;
    assert_eq!(eval.output, "after\n");
}

#[tokio::test]
async fn replaced_objects_are_released_by_the_worker() {
    let Some(sb) = sandbox().await else { return };
    let mut ctx = sb.evaluate("x = []", &TurnContext::new()).await.context;
    for _ in 0..40 {
        let eval = sb.evaluate("x = x + [len(x)]", &ctx).await;
        assert!(!eval.failed, "{}", eval.output);
        ctx = eval.context;
    }
    let eval = sb
        .evaluate("import sys\nprint(len(x), len(sys.modules['__main__'].STORE))", &ctx)
        .await;
    let counts: Vec<usize> = eval.output.split_whitespace().map(|n| n.parse().unwrap()).collect();
    assert_eq!(counts[0], 40);
    assert!(counts[1] <= 10, "store holds {} objects", counts[1]);
}
