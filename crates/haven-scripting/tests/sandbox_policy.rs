// Policy enforcement across the sandbox/tool boundary: scripts can only
// reach tools inside the allow set, whatever the script does.

use std::sync::Arc;

use serde_json::json;

use haven_scripting::{ScriptConfig, ScriptEngine, ScriptValue, ToolPolicy};
use haven_tools::local::ToolHandler;
use haven_tools::{
    LocalToolsProvider, ToolDefinition, ToolExecutionContext, ToolOutput, ToolsProvider,
};

fn provider_with_two_tools() -> Arc<dyn ToolsProvider> {
    let mut provider = LocalToolsProvider::new();

    let echo: ToolHandler = Box::new(|args, _ctx| {
        Box::pin(async move {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
            Ok(ToolOutput::text(text.to_string()))
        })
    });
    provider
        .register(
            ToolDefinition::new("echo", "Echo text back", json!({"type": "object"})),
            echo,
        )
        .unwrap();

    let add: ToolHandler = Box::new(|args, _ctx| {
        Box::pin(async move {
            let a = args.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
            let b = args.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(ToolOutput::text((a + b).to_string()))
        })
    });
    provider
        .register(
            ToolDefinition::new("add_numbers", "Add two numbers", json!({"type": "object"})),
            add,
        )
        .unwrap();

    Arc::new(provider)
}

fn ctx() -> ToolExecutionContext {
    let db = haven_storage::Db::open_in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = haven_attachments::BlobStore::new(dir.path()).unwrap();
    // The tempdir handle is dropped here; the sandbox tests never touch the
    // blob store, they only need a structurally complete context.
    let registry = haven_attachments::AttachmentRegistry::new(db.clone(), store, "/attachments");
    ToolExecutionContext::new("api", "c1", db, registry)
}

fn allow_only_echo() -> ScriptEngine {
    ScriptEngine::new(ScriptConfig {
        policy: ToolPolicy::allow_only(["echo".to_string()]),
        ..Default::default()
    })
}

#[tokio::test]
async fn denied_tool_execution_fails_with_not_allowed() {
    let engine = allow_only_echo();
    let err = engine
        .evaluate(
            "tools_execute(\"add_numbers\", a=1, b=2)",
            &json!({}),
            Some(provider_with_two_tools()),
            Some(ctx()),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not allowed"), "got: {err}");
}

#[tokio::test]
async fn allowed_tool_executes() {
    let engine = allow_only_echo();
    let outcome = engine
        .evaluate(
            "tools_execute(\"echo\", text=\"hi there\")",
            &json!({}),
            Some(provider_with_two_tools()),
            Some(ctx()),
        )
        .await
        .unwrap();
    assert_eq!(outcome.value.to_display_string(), "hi there");
}

#[tokio::test]
async fn tools_list_is_filtered_by_policy() {
    let engine = allow_only_echo();
    let outcome = engine
        .evaluate(
            "tools_list()",
            &json!({}),
            Some(provider_with_two_tools()),
            Some(ctx()),
        )
        .await
        .unwrap();
    let ScriptValue::List(items) = &outcome.value else {
        panic!("expected a list, got {}", outcome.value);
    };
    assert_eq!(items.len(), 1);
    assert_eq!(
        items[0].dict_get("name").unwrap().to_display_string(),
        "echo"
    );
}

#[tokio::test]
async fn tools_get_hides_denied_tools() {
    let engine = allow_only_echo();
    let outcome = engine
        .evaluate(
            "[tools_get(\"echo\"), tools_get(\"add_numbers\")]",
            &json!({}),
            Some(provider_with_two_tools()),
            Some(ctx()),
        )
        .await
        .unwrap();
    let ScriptValue::List(items) = &outcome.value else {
        panic!("expected a list");
    };
    assert!(matches!(items[0], ScriptValue::Dict(_)));
    assert!(matches!(items[1], ScriptValue::None));
}

#[tokio::test]
async fn direct_tool_call_sugar_respects_policy() {
    let engine = allow_only_echo();
    let provider = provider_with_two_tools();

    let outcome = engine
        .evaluate(
            "echo(text=\"direct\")",
            &json!({}),
            Some(provider.clone()),
            Some(ctx()),
        )
        .await
        .unwrap();
    assert_eq!(outcome.value.to_display_string(), "direct");

    let err = engine
        .evaluate(
            "add_numbers(a=1, b=2)",
            &json!({}),
            Some(provider),
            Some(ctx()),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not allowed"));
}

#[tokio::test]
async fn empty_allow_set_denies_everything() {
    let engine = ScriptEngine::new(ScriptConfig {
        policy: ToolPolicy::allow_only(Vec::<String>::new()),
        ..Default::default()
    });
    let err = engine
        .evaluate(
            "tools_execute(\"echo\", text=\"x\")",
            &json!({}),
            Some(provider_with_two_tools()),
            Some(ctx()),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not allowed"));
}
