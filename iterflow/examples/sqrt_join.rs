use iterflow::execution::progress_stream;
use iterflow::{
    interface_fn, progress_channel, single_output, Engine, EngineConfig, ExecutionEvent,
    FailurePolicy, IterationPolicy, NodeTemplate, Value, WorkflowGraph,
};
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let mut graph = WorkflowGraph::new("sqrt-join");
    graph
        .add_node(
            NodeTemplate::new(
                "iternode",
                interface_fn(|inputs| Ok(single_output("x", inputs["x"].clone()))),
            )
            .input("x")
            .output("x"),
        )
        .expect("Failed to add iternode");
    graph
        .add_node(
            NodeTemplate::new(
                "sqrt",
                interface_fn(|inputs| {
                    let roots: Vec<Value> = inputs["xs"]
                        .as_array()
                        .unwrap_or_default()
                        .iter()
                        .filter_map(Value::as_number)
                        .map(|x| Value::from(x.sqrt()))
                        .collect();
                    Ok(single_output("roots", Value::Array(roots)))
                }),
            )
            .join_input("xs")
            .output("roots"),
        )
        .expect("Failed to add sqrt");
    graph
        .connect("iternode", "x", "sqrt", "xs")
        .expect("Failed to connect");
    graph
        .set_iterables(
            "iternode",
            [("x", vec![Value::from(1), Value::from(4), Value::from(9)])],
            IterationPolicy::Zip,
        )
        .expect("Failed to set iterables");
    graph
        .set_join("sqrt", "iternode", ["xs"], FailurePolicy::FailFast)
        .expect("Failed to set join");

    let frozen = graph.freeze().expect("Failed to freeze graph");
    println!("✓ Expanded to {} execution nodes", frozen.execution_graph().len());

    let (tx, rx) = progress_channel();
    let printer = tokio::spawn(async move {
        let mut events = progress_stream(rx);
        while let Some(event) = events.next().await {
            match &event {
                ExecutionEvent::JoinReleased { join, state, .. } => {
                    println!("  {} released ({})", join, state);
                }
                ExecutionEvent::NodeCompleted { .. } | ExecutionEvent::NodeFailed { .. } => {
                    if let Some(node) = event.node() {
                        println!("  {} finished", node);
                    }
                }
                _ => {}
            }
        }
    });

    let engine = Engine::new(frozen)
        .with_config(EngineConfig::parallel(2))
        .with_progress(tx);
    let report = engine.run().await.expect("Run failed");
    drop(engine);
    let _ = printer.await;

    for (field, value) in report.joined_inputs("sqrt") {
        println!("✓ Joined {}: {}", field, value);
    }
    for (field, value) in report.outputs_by_field("sqrt") {
        println!("✓ Output {}: {}", field, value);
    }
    if !report.success() {
        println!("{}", report.failures());
    }
}
