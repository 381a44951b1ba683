use std::time::Duration;
use tokio::time::sleep;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;

use flowgate::flow::ControlBehavior;
use flowgate::flow::FlowRule;
use tower_flowgate::FlowControlLayer;
use tower_flowgate::GateError;

#[tokio::main]
async fn main() {
    // 1. Throttle the demo resource to 20 qps with a 300ms queueing budget
    flowgate::flow::load_flow_rules_of_resource(
        "stress-demo",
        vec![FlowRule {
            resource: "stress-demo".into(),
            threshold: 20.0,
            control_behavior: ControlBehavior::Throttling,
            max_queueing_time_ms: Some(300),
            ..FlowRule::default()
        }],
    )
    .expect("demo rule should load");

    // 2. Define a "work" service
    let service = tower::service_fn(|i: usize| async move {
        sleep(Duration::from_millis(1)).await;
        Ok::<_, tower::BoxError>(format!("Request {i:03} Successful"))
    });

    println!("Starting flow control stress test...");
    println!("Rule: 20 qps throttling, 300ms queueing budget\n");

    let svc = FlowControlLayer::new("stress-demo").layer(service);

    let mut tasks = Vec::new();
    for i in 0..50 {
        let mut local_svc = svc.clone();
        tasks.push(tokio::spawn(async move {
            match local_svc.ready().await {
                Ok(ready_svc) => match ready_svc.call(i).await {
                    Ok(resp) => println!("pass {}", resp),
                    Err(e) => {
                        if let Some(gate_err) = e.downcast_ref::<GateError>() {
                            println!("[{i:03}] rejected: {gate_err}");
                        } else {
                            println!("[{i:03}] unexpected error: {e}");
                        }
                    }
                },
                Err(e) => println!("[{i:03}] service unavailable: {e}"),
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    println!("\nStress test complete.");
}
