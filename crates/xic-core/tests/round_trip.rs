mod common;

use common::{engine, eventually, run, serve};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Notify;
use xic_core::{echo_servant, Arguments, Fault, ServantInfo, XicError};

#[test]
fn test_echo_round_trip() {
    run(async {
        let engine = engine();
        let (_adapter, port) = serve(engine, "EchoMain", "Echo", echo_servant("Echo")).await;

        let proxy = engine
            .string_to_proxy(&format!("Echo @tcp+127.0.0.1+{}", port))
            .unwrap();
        let input = Arguments::new().with("a", 1);
        let out = proxy.invoke("echo", input.clone()).await.unwrap();
        assert_eq!(out, input);

        let mut pending = proxy
            .invoke_async("echo", Arguments::new().with("b", "two"))
            .await
            .unwrap();
        assert_ne!(pending.txid(), 0);
        pending.wait().await;
        assert!(pending.is_done());
        assert_eq!(pending.out().unwrap().get("b").unwrap(), "two");

        proxy.invoke_oneway("echo", Arguments::new()).await.unwrap();
    })
}

#[derive(Deserialize)]
struct Half {
    half: i64,
}

#[test]
fn test_faults_reach_the_caller() {
    run(async {
        let engine = engine();
        let calc = ServantInfo::builder("Calc")
            .typed("half", |_current, n: serde_json::Value| async move {
                let n = n["n"].as_i64().ok_or_else(|| XicError::InvalidParams {
                    message: "n must be an integer".to_string(),
                })?;
                Ok(serde_json::json!({ "half": n / 2 }))
            })
            .oneway("forget", |_current, _args| async move { Ok(()) })
            .build();
        let (_adapter, port) = serve(engine, "CalcMain", "Calc", calc).await;
        let proxy = engine
            .string_to_proxy(&format!("Calc @tcp+127.0.0.1+{}", port))
            .unwrap();

        let out = proxy.invoke("half", Arguments::new().with("n", 9)).await.unwrap();
        assert_eq!(out.get("half").unwrap(), 4);

        let typed: Half = proxy.call("half", &serde_json::json!({ "n": 5 })).await.unwrap();
        assert_eq!(typed.half, 2);

        let err = proxy.invoke("half", Arguments::new().with("n", "x")).await.unwrap_err();
        assert!(err.fault().unwrap().is(Fault::PARAMETER));

        let err = proxy.invoke("triple", Arguments::new()).await.unwrap_err();
        assert!(err.fault().unwrap().is(Fault::METHOD_NOT_FOUND));

        let err = proxy
            .with_service("Nobody")
            .invoke("half", Arguments::new())
            .await
            .unwrap_err();
        assert!(err.fault().unwrap().is(Fault::SERVICE_NOT_FOUND));

        // A twoway call to a one-way method is acknowledged with no output.
        let out = proxy.invoke("forget", Arguments::new()).await.unwrap();
        assert_eq!(out, Arguments::new());

        // The connection survives service-level faults.
        assert!(proxy.invoke("half", Arguments::new().with("n", 2)).await.is_ok());
    })
}

#[test]
fn test_overload_rejects_excess_requests() {
    run(async {
        let engine = engine();
        engine.set_max_in_flight(1);
        let gate = Arc::new(Notify::new());
        let held = gate.clone();
        let slow = ServantInfo::builder("Slow")
            .method("wait", move |_current, _args| {
                let gate = held.clone();
                async move {
                    gate.notified().await;
                    Ok(Arguments::new().with("done", true))
                }
            })
            .build();
        let (_adapter, port) = serve(engine, "SlowMain", "Slow", slow).await;
        let proxy = engine
            .string_to_proxy(&format!("Slow @tcp+127.0.0.1+{}", port))
            .unwrap();

        let first = proxy.invoke_async("wait", Arguments::new()).await.unwrap();
        assert!(eventually(|| engine.in_flight() == 1).await);

        let err = proxy.invoke("wait", Arguments::new()).await.unwrap_err();
        let fault = err.fault().expect("overload must come back as a fault");
        assert!(fault.is(Fault::SERVICE_OVERLOADED));

        gate.notify_one();
        let out = first.into_output().await.unwrap();
        assert_eq!(out.get("done").unwrap(), true);
        assert!(eventually(|| engine.in_flight() == 0).await);

        // Capacity is back.
        gate.notify_one();
        assert!(proxy.invoke("wait", Arguments::new()).await.is_ok());
        engine.set_max_in_flight(0);
    })
}
