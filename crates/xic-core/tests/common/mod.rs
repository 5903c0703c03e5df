//! Shared helpers for the integration tests.
//!
//! A process may only ever construct one engine, so every test in a binary
//! runs on the shared [`TOKIO`] runtime against the shared [`engine`], one
//! test at a time.

#![allow(dead_code)]

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::Mutex;
use xic_core::{Adapter, Arguments, Engine, EngineConfig, ServantInfo};

static TOKIO: LazyLock<Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
});

static ENGINE: LazyLock<Engine> =
    LazyLock::new(|| Engine::new(EngineConfig::default()).unwrap());

static SERIAL: Mutex<()> = Mutex::const_new(());

/// Run `test` on the shared runtime while no other test of this binary runs.
pub fn run<F: Future>(test: F) -> F::Output {
    TOKIO.block_on(async {
        let _serial = SERIAL.lock().await;
        test.await
    })
}

/// The binary's engine.
pub fn engine() -> &'static Engine {
    &ENGINE
}

/// Activate a loopback adapter serving `servant` under `service`.
/// Returns the adapter and its bound port.
pub async fn serve(
    engine: &Engine,
    name: &str,
    service: &str,
    servant: ServantInfo,
) -> (Adapter, u16) {
    let adapter = engine.create_adapter(name, "@tcp+127.0.0.1+0").unwrap();
    adapter.add_servant(service, servant).unwrap();
    adapter.activate().await.unwrap();
    let port = adapter.endpoints()[0].port();
    (adapter, port)
}

/// A servant whose `name` method answers with `label`.
pub fn labelled(service: &str, label: &'static str) -> ServantInfo {
    ServantInfo::builder(service)
        .method("name", move |_current, _args| async move {
            Ok(Arguments::new().with("name", label))
        })
        .build()
}

/// A port nothing listens on.
pub fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
