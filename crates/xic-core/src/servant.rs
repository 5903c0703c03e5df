//! Servant dispatch tables.
//!
//! A servant is registered as a [`ServantInfo`]: a table from method name to
//! handler, built once with [`ServantBuilder`] and read-only afterwards.
//! Typed methods decode their input record and encode their output record at
//! the table boundary, so dispatch itself never inspects types.

use crate::codec::{Arguments, Context};
use crate::connection::Connection;
use crate::{Result, XicError};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Built-in method every servant answers with empty arguments.
pub const PING_METHOD: &str = "\\ping";

/// Per-request information handed to a method handler.
#[derive(Debug, Clone)]
pub struct Current {
    connection: Option<Connection>,
    pub txid: i64,
    pub service: String,
    pub method: String,
    pub context: Context,
}

impl Current {
    pub(crate) fn new(
        connection: Option<Connection>,
        txid: i64,
        service: String,
        method: String,
        context: Context,
    ) -> Self {
        Self {
            connection,
            txid,
            service,
            method,
            context,
        }
    }

    /// The connection the request arrived on.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn is_oneway(&self) -> bool {
        self.txid == 0
    }
}

pub type Handler =
    Arc<dyn Fn(Current, Arguments) -> BoxFuture<'static, Result<Arguments>> + Send + Sync>;

/// Dispatch entry for one method.
#[derive(Clone)]
pub struct MethodInfo {
    pub oneway: bool,
    handler: Handler,
}

impl std::fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodInfo")
            .field("oneway", &self.oneway)
            .finish_non_exhaustive()
    }
}

/// Dispatch table of a registered servant.
#[derive(Clone)]
pub struct ServantInfo {
    service: String,
    methods: Arc<HashMap<String, MethodInfo>>,
    fallback: Option<Handler>,
}

impl std::fmt::Debug for ServantInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServantInfo")
            .field("service", &self.service)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ServantInfo {
    pub fn builder(service: impl Into<String>) -> ServantBuilder {
        ServantBuilder {
            service: service.into(),
            methods: HashMap::new(),
            fallback: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.get(name)
    }

    pub fn is_oneway(&self, method: &str) -> bool {
        self.method(method).is_some_and(|info| info.oneway)
    }

    /// Run the handler for `current.method`.
    pub async fn dispatch(&self, current: Current, args: Arguments) -> Result<Arguments> {
        if let Some(info) = self.methods.get(&current.method) {
            return (info.handler.as_ref())(current, args).await;
        }
        if current.method == PING_METHOD {
            return Ok(Arguments::new());
        }
        match &self.fallback {
            Some(fallback) => (fallback.as_ref())(current, args).await,
            None => Err(XicError::MethodNotFound {
                service: current.service,
                method: current.method,
            }),
        }
    }
}

/// Builds a [`ServantInfo`].
pub struct ServantBuilder {
    service: String,
    methods: HashMap<String, MethodInfo>,
    fallback: Option<Handler>,
}

impl ServantBuilder {
    /// Register a twoway method working on raw arguments.
    pub fn method<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Current, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arguments>> + Send + 'static,
    {
        self.insert(name.into(), false, f)
    }

    /// Register a method callers are expected to invoke one-way.
    pub fn oneway<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Current, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(name.into(), true, move |current, args| {
            let f = f.clone();
            async move {
                (*f)(current, args).await?;
                Ok(Arguments::new())
            }
        })
    }

    /// Register a method whose input and output are typed records.
    pub fn typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(Current, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(name.into(), false, move |current, args: Arguments| {
            let f = f.clone();
            async move {
                let input: In = args.into_record()?;
                let output = (*f)(current, input).await?;
                Arguments::from_record(&output)
            }
        })
    }

    /// Handler for any method not in the table.
    pub fn fallback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Current, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arguments>> + Send + 'static,
    {
        self.fallback = Some(boxed(f));
        self
    }

    pub fn build(self) -> ServantInfo {
        ServantInfo {
            service: self.service,
            methods: Arc::new(self.methods),
            fallback: self.fallback,
        }
    }

    fn insert<F, Fut>(mut self, name: String, oneway: bool, f: F) -> Self
    where
        F: Fn(Current, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arguments>> + Send + 'static,
    {
        self.methods.insert(
            name,
            MethodInfo {
                oneway,
                handler: boxed(f),
            },
        );
        self
    }
}

fn boxed<F, Fut>(f: F) -> Handler
where
    F: Fn(Current, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arguments>> + Send + 'static,
{
    Arc::new(
        move |current: Current, args: Arguments| -> BoxFuture<'static, Result<Arguments>> {
            Box::pin(f(current, args))
        },
    )
}

/// A servant that returns every request's arguments unchanged.
pub fn echo_servant(service: impl Into<String>) -> ServantInfo {
    ServantInfo::builder(service)
        .fallback(|_current, args| async move { Ok(args) })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn current(method: &str) -> Current {
        Current::new(None, 1, "Calc".to_string(), method.to_string(), Context::new())
    }

    #[derive(Deserialize)]
    struct AddIn {
        a: i64,
        b: i64,
    }

    #[derive(Serialize)]
    struct AddOut {
        sum: i64,
    }

    fn calc() -> ServantInfo {
        ServantInfo::builder("Calc")
            .typed("add", |_cur, input: AddIn| async move {
                Ok(AddOut {
                    sum: input.a + input.b,
                })
            })
            .method("whoami", |cur, _args| async move {
                Ok(Arguments::new().with("method", cur.method))
            })
            .oneway("log", |_cur, _args| async move { Ok(()) })
            .build()
    }

    #[tokio::test]
    async fn test_typed_dispatch() {
        let out = calc()
            .dispatch(current("add"), Arguments::new().with("a", 2).with("b", 3))
            .await
            .unwrap();
        assert_eq!(out.get("sum"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_typed_bad_input_is_invalid_params() {
        let err = calc()
            .dispatch(current("add"), Arguments::new().with("a", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, XicError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_unknown_method_and_ping() {
        let err = calc()
            .dispatch(current("divide"), Arguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, XicError::MethodNotFound { .. }));

        let pong = calc().dispatch(current(PING_METHOD), Arguments::new()).await;
        assert!(pong.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_sees_method_name() {
        let echo = echo_servant("Echo");
        let out = echo
            .dispatch(current("anything"), Arguments::new().with("a", 1))
            .await
            .unwrap();
        assert_eq!(out.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_table_metadata() {
        let servant = calc();
        assert!(servant.is_oneway("log"));
        assert!(!servant.is_oneway("add"));
        assert!(!servant.is_oneway("missing"));
        assert!(servant.method("whoami").is_some());
    }
}
