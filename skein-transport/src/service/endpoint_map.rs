//! Endpoint map: method name → request handler.
//!
//! Built before the host is constructed; the host never adds endpoints at
//! runtime.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use serde_json::{Map, Value};

use super::ServiceFault;
use crate::envelope::Deprecation;
use crate::rpc::RequestContext;

/// Future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, ServiceFault>>>>;

/// Request handler: receives the inbound context and the call arguments.
pub type Handler = Rc<dyn Fn(RequestContext, Map<String, Value>) -> HandlerFuture>;

/// One registered endpoint.
#[derive(Clone)]
pub struct Endpoint {
    /// The handler.
    pub handler: Handler,
    /// Set when the endpoint is deprecated; merged into every response.
    pub deprecation: Option<Deprecation>,
}

/// Handlers of a service keyed by endpoint name.
#[derive(Clone, Default)]
pub struct EndpointMap {
    endpoints: HashMap<String, Endpoint>,
}

impl EndpointMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`, replacing any previous handler.
    pub fn insert<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(RequestContext, Map<String, Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Value, ServiceFault>> + 'static,
    {
        self.insert_entry(name, handler, None)
    }

    /// Register a deprecated endpoint. Responses carry a deprecation notice
    /// naming `replacement` when given.
    pub fn insert_deprecated<F, Fut>(
        &mut self,
        name: &str,
        replacement: Option<&str>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(RequestContext, Map<String, Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Value, ServiceFault>> + 'static,
    {
        let mut deprecation = Deprecation::new(name);
        if let Some(replacement) = replacement {
            deprecation = deprecation.with_replacement(replacement);
        }
        self.insert_entry(name, handler, Some(deprecation))
    }

    fn insert_entry<F, Fut>(
        &mut self,
        name: &str,
        handler: F,
        deprecation: Option<Deprecation>,
    ) -> &mut Self
    where
        F: Fn(RequestContext, Map<String, Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Value, ServiceFault>> + 'static,
    {
        let handler: Handler = Rc::new(
            move |context: RequestContext, args: Map<String, Value>| -> HandlerFuture {
                Box::pin(handler(context, args))
            },
        );
        self.endpoints.insert(
            name.to_string(),
            Endpoint {
                handler,
                deprecation,
            },
        );
        self
    }

    /// Look up an endpoint.
    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name)
    }

    /// Registered endpoint names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.endpoints.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// True when no endpoint is registered.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_call() {
        let mut map = EndpointMap::new();
        map.insert("add", |_context, args| async move {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or_default();
            let b = args.get("b").and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(a + b))
        })
        .insert("fail", |_context, _args| async move {
            Err(ServiceFault::unhandled("boom"))
        });

        assert_eq!(map.names(), vec!["add", "fail"]);
        let endpoint = map.get("add").expect("registered");
        assert!(endpoint.deprecation.is_none());

        let mut args = Map::new();
        args.insert("a".into(), json!(2));
        args.insert("b".into(), json!(3));
        let result = (endpoint.handler)(RequestContext::new(), args).await;
        assert_eq!(result, Ok(json!(5)));

        let endpoint = map.get("fail").expect("registered");
        let result = (endpoint.handler)(RequestContext::new(), Map::new()).await;
        assert_eq!(result, Err(ServiceFault::Unhandled("boom".into())));
        assert!(map.get("missing").is_none());
    }

    #[test]
    fn test_deprecated_endpoint() {
        let mut map = EndpointMap::new();
        map.insert_deprecated("divide", Some("div"), |_context, _args| async move {
            Ok(Value::Null)
        });
        let deprecation = map
            .get("divide")
            .and_then(|endpoint| endpoint.deprecation.clone())
            .expect("deprecated");
        assert_eq!(deprecation, Deprecation::new("divide").with_replacement("div"));
        assert_eq!(map.len(), 1);
    }
}
