//! Message interceptors applied by the session pump.

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use crate::converter::{ConverterPipeline, NestedVariables};
use crate::protocol::ProtocolMessage;
use crate::variables::variables_from_body;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToDebugger,
    DebuggerToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ClientToDebugger => "client->debugger",
            Self::DebuggerToClient => "debugger->client",
        })
    }
}

/// Offered every frame travelling in `direction()`, in registration order.
///
/// Returning `None` swallows the frame.
pub trait DapInterceptor: Send + Sync {
    fn direction(&self) -> Direction;

    fn intercept<'a>(
        &'a self,
        message: ProtocolMessage,
        nested: &'a dyn NestedVariables,
    ) -> BoxFuture<'a, Option<ProtocolMessage>>;
}

/// Rewrites the client's `attach` request.
///
/// Overrides are merged into `arguments` (replacing existing keys). With
/// `rename_to`, the command is renamed as well, e.g. `attach` → `launch`.
#[derive(Debug, Clone, Default)]
pub struct AttachRequestInterceptor {
    overrides: Map<String, Value>,
    rename_to: Option<String>,
}

impl AttachRequestInterceptor {
    #[must_use]
    pub fn new(overrides: Map<String, Value>) -> Self {
        Self {
            overrides,
            rename_to: None,
        }
    }

    #[must_use]
    pub fn process_id(pid: u32) -> Self {
        let mut overrides = Map::new();
        overrides.insert("processId".into(), Value::from(pid));
        Self::new(overrides)
    }

    #[must_use]
    pub fn rename_to(mut self, command: impl Into<String>) -> Self {
        self.rename_to = Some(command.into());
        self
    }
}

impl DapInterceptor for AttachRequestInterceptor {
    fn direction(&self) -> Direction {
        Direction::ClientToDebugger
    }

    fn intercept<'a>(
        &'a self,
        mut message: ProtocolMessage,
        _nested: &'a dyn NestedVariables,
    ) -> BoxFuture<'a, Option<ProtocolMessage>> {
        Box::pin(async move {
            if let ProtocolMessage::Request(request) = &mut message
                && request.command == "attach"
            {
                let mut arguments = match request.arguments.take() {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                for (key, value) in &self.overrides {
                    arguments.insert(key.clone(), value.clone());
                }
                request.arguments = Some(Value::Object(arguments));
                if let Some(command) = &self.rename_to {
                    request.command.clone_from(command);
                }
                tracing::debug!(command = %request.command, "Rewrote attach request");
            }
            Some(message)
        })
    }
}

/// Runs the converter pipeline over successful `variables` responses.
#[derive(Debug, Clone)]
pub struct VariablesInterceptor {
    pipeline: ConverterPipeline,
}

impl VariablesInterceptor {
    #[must_use]
    pub fn new(pipeline: ConverterPipeline) -> Self {
        Self { pipeline }
    }
}

impl DapInterceptor for VariablesInterceptor {
    fn direction(&self) -> Direction {
        Direction::DebuggerToClient
    }

    fn intercept<'a>(
        &'a self,
        mut message: ProtocolMessage,
        nested: &'a dyn NestedVariables,
    ) -> BoxFuture<'a, Option<ProtocolMessage>> {
        Box::pin(async move {
            let ProtocolMessage::Response(response) = &mut message else {
                return Some(message);
            };
            if !response.success || response.command != "variables" || self.pipeline.is_empty() {
                return Some(message);
            }
            let Some(body) = response.body.as_mut() else {
                return Some(message);
            };

            let variables = match variables_from_body(body) {
                Ok(variables) => variables,
                Err(e) => {
                    tracing::warn!("Unparseable variables response, forwarding as-is: {e}");
                    return Some(message);
                }
            };
            let converted = self.pipeline.apply_all(variables, nested).await;
            match serde_json::to_value(converted) {
                Ok(list) => {
                    body["variables"] = list;
                }
                Err(e) => tracing::warn!("Failed to re-encode converted variables: {e}"),
            }
            Some(message)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::converter::ConversionError;
    use crate::protocol::{Request, Response};
    use crate::variables::Variable;

    struct NoNested;

    impl NestedVariables for NoNested {
        fn variables(&self, _: i64) -> BoxFuture<'_, Result<Vec<Variable>, ConversionError>> {
            Box::pin(async { Err(ConversionError::Nested("unavailable".into())) })
        }
    }

    #[tokio::test]
    async fn attach_overrides_merge_and_rename() {
        let interceptor = AttachRequestInterceptor::process_id(4242).rename_to("attach");
        let request = ProtocolMessage::Request(Request::new(
            1,
            "attach",
            Some(json!({"processId": 1, "justMyCode": false})),
        ));

        let Some(ProtocolMessage::Request(out)) = interceptor.intercept(request, &NoNested).await
        else {
            panic!("expected request");
        };
        assert_eq!(out.arguments, Some(json!({"processId": 4242, "justMyCode": false})));

        let launch = AttachRequestInterceptor::new(Map::from_iter([(
            "program".to_string(),
            json!("/app/App.dll"),
        )]))
        .rename_to("launch");
        let request = ProtocolMessage::Request(Request::new(2, "attach", None));
        let Some(ProtocolMessage::Request(out)) = launch.intercept(request, &NoNested).await else {
            panic!("expected request");
        };
        assert_eq!(out.command, "launch");
        assert_eq!(out.arguments, Some(json!({"program": "/app/App.dll"})));
    }

    #[tokio::test]
    async fn other_requests_untouched() {
        let interceptor = AttachRequestInterceptor::process_id(1);
        let request = ProtocolMessage::Request(Request::new(3, "threads", None));
        let out = interceptor.intercept(request.clone(), &NoNested).await;
        assert_eq!(out, Some(request));
    }

    #[tokio::test]
    async fn failed_variables_response_passes_through() {
        let interceptor = VariablesInterceptor::new(ConverterPipeline::with_defaults());
        let response = ProtocolMessage::Response(Response {
            seq: 4,
            request_seq: 3,
            success: false,
            command: "variables".into(),
            message: Some("invalid reference".into()),
            body: None,
            additional_properties: Map::new(),
        });
        assert_eq!(
            interceptor.intercept(response.clone(), &NoNested).await,
            Some(response)
        );
    }
}
