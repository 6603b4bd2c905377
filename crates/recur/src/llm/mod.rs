pub mod anthropic;
pub mod pricing;
pub mod retry;
pub mod types;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::llm::types::{CompletionRequest, CompletionResponse};

/// Callback invoked with each text delta during streaming.
pub type OnText = dyn Fn(&str) + Send + Sync;

/// The provider-facing boundary. One operation: prompt + tool descriptors
/// in, response text + tool calls + usage out. Authentication, retry, and
/// rate limiting live below this line.
///
/// Uses RPITIT (`impl Future`), so the trait is not dyn-compatible;
/// consumers are generic over `P: LlmProvider`. For dynamic dispatch use
/// [`BoxedProvider`].
pub trait LlmProvider: Send + Sync {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, Error>> + Send;

    /// Stream a completion, calling `on_text` for each text delta.
    ///
    /// Only supported when the request carries no tools; the engine
    /// enforces that restriction before calling. Default falls back to
    /// `complete()` with a single final delta.
    fn stream_complete(
        &self,
        request: CompletionRequest,
        on_text: &OnText,
    ) -> impl Future<Output = Result<CompletionResponse, Error>> + Send {
        async move {
            let response = self.complete(request).await?;
            on_text(&response.text);
            Ok(response)
        }
    }

    /// Upstream model identifier, used for cost estimation and events.
    fn model_name(&self) -> Option<&str> {
        None
    }
}

/// Object-safe adapter for [`LlmProvider`], for contexts that need
/// `Arc<dyn …>` storage. A blanket impl covers every provider.
pub trait DynLlmProvider: Send + Sync {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, Error>> + Send + 'a>>;

    fn stream_complete<'a>(
        &'a self,
        request: CompletionRequest,
        on_text: &'a OnText,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, Error>> + Send + 'a>>;

    fn model_name(&self) -> Option<&str>;
}

impl<P: LlmProvider> DynLlmProvider for P {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, Error>> + Send + 'a>> {
        Box::pin(LlmProvider::complete(self, request))
    }

    fn stream_complete<'a>(
        &'a self,
        request: CompletionRequest,
        on_text: &'a OnText,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, Error>> + Send + 'a>> {
        Box::pin(LlmProvider::stream_complete(self, request, on_text))
    }

    fn model_name(&self) -> Option<&str> {
        LlmProvider::model_name(self)
    }
}

/// Type-erased provider. Implements `LlmProvider` itself, so generic code
/// (`Engine<BoxedProvider>`, `AgentRunner<BoxedProvider>`) works unchanged.
pub struct BoxedProvider(Box<dyn DynLlmProvider>);

impl BoxedProvider {
    pub fn new<P: LlmProvider + 'static>(provider: P) -> Self {
        Self(Box::new(provider))
    }

    /// Erase a provider already behind an `Arc` without consuming it.
    pub fn from_arc<P: LlmProvider + 'static>(provider: Arc<P>) -> Self {
        struct ArcAdapter<P>(Arc<P>);

        impl<P: LlmProvider> LlmProvider for ArcAdapter<P> {
            async fn complete(
                &self,
                request: CompletionRequest,
            ) -> Result<CompletionResponse, Error> {
                self.0.complete(request).await
            }

            async fn stream_complete(
                &self,
                request: CompletionRequest,
                on_text: &OnText,
            ) -> Result<CompletionResponse, Error> {
                self.0.stream_complete(request, on_text).await
            }

            fn model_name(&self) -> Option<&str> {
                self.0.model_name()
            }
        }

        Self(Box::new(ArcAdapter(provider)))
    }
}

impl LlmProvider for BoxedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        self.0.complete(request).await
    }

    async fn stream_complete(
        &self,
        request: CompletionRequest,
        on_text: &OnText,
    ) -> Result<CompletionResponse, Error> {
        self.0.stream_complete(request, on_text).await
    }

    fn model_name(&self) -> Option<&str> {
        self.0.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Message, StopReason, TokenUsage};
    use std::sync::Mutex;

    struct FakeProvider;

    impl LlmProvider for FakeProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, Error> {
            Ok(CompletionResponse {
                text: "fake".into(),
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage::default(),
                parsed: None,
            })
        }

        fn model_name(&self) -> Option<&str> {
            Some("fake-model")
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("test")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn boxed_provider_delegates_complete() {
        let provider = BoxedProvider::new(FakeProvider);
        let response = LlmProvider::complete(&provider, request()).await.unwrap();
        assert_eq!(response.text, "fake");
    }

    #[tokio::test]
    async fn default_stream_falls_back_to_complete() {
        let provider = FakeProvider;
        let deltas = Arc::new(Mutex::new(Vec::<String>::new()));
        let deltas_clone = deltas.clone();
        let on_text: &OnText = &move |t: &str| deltas_clone.lock().unwrap().push(t.to_string());
        let response = LlmProvider::stream_complete(&provider, request(), on_text)
            .await
            .unwrap();
        assert_eq!(response.text, "fake");
        assert_eq!(*deltas.lock().unwrap(), vec!["fake"]);
    }

    #[tokio::test]
    async fn boxed_provider_from_arc_shares_provider() {
        let inner = Arc::new(FakeProvider);
        let boxed = BoxedProvider::from_arc(inner.clone());
        let response = LlmProvider::complete(&boxed, request()).await.unwrap();
        assert_eq!(response.text, "fake");
        assert_eq!(LlmProvider::model_name(&boxed), Some("fake-model"));
    }

    #[test]
    fn boxed_provider_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BoxedProvider>();
    }
}
