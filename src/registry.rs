use std::sync::Arc;

use dashmap::DashMap;

use crate::config::ModelConfig;
use crate::error::EngineError;
use crate::limiter::LimiterChain;
use crate::limiter::LimiterInfo;
use crate::model::{Request, Response};
use crate::queue::{ModelQueue, Processor};

/// Per-model summary returned by [`Registry::queue_info`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueInfo {
    pub model_id: String,
    pub queue_size: usize,
    pub rate_limiter_usage: u64,
    pub rate_limiters: Vec<LimiterInfo>,
}

/// Process-wide map from `model_id` to [`ModelQueue`].
///
/// Routes submissions, exposes introspection, orchestrates drain. An
/// explicit value, not a hidden global — a caller who wants a
/// process-scoped singleton wraps this in their own `Arc`/`OnceLock`.
pub struct Registry<P, T> {
    queues: DashMap<String, Arc<ModelQueue<P, T>>>,
}

impl<P, T> Default for Registry<P, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, T> Registry<P, T>
where
    P: Send + 'static,
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Validate `config`, build its limiter chain, and start a worker for
    /// it. Fails with [`EngineError::AlreadyRegistered`] if `model_id` is
    /// already present. Registration is eager: the queue's worker begins
    /// immediately.
    pub fn register<F, Fut>(&self, config: ModelConfig, processor: F) -> Result<(), EngineError>
    where
        F: Fn(Request<P>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<crate::queue::ProcessorOutcome<T>, String>> + Send + 'static,
    {
        if self.queues.contains_key(&config.model_id) {
            return Err(EngineError::AlreadyRegistered(config.model_id));
        }
        config.validate()?;

        let model_id = config.model_id.clone();
        let chain = LimiterChain::from_configs(&config.rate_limiters);
        let processor: Arc<dyn Processor<P, T>> = Arc::new(processor);
        let queue = ModelQueue::new(model_id.clone(), chain, processor);

        self.queues.insert(model_id.clone(), Arc::new(queue));
        tracing::info!("registry: registered model, model_id={}", model_id);
        Ok(())
    }

    /// Register several models at once, skipping any that are already
    /// registered (rather than failing the whole batch).
    pub fn register_all<F, Fut>(&self, configs: Vec<ModelConfig>, processor: F) -> Result<(), EngineError>
    where
        F: Fn(Request<P>) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<crate::queue::ProcessorOutcome<T>, String>> + Send + 'static,
    {
        for config in configs {
            let model_id = config.model_id.clone();
            match self.register(config, processor.clone()) {
                Ok(()) | Err(EngineError::AlreadyRegistered(_)) => {}
                Err(e) => {
                    tracing::warn!("registry: register_all: model {} failed: {}", model_id, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Dispatch to the named queue. If `request.wait_for_completion` is
    /// `true`, returns the terminal [`Response`]; otherwise returns a
    /// `Pending` response immediately.
    pub async fn submit(&self, request: Request<P>) -> Result<Response<T>, EngineError> {
        let queue = self.queue_for(&request.model_id)?;
        Ok(queue.enqueue(request).await)
    }

    /// Silent no-op if the request is unknown or purged from history.
    pub async fn update_token_usage(
        &self,
        model_id: &str,
        request_id: &str,
        actual_in: u64,
        actual_out: u64,
    ) -> Result<(), EngineError> {
        let queue = self.queue_for(model_id)?;
        queue.update_token_usage(request_id, actual_in, actual_out).await;
        Ok(())
    }

    pub fn get_status(&self, model_id: &str, request_id: &str) -> Result<Option<Response<T>>, EngineError> {
        let queue = self.queue_for(model_id)?;
        Ok(queue.get_status(request_id))
    }

    pub fn list_models(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn queue_info(&self, model_id: &str) -> Result<QueueInfo, EngineError> {
        let queue = self.queue_for(model_id)?;
        let rate_limiters = queue.limiter_snapshot().await;
        let rate_limiter_usage = rate_limiters.first().map(|l| l.usage).unwrap_or(0);

        Ok(QueueInfo {
            model_id: model_id.to_string(),
            queue_size: queue.queue_size(),
            rate_limiter_usage,
            rate_limiters,
        })
    }

    /// Drain and stop every queue, then clear the registry. A subsequent
    /// `register` with a previously-used `model_id` succeeds.
    pub async fn shutdown_all(&self) {
        let queues: Vec<Arc<ModelQueue<P, T>>> = self.queues.iter().map(|e| e.value().clone()).collect();
        for queue in queues {
            queue.shutdown().await;
        }
        self.queues.clear();
        tracing::info!("registry: shutdown_all complete");
    }

    fn queue_for(&self, model_id: &str) -> Result<Arc<ModelQueue<P, T>>, EngineError> {
        self.queues
            .get(model_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::ModelNotRegistered(model_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;
    use crate::model::LimiterKind;
    use crate::queue::ProcessorOutcome;

    async fn echo(request: Request<i32>) -> Result<ProcessorOutcome<i32>, String> {
        Ok(ProcessorOutcome::new(request.params))
    }

    #[tokio::test]
    async fn register_then_submit_then_shutdown() {
        let registry: Registry<i32, i32> = Registry::new();
        let config = ModelConfig::new("gpt", vec![LimiterConfig::new(LimiterKind::Rpm, 5)]);
        registry.register(config, echo).unwrap();

        let response = registry
            .submit(Request::new("gpt", 42))
            .await
            .unwrap();
        assert_eq!(response.result, Some(42));

        registry.shutdown_all().await;
        assert!(registry.list_models().is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry: Registry<i32, i32> = Registry::new();
        let config = ModelConfig::new("gpt", vec![LimiterConfig::new(LimiterKind::Rpm, 5)]);
        registry.register(config.clone(), echo).unwrap();
        let err = registry.register(config, echo).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn unregistered_model_is_rejected() {
        let registry: Registry<i32, i32> = Registry::new();
        let err = registry.submit(Request::new("missing", 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelNotRegistered(_)));
    }

    #[tokio::test]
    async fn register_after_shutdown_succeeds() {
        let registry: Registry<i32, i32> = Registry::new();
        let config = ModelConfig::new("gpt", vec![LimiterConfig::new(LimiterKind::Rpm, 5)]);
        registry.register(config.clone(), echo).unwrap();
        registry.shutdown_all().await;
        registry.register(config, echo).unwrap();
    }
}
