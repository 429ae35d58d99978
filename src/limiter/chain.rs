use crate::limiter::concurrency_limiter::ConcurrencyLimiter;
use crate::limiter::request_limiter::RequestLimiter;
use crate::limiter::token_limiter::TokenLimiter;
use crate::model::{LimiterKind, Request};

/// One limiter in a [`LimiterChain`], tagged with its [`LimiterKind`] so the
/// chain can compute per-limiter cost and dispatch reconciliation.
enum Limiter {
    Request(LimiterKind, RequestLimiter),
    Token(LimiterKind, TokenLimiter),
    Concurrency(ConcurrencyLimiter),
}

impl Limiter {
    fn kind(&self) -> LimiterKind {
        match self {
            Limiter::Request(kind, _) => *kind,
            Limiter::Token(kind, _) => *kind,
            Limiter::Concurrency(_) => LimiterKind::Concurrent,
        }
    }

    async fn acquire(&self, n: u64) -> bool {
        match self {
            Limiter::Request(_, l) => l.acquire(n).await,
            Limiter::Token(_, l) => l.acquire(n).await,
            Limiter::Concurrency(l) => l.acquire(n).await,
        }
    }

    async fn release(&self, n: u64) {
        match self {
            Limiter::Request(_, l) => l.release(n).await,
            Limiter::Token(_, l) => l.release(n).await,
            Limiter::Concurrency(l) => l.release(n),
        }
    }

    async fn wait_for_slot(&self, n: u64) {
        match self {
            Limiter::Request(_, l) => l.wait_for_slot(n).await,
            Limiter::Token(_, l) => l.wait_for_slot(n).await,
            Limiter::Concurrency(l) => l.wait_for_slot(n).await,
        }
    }

    async fn usage(&self) -> u64 {
        match self {
            Limiter::Request(_, l) => l.usage().await,
            Limiter::Token(_, l) => l.usage().await,
            Limiter::Concurrency(l) => l.usage(),
        }
    }

    async fn available(&self) -> u64 {
        match self {
            Limiter::Request(_, l) => l.available().await,
            Limiter::Token(_, l) => l.available().await,
            Limiter::Concurrency(l) => l.available(),
        }
    }

    fn limit(&self) -> u64 {
        match self {
            Limiter::Request(_, l) => l.limit(),
            Limiter::Token(_, l) => l.limit(),
            Limiter::Concurrency(l) => l.limit(),
        }
    }
}

/// Snapshot of one limiter's state, for [`crate::Registry::queue_info`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct LimiterInfo {
    pub kind: LimiterKind,
    pub usage: u64,
    pub limit: u64,
    pub available: u64,
}

/// Ordered, atomic composition of a model's rate-limit dimensions.
///
/// Acquisition is all-or-nothing: if any limiter in the chain refuses, every
/// limiter already acquired for this call is released in reverse order
/// The chain holds no state of its own beyond the ordered
/// limiter list; serialization is provided by each limiter's own lock plus
/// the fact that a model has exactly one worker.
pub struct LimiterChain {
    limiters: Vec<Limiter>,
}

/// Per-kind token cost for a request.
fn cost_for<P>(kind: LimiterKind, request: &Request<P>) -> u64 {
    let est_in = request.estimated_input_tokens.unwrap_or(0);
    let est_out = request.estimated_output_tokens.unwrap_or(0);
    match kind {
        LimiterKind::Rpm | LimiterKind::Rpd | LimiterKind::Concurrent => 1,
        LimiterKind::Tpm | LimiterKind::Tpd => est_in + est_out,
        LimiterKind::Itpm => est_in,
        LimiterKind::Otpm => est_out,
    }
}

impl LimiterChain {
    /// Build a chain from validated configs. Callers should run
    /// [`crate::ModelConfig::validate`] first; this constructor does not
    /// re-validate limits/periods.
    pub fn from_configs(configs: &[crate::config::LimiterConfig]) -> Self {
        let limiters = configs
            .iter()
            .map(|cfg| {
                let period_secs = cfg.resolved_period_secs().unwrap_or(0);
                let period = std::time::Duration::from_secs(period_secs);
                match cfg.kind {
                    LimiterKind::Concurrent => Limiter::Concurrency(ConcurrencyLimiter::new(cfg.limit)),
                    LimiterKind::Rpm | LimiterKind::Rpd => {
                        Limiter::Request(cfg.kind, RequestLimiter::new(cfg.limit, period))
                    }
                    LimiterKind::Tpm | LimiterKind::Tpd | LimiterKind::Itpm | LimiterKind::Otpm => {
                        Limiter::Token(cfg.kind, TokenLimiter::new(cfg.limit, period))
                    }
                }
            })
            .collect();
        Self { limiters }
    }

    /// Iterate limiters in order, acquiring each with its computed cost. If
    /// any refuses, release in reverse order every limiter already acquired
    /// and return `false`.
    pub async fn acquire_all<P>(&self, request: &Request<P>) -> bool {
        let mut acquired: Vec<(&Limiter, u64)> = Vec::with_capacity(self.limiters.len());

        for limiter in &self.limiters {
            let n = cost_for(limiter.kind(), request);
            if limiter.acquire(n).await {
                acquired.push((limiter, n));
            } else {
                for (limiter, n) in acquired.into_iter().rev() {
                    limiter.release(n).await;
                }
                return false;
            }
        }
        true
    }

    /// Release only `Concurrent` limiters — time-window limiters must not
    /// be refunded on the processor's success path. Cost for
    /// `Concurrent` is always 1, so no request is needed to compute it.
    pub async fn release_all(&self) {
        for limiter in &self.limiters {
            if limiter.kind() == LimiterKind::Concurrent {
                limiter.release(1).await;
            }
        }
    }

    /// Iterate limiters in order, waiting for each in turn. The fixed order
    /// prevents deadlock between concurrent requests on the same model.
    pub async fn wait_all<P>(&self, request: &Request<P>) {
        for limiter in &self.limiters {
            let n = cost_for(limiter.kind(), request);
            limiter.wait_for_slot(n).await;
        }
    }

    /// For each token-kind limiter, compute `est`/`actual` per the cost
    /// table and delegate to [`TokenLimiter::reconcile`]; other kinds are
    /// untouched.
    pub async fn reconcile(&self, est_input: u64, est_output: u64, actual_input: u64, actual_output: u64) {
        for limiter in &self.limiters {
            let (est, actual) = match limiter.kind() {
                LimiterKind::Tpm | LimiterKind::Tpd => {
                    (est_input + est_output, actual_input + actual_output)
                }
                LimiterKind::Itpm => (est_input, actual_input),
                LimiterKind::Otpm => (est_output, actual_output),
                _ => continue,
            };
            if let Limiter::Token(_, token_limiter) = limiter {
                token_limiter.reconcile(est, actual).await;
            }
        }
    }

    /// Current in-flight usage of this chain's `Concurrent` limiter, if it
    /// has one. Synchronous — `ConcurrencyLimiter::usage` never locks —
    /// so this is cheap enough to call on every admission/completion for
    /// the `reqwise_concurrency_in_use` gauge.
    pub fn concurrency_usage(&self) -> Option<u64> {
        self.limiters.iter().find_map(|l| match l {
            Limiter::Concurrency(c) => Some(c.usage()),
            _ => None,
        })
    }

    /// Snapshot every limiter's usage/limit/available, in chain order.
    pub async fn snapshot(&self) -> Vec<LimiterInfo> {
        let mut out = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            out.push(LimiterInfo {
                kind: limiter.kind(),
                usage: limiter.usage().await,
                limit: limiter.limit(),
                available: limiter.available().await,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;

    fn request(est_in: u64, est_out: u64) -> Request<()> {
        Request::new("m", ()).estimated_tokens(Some(est_in), Some(est_out))
    }

    #[tokio::test]
    async fn rollback_on_refusal_restores_prior_usage() {
        let chain = LimiterChain::from_configs(&[
            LimiterConfig::new(LimiterKind::Rpm, 10).with_period(60),
            LimiterConfig::new(LimiterKind::Tpm, 60).with_period(60),
        ]);

        assert!(chain.acquire_all(&request(50, 0)).await);
        let before = chain.snapshot().await;

        assert!(!chain.acquire_all(&request(50, 0)).await);
        let after = chain.snapshot().await;

        assert_eq!(before[0].usage, after[0].usage);
        assert_eq!(before[1].usage, after[1].usage);
        assert_eq!(after[0].usage, 1);
        assert_eq!(after[1].usage, 50);
    }

    #[tokio::test]
    async fn release_all_only_touches_concurrency() {
        let chain = LimiterChain::from_configs(&[
            LimiterConfig::new(LimiterKind::Rpm, 10).with_period(60),
            LimiterConfig::new(LimiterKind::Concurrent, 5),
        ]);

        let req = request(0, 0);
        assert!(chain.acquire_all(&req).await);
        chain.release_all().await;

        let snap = chain.snapshot().await;
        assert_eq!(snap[0].usage, 1); // RPM not refunded
        assert_eq!(snap[1].usage, 0); // concurrency refunded
    }

    #[tokio::test]
    async fn reconcile_only_adjusts_token_limiters() {
        let chain = LimiterChain::from_configs(&[
            LimiterConfig::new(LimiterKind::Rpm, 10).with_period(60),
            LimiterConfig::new(LimiterKind::Tpm, 100).with_period(60),
        ]);

        let req = request(80, 0);
        assert!(chain.acquire_all(&req).await);
        chain.reconcile(80, 0, 50, 0).await;

        let snap = chain.snapshot().await;
        assert_eq!(snap[0].usage, 1);
        assert_eq!(snap[1].usage, 50);
    }
}
