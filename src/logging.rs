use crate::LOG;

/// Request logging through the app's slog drain instead of tide's
/// bundled logger.
pub struct LogMiddleware;

impl LogMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(&self, req: tide::Request<State>, next: tide::Next<'_, State>) -> tide::Result {
        let method = req.method().to_string();
        let path = req.url().path().to_string();
        let start = std::time::Instant::now();
        let resp = next.run(req).await;
        slog::info!(
            LOG, "request";
            "method" => method,
            "path" => path,
            "status" => u16::from(resp.status()),
            "duration_ms" => start.elapsed().as_millis() as u64,
        );
        Ok(resp)
    }
}
