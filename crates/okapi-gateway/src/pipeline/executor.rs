//! Pipeline execution: run the resolved steps against live backends.
//!
//! Steps run strictly in order.  A pre/auth filter answering outside
//! 2xx/3xx short-circuits the remaining pre/auth steps and the handler,
//! but `post` filters always run — they observe failures too — and can
//! never change the response already produced.  Every invoked step leaves
//! an entry in the context trace with its elapsed time.

use okapi_kernel::{
    Discovery, GatewayError, GatewayResult, ModuleInvoker, Phase, ProxyContext, ProxyResponse,
    RoutingType, headers,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Pipeline, PipelineStep};

/// Header added to `post`-filter invocations carrying the status the
/// pipeline produced, so logging filters can record the outcome.
pub const HANDLER_RESULT_HEADER: &str = "x-okapi-handler-result";

/// Tunables for one executor instance.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-step wall-clock budget.  An overrun maps to `BadGateway`.
    pub step_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs a [`Pipeline`] for one request.  Borrows the collaborators; the
/// server builds one per request.
pub struct PipelineExecutor<'a> {
    discovery: &'a dyn Discovery,
    invoker: &'a dyn ModuleInvoker,
    config: ExecutorConfig,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(
        discovery: &'a dyn Discovery,
        invoker: &'a dyn ModuleInvoker,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            discovery,
            invoker,
            config,
        }
    }

    /// Execute the pipeline.  On success the returned response is the
    /// handler's (or a short-circuiting filter's).  On `Err` the trace in
    /// `ctx` still covers every step that ran.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        ctx: &mut ProxyContext,
    ) -> GatewayResult<ProxyResponse> {
        let mut produced: Option<ProxyResponse> = None;
        let mut fatal: Option<GatewayError> = None;
        let mut short_circuited = false;

        for step in &pipeline.steps {
            let is_post = step.phase() == Some(Phase::Post);
            if (short_circuited || fatal.is_some()) && !is_post {
                continue;
            }

            if is_post {
                self.run_post_step(step, ctx, &mut produced, &fatal).await;
                continue;
            }

            match self.run_step(step, pipeline, ctx).await {
                Ok(resp) => {
                    if step.entry.is_handler() {
                        produced = Some(resp);
                    } else if !resp.is_ok() {
                        // Failing pre/auth filter answers the request itself.
                        produced = Some(resp);
                        short_circuited = true;
                    } else {
                        self.absorb_filter_response(step, resp, ctx);
                    }
                }
                Err(e) => {
                    warn!(
                        request = %ctx.request.id,
                        module = %step.module_id,
                        error = %e,
                        "pipeline step failed"
                    );
                    fatal = Some(e);
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        produced.ok_or_else(|| {
            GatewayError::Internal("pipeline finished without a response".to_string())
        })
    }

    /// Invoke one pre/auth/handler step, with discovery, timeout, and
    /// trace accounting.
    async fn run_step(
        &self,
        step: &PipelineStep,
        pipeline: &Pipeline,
        ctx: &mut ProxyContext,
    ) -> GatewayResult<ProxyResponse> {
        let address = self.discovery.lookup(&step.module_id).await?;
        let path = if step.entry.is_handler() {
            rejoin_query(&pipeline.handler_path, &ctx.request.path)
        } else {
            ctx.request.path.clone()
        };
        let hdrs = forward_headers(&ctx.request.headers);
        // `headers`-typed filters see no body at all.
        let body: &[u8] = if step.entry.entry_type == RoutingType::Headers {
            &[]
        } else {
            &ctx.request.body
        };

        let started = Instant::now();
        let invocation = self
            .invoker
            .invoke(&address, ctx.request.method, &path, &hdrs, body);
        let resp = match tokio::time::timeout(self.config.step_timeout, invocation).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::BadGateway(format!(
                    "module '{}' timed out after {}ms",
                    step.module_id,
                    self.config.step_timeout.as_millis()
                )));
            }
        };
        let note = format!("{}us", started.elapsed().as_micros());
        ctx.add_trace(&step.module_id, resp.status, Some(&note));
        debug!(
            request = %ctx.request.id,
            module = %step.module_id,
            status = resp.status,
            "step completed"
        );
        Ok(resp)
    }

    /// Fold a successful pre/auth filter response back into the flowing
    /// request, according to the entry type.  `request-response` filters
    /// replace both headers and body; `headers` filters contribute headers
    /// only; `request-only` responses are discarded.
    fn absorb_filter_response(
        &self,
        step: &PipelineStep,
        resp: ProxyResponse,
        ctx: &mut ProxyContext,
    ) {
        if step.entry.entry_type == RoutingType::RequestOnly {
            return;
        }
        for (k, v) in resp.headers {
            if is_hop_by_hop(&k) {
                continue;
            }
            ctx.request.headers.insert(k, v);
        }
        if step.entry.entry_type != RoutingType::Headers {
            ctx.request.body = resp.body;
        }
    }

    /// Post filters observe the request (full body unless `headers`-typed)
    /// plus the pipeline's status in [`HANDLER_RESULT_HEADER`].  Their
    /// response may contribute headers the earlier steps left unset, but
    /// can never change the status, the body, or a header already present.
    /// Infrastructure failures and error statuses are logged, never fatal.
    async fn run_post_step(
        &self,
        step: &PipelineStep,
        ctx: &mut ProxyContext,
        produced: &mut Option<ProxyResponse>,
        fatal: &Option<GatewayError>,
    ) {
        let address = match self.discovery.lookup(&step.module_id).await {
            Ok(a) => a,
            Err(e) => {
                warn!(
                    request = %ctx.request.id,
                    module = %step.module_id,
                    error = %e,
                    "post filter unreachable"
                );
                return;
            }
        };
        let mut hdrs = forward_headers(&ctx.request.headers);
        let outcome = match (produced.as_ref(), fatal) {
            (Some(r), _) => r.status,
            (None, Some(_)) => 502,
            (None, None) => 404,
        };
        hdrs.insert(HANDLER_RESULT_HEADER.to_string(), outcome.to_string());
        let body: &[u8] = if step.entry.entry_type == RoutingType::Headers {
            &[]
        } else {
            &ctx.request.body
        };

        let started = Instant::now();
        let invocation =
            self.invoker
                .invoke(&address, ctx.request.method, &ctx.request.path, &hdrs, body);
        match tokio::time::timeout(self.config.step_timeout, invocation).await {
            Ok(Ok(resp)) => {
                let note = format!("{}us", started.elapsed().as_micros());
                ctx.add_trace(&step.module_id, resp.status, Some(&note));
                if let Some(out) = produced {
                    for (k, v) in resp.headers {
                        if is_hop_by_hop(&k) || out.headers.contains_key(&k) {
                            continue;
                        }
                        out.headers.insert(k, v);
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(
                    request = %ctx.request.id,
                    module = %step.module_id,
                    error = %e,
                    "post filter failed"
                );
            }
            Err(_) => {
                warn!(
                    request = %ctx.request.id,
                    module = %step.module_id,
                    "post filter timed out"
                );
            }
        }
    }
}

/// Headers forwarded to backends: everything the request carries except
/// the module selector, which is consumed by the gateway.
fn forward_headers(request_headers: &HashMap<String, String>) -> HashMap<String, String> {
    request_headers
        .iter()
        .filter(|(k, _)| k.as_str() != headers::MODULE_ID)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Headers that never propagate between steps: transport-level fields and
/// the gateway's own trace.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(name, "content-length" | "transfer-encoding" | "connection") || name == headers::TRACE
}

/// Re-attach the original query string to a (possibly rewritten) route path.
fn rejoin_query(route_path: &str, original: &str) -> String {
    match original.split_once('?') {
        Some((_, q)) => format!("{route_path}?{q}"),
        None => route_path.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use okapi_kernel::{HttpMethod, ProxyRequest, RoutingEntry};
    use std::sync::Mutex;

    struct StaticDiscovery;

    #[async_trait]
    impl Discovery for StaticDiscovery {
        async fn lookup(&self, module_id: &str) -> GatewayResult<String> {
            if module_id.starts_with("lost-") {
                return Err(GatewayError::BadGateway(format!(
                    "no deployment for '{module_id}'"
                )));
            }
            Ok(format!("http://backend/{module_id}"))
        }
    }

    /// Answers per-address from a script; records what it was asked.
    struct ScriptedInvoker {
        responses: HashMap<String, ProxyResponse>,
        delay: Option<Duration>,
        calls: Mutex<Vec<(String, String, HashMap<String, String>, Vec<u8>)>>,
    }

    impl ScriptedInvoker {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
                delay: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn respond(mut self, module_id: &str, resp: ProxyResponse) -> Self {
            self.responses
                .insert(format!("http://backend/{module_id}"), resp);
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> Vec<(String, String, HashMap<String, String>, Vec<u8>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModuleInvoker for ScriptedInvoker {
        async fn invoke(
            &self,
            address: &str,
            _method: HttpMethod,
            path: &str,
            headers: &HashMap<String, String>,
            body: &[u8],
        ) -> GatewayResult<ProxyResponse> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.calls.lock().unwrap().push((
                address.to_string(),
                path.to_string(),
                headers.clone(),
                body.to_vec(),
            ));
            Ok(self
                .responses
                .get(address)
                .cloned()
                .unwrap_or_else(|| ProxyResponse::new(200)))
        }
    }

    fn handler_step(module_id: &str) -> PipelineStep {
        PipelineStep::new(
            module_id,
            RoutingEntry {
                methods: vec!["*".into()],
                path: Some("/testb".into()),
                permissions_required: Some(vec![]),
                ..Default::default()
            },
        )
    }

    fn filter_step(module_id: &str, phase: Phase, entry_type: RoutingType) -> PipelineStep {
        PipelineStep::new(
            module_id,
            RoutingEntry {
                methods: vec!["*".into()],
                path: Some("/".into()),
                phase: Some(phase),
                entry_type,
                ..Default::default()
            },
        )
    }

    fn pipeline(steps: Vec<PipelineStep>) -> Pipeline {
        Pipeline {
            steps,
            handler_path: "/testb".into(),
        }
    }

    fn ctx() -> ProxyContext {
        ProxyContext::new(
            ProxyRequest::new("r1", "roskilde", HttpMethod::Get, "/testb")
                .with_header(headers::TENANT, "roskilde"),
        )
    }

    #[tokio::test]
    async fn handler_only_pipeline() {
        let inv = ScriptedInvoker::new()
            .respond("sample-1.0.0", ProxyResponse::new(200).with_body(b"hi".to_vec()));
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        let resp = exec
            .execute(&pipeline(vec![handler_step("sample-1.0.0")]), &mut ctx)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hi");
        assert_eq!(ctx.trace.len(), 1);
        assert!(ctx.trace[0].starts_with("GET sample-1.0.0 200"));
    }

    #[tokio::test]
    async fn failing_auth_short_circuits_handler_but_not_post() {
        let inv = ScriptedInvoker::new()
            .respond("auth-1.0.0", ProxyResponse::new(401).with_body(b"denied".to_vec()));
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        let resp = exec
            .execute(
                &pipeline(vec![
                    filter_step("auth-1.0.0", Phase::Auth, RoutingType::Headers),
                    handler_step("sample-1.0.0"),
                    filter_step("post-1.0.0", Phase::Post, RoutingType::RequestOnly),
                ]),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 401);
        assert_eq!(resp.body, b"denied");
        // Handler never invoked; auth and post both traced.
        let traced: Vec<&str> = ctx.trace.iter().map(|t| t.as_str()).collect();
        assert_eq!(traced.len(), 2);
        assert!(traced[0].starts_with("GET auth-1.0.0 401"));
        assert!(traced[1].starts_with("GET post-1.0.0 200"));
        // Post filter saw the pipeline's outcome.
        let calls = inv.calls();
        let post_call = calls.last().unwrap();
        assert_eq!(post_call.2.get(HANDLER_RESULT_HEADER).unwrap(), "401");
    }

    #[tokio::test]
    async fn request_response_pre_filter_rewrites_body_and_headers() {
        // A request-response pre filter's answer becomes the flowing
        // request state: the handler must see both the rewritten body and
        // any header the filter derived.
        let inv = ScriptedInvoker::new().respond(
            "pre-1.0.0",
            ProxyResponse::new(200)
                .with_header("x-derived", "from-pre")
                .with_body(b"rewritten".to_vec()),
        );
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        ctx.request.body = b"original".to_vec();
        let resp = exec
            .execute(
                &pipeline(vec![
                    filter_step("pre-1.0.0", Phase::Pre, RoutingType::RequestResponse),
                    handler_step("sample-1.0.0"),
                ]),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        let calls = inv.calls();
        assert_eq!(calls[1].3, b"rewritten");
        assert_eq!(calls[1].2.get("x-derived").map(String::as_str), Some("from-pre"));
    }

    #[tokio::test]
    async fn request_only_post_filter_observes_request_body() {
        let inv = ScriptedInvoker::new();
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        ctx.request.body = b"payload".to_vec();
        exec.execute(
            &pipeline(vec![
                handler_step("sample-1.0.0"),
                filter_step("audit-1.0.0", Phase::Post, RoutingType::RequestOnly),
                filter_step("log-1.0.0", Phase::Post, RoutingType::Headers),
            ]),
            &mut ctx,
        )
        .await
        .unwrap();
        let calls = inv.calls();
        // request-only post filters see the request body; headers-typed
        // ones still get none.
        assert_eq!(calls[1].3, b"payload");
        assert!(calls[2].3.is_empty());
    }

    #[tokio::test]
    async fn post_filter_contributes_only_unset_headers() {
        let inv = ScriptedInvoker::new()
            .respond(
                "sample-1.0.0",
                ProxyResponse::new(200).with_header("content-type", "text/plain"),
            )
            .respond(
                "post-1.0.0",
                ProxyResponse::new(200)
                    .with_header("x-audit-id", "a1")
                    .with_header("content-type", "application/json"),
            );
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        let resp = exec
            .execute(
                &pipeline(vec![
                    handler_step("sample-1.0.0"),
                    filter_step("post-1.0.0", Phase::Post, RoutingType::RequestOnly),
                ]),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        // New header merged in, handler's own header untouched.
        assert_eq!(resp.headers.get("x-audit-id").map(String::as_str), Some("a1"));
        assert_eq!(
            resp.headers.get("content-type").map(String::as_str),
            Some("text/plain")
        );
    }

    #[tokio::test]
    async fn headers_filter_merges_into_request() {
        let inv = ScriptedInvoker::new().respond(
            "auth-1.0.0",
            ProxyResponse::new(200).with_header(headers::TOKEN, "tok-42"),
        );
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        ctx.request.body = b"payload".to_vec();
        let resp = exec
            .execute(
                &pipeline(vec![
                    filter_step("auth-1.0.0", Phase::Auth, RoutingType::Headers),
                    handler_step("sample-1.0.0"),
                ]),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        let calls = inv.calls();
        // Headers filter gets no body; handler gets the original one plus
        // the token the filter supplied.
        assert!(calls[0].3.is_empty());
        assert_eq!(calls[1].3, b"payload");
        assert_eq!(calls[1].2.get(headers::TOKEN).unwrap(), "tok-42");
    }

    #[tokio::test]
    async fn post_filter_never_overrides_handler_error() {
        let inv = ScriptedInvoker::new()
            .respond("sample-1.0.0", ProxyResponse::new(500).with_body(b"boom".to_vec()));
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        let resp = exec
            .execute(
                &pipeline(vec![
                    handler_step("sample-1.0.0"),
                    filter_step("post-1.0.0", Phase::Post, RoutingType::RequestOnly),
                ]),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body, b"boom");
        let calls = inv.calls();
        assert_eq!(calls.last().unwrap().2.get(HANDLER_RESULT_HEADER).unwrap(), "500");
    }

    #[tokio::test]
    async fn unreachable_handler_is_bad_gateway_and_post_still_runs() {
        let inv = ScriptedInvoker::new();
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        let err = exec
            .execute(
                &pipeline(vec![
                    handler_step("lost-1.0.0"),
                    filter_step("post-1.0.0", Phase::Post, RoutingType::RequestOnly),
                ]),
                &mut ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadGateway(_)));
        let calls = inv.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2.get(HANDLER_RESULT_HEADER).unwrap(), "502");
    }

    #[tokio::test]
    async fn unreachable_post_filter_is_harmless() {
        let inv = ScriptedInvoker::new();
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        let resp = exec
            .execute(
                &pipeline(vec![
                    handler_step("sample-1.0.0"),
                    filter_step("lost-post-1.0.0", Phase::Post, RoutingType::RequestOnly),
                ]),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        // Only the handler got traced; the post filter never ran.
        assert_eq!(ctx.trace.len(), 1);
    }

    #[tokio::test]
    async fn module_selector_header_is_not_forwarded() {
        let inv = ScriptedInvoker::new();
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ctx();
        ctx.request
            .headers
            .insert(headers::MODULE_ID.to_string(), "sample-1.0.0".to_string());
        exec.execute(&pipeline(vec![handler_step("sample-1.0.0")]), &mut ctx)
            .await
            .unwrap();
        let calls = inv.calls();
        assert!(!calls[0].2.contains_key(headers::MODULE_ID));
        assert!(calls[0].2.contains_key(headers::TENANT));
    }

    #[tokio::test]
    async fn redirected_handler_keeps_query_string() {
        let inv = ScriptedInvoker::new();
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, ExecutorConfig::default());
        let mut ctx = ProxyContext::new(ProxyRequest::new(
            "r1",
            "roskilde",
            HttpMethod::Get,
            "/red?limit=10",
        ));
        let p = Pipeline {
            steps: vec![handler_step("sample-1.0.0")],
            handler_path: "/testb".into(),
        };
        exec.execute(&p, &mut ctx).await.unwrap();
        assert_eq!(inv.calls()[0].1, "/testb?limit=10");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_as_bad_gateway() {
        let inv = ScriptedInvoker::new().with_delay(Duration::from_secs(5));
        let config = ExecutorConfig {
            step_timeout: Duration::from_millis(100),
        };
        let exec = PipelineExecutor::new(&StaticDiscovery, &inv, config);
        let mut ctx = ctx();
        let err = exec
            .execute(&pipeline(vec![handler_step("sample-1.0.0")]), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadGateway(_)));
    }
}
