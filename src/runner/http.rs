use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::{Client, Method};
use serde_json::json;
use tracing::{debug, warn};

use crate::collection::parser::{
    executable_items, CollectionDocument, EnvironmentDocument, ExecutableItem,
};
use crate::run::model::HeaderEntry;
use crate::runner::script::{extract_tests, substitute};
use crate::runner::{
    AdapterError, AdapterEvent, AdapterSink, AssertionEvaluated, ExecutedItem, ExecutionAdapter,
    ExecutionHandle, RequestCompleted, RunDone, RunnerOptions,
};

/// Executes collection items one after another with `reqwest`.
#[derive(Default)]
pub struct HttpCollectionRunner;

impl HttpCollectionRunner {
    pub fn new() -> Self {
        HttpCollectionRunner
    }
}

impl ExecutionAdapter for HttpCollectionRunner {
    fn start(
        &self,
        collection: CollectionDocument,
        environment: Option<EnvironmentDocument>,
        options: RunnerOptions,
    ) -> Result<ExecutionHandle, AdapterError> {
        let items = executable_items(&collection);
        let mut variables = collection.variables();
        if let Some(environment) = environment {
            variables.extend(environment.variables());
        }
        let client = Client::builder()
            .danger_accept_invalid_certs(options.insecure)
            .build()
            .map_err(|err| AdapterError::Start(err.to_string()))?;

        let (handle, sink) = ExecutionHandle::pair();
        tokio::spawn(run_items(client, items, variables, options, sink));
        Ok(handle)
    }
}

struct Exchange {
    completed: RequestCompleted,
    transport_error: Option<String>,
}

async fn run_items(
    client: Client,
    items: Vec<ExecutableItem>,
    variables: HashMap<String, String>,
    options: RunnerOptions,
    mut sink: AdapterSink,
) {
    let mut executed = 0usize;
    let mut skipped = 0usize;
    let mut failed_assertions = 0usize;
    let mut failed_folder: Option<String> = None;
    let mut aborted = false;

    for (position, item) in items.iter().enumerate() {
        if sink.is_aborted() {
            aborted = true;
            break;
        }
        if options.bail && failed_folder.as_deref().is_some_and(|folder| in_folder(item, folder)) {
            debug!(path = %item.path, "skipping request after failure in its folder");
            skipped += 1;
            continue;
        }

        let delay = options.delay_request_ms.unwrap_or(0);
        if position > 0 && delay > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = sink.aborted() => {
                    aborted = true;
                    break;
                }
            }
        }

        let exchange = tokio::select! {
            exchange = execute(&client, item, &variables, &options) => exchange,
            _ = sink.aborted() => {
                aborted = true;
                break;
            }
        };
        executed += 1;

        let http_status = exchange.completed.http_status;
        let assertions: Vec<AssertionEvaluated> = match exchange.transport_error {
            Some(error) => vec![AssertionEvaluated {
                name: error.clone(),
                passed: false,
                error: Some(error),
            }],
            None => extract_tests(&item.test_script)
                .iter()
                .map(|test| test.evaluate(http_status))
                .collect(),
        };

        if !sink.emit(AdapterEvent::RequestCompleted(exchange.completed)).await {
            return;
        }
        for assertion in assertions {
            if !assertion.passed {
                failed_assertions += 1;
                failed_folder.get_or_insert_with(|| item.folder.clone());
            }
            if !sink.emit(AdapterEvent::AssertionEvaluated(assertion)).await {
                return;
            }
        }
    }

    let done = RunDone {
        error: None,
        aborted,
        summary: json!({
            "items": items.len(),
            "executed": executed,
            "skipped": skipped,
            "failedAssertions": failed_assertions,
        }),
    };
    sink.emit(AdapterEvent::Done(done)).await;
}

fn in_folder(item: &ExecutableItem, folder: &str) -> bool {
    folder.is_empty() || item.folder == folder || item.folder.starts_with(&format!("{folder}/"))
}

async fn execute(
    client: &Client,
    item: &ExecutableItem,
    variables: &HashMap<String, String>,
    options: &RunnerOptions,
) -> Exchange {
    let url = substitute(&item.url, variables);
    let started_at = Utc::now();
    let clock = Instant::now();

    let result = match Method::from_bytes(item.method.as_str().as_bytes()) {
        Ok(method) => {
            let mut request = client.request(method, &url);
            for (key, value) in &item.headers {
                request = request.header(substitute(key, variables), substitute(value, variables));
            }
            if let Some(body) = &item.body {
                request = request.body(substitute(body, variables));
            }
            if let Some(timeout) = options.timeout_request_ms.filter(|ms| *ms > 0) {
                request = request.timeout(Duration::from_millis(timeout));
            }
            send(request).await
        }
        Err(err) => Err(err.to_string()),
    };

    let latency_ms = clock.elapsed().as_millis() as u64;
    let ended_at = Utc::now();
    let item_ref = ExecutedItem {
        name: item.name.clone(),
        path: Some(item.path.clone()),
    };
    match result {
        Ok((status, headers, body)) => Exchange {
            completed: RequestCompleted {
                item: item_ref,
                http_status: status.as_u16(),
                status_text: status.canonical_reason().map(str::to_string),
                latency_ms,
                response_size: body.len() as u64,
                headers,
                body,
                started_at,
                ended_at,
            },
            transport_error: None,
        },
        Err(error) => {
            warn!(path = %item.path, %url, %error, "request failed without a response");
            Exchange {
                completed: RequestCompleted {
                    item: item_ref,
                    http_status: 0,
                    status_text: None,
                    latency_ms,
                    response_size: 0,
                    headers: vec![],
                    body: vec![],
                    started_at,
                    ended_at,
                },
                transport_error: Some(error),
            }
        }
    }
}

async fn send(
    request: reqwest::RequestBuilder,
) -> Result<(reqwest::StatusCode, Vec<HeaderEntry>, Vec<u8>), String> {
    let response = request.send().await.map_err(|err| err.to_string())?;
    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .map(|(key, value)| HeaderEntry {
            key: key.to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
        .collect();
    let body = response.bytes().await.map_err(|err| err.to_string())?;
    Ok((status, headers, body.to_vec()))
}
