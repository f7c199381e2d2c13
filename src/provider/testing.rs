//! Scripted in-process provider for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;

use super::{CallProvider, CreateCallRequest, ProviderCall, ProviderError};
use crate::util::format_ts;

#[derive(Default)]
pub struct FakeProvider {
    calls: Mutex<HashMap<String, Result<ProviderCall, ProviderError>>>,
    create_failures: Mutex<HashMap<String, ProviderError>>,
    created: Mutex<Vec<CreateCallRequest>>,
    next_id: AtomicUsize,
    get_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_call` fail for this (raw) customer number.
    pub fn fail_create_for(&self, customer_number: &str, err: ProviderError) {
        self.create_failures
            .lock()
            .insert(customer_number.to_string(), err);
    }

    /// Script the response of `get_call` for `call.id`.
    pub fn set_call(&self, call: ProviderCall) {
        self.calls.lock().insert(call.id.clone(), Ok(call));
    }

    pub fn set_call_error(&self, call_id: &str, err: ProviderError) {
        self.calls.lock().insert(call_id.to_string(), Err(err));
    }

    /// Script an ended call lasting `seconds` with the given end reason.
    pub fn end_call(&self, call_id: &str, reason: &str, seconds: i64) {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        self.set_call(ProviderCall {
            id: call_id.to_string(),
            status: Some("ended".to_string()),
            ended_reason: Some(reason.to_string()),
            started_at: Some(format_ts(start)),
            ended_at: Some(format_ts(start + Duration::seconds(seconds))),
            ..ProviderCall::default()
        });
    }

    pub fn created_requests(&self) -> Vec<CreateCallRequest> {
        self.created.lock().clone()
    }

    pub fn get_call_count(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallProvider for FakeProvider {
    async fn create_call(&self, request: &CreateCallRequest) -> Result<String, ProviderError> {
        self.created.lock().push(request.clone());
        if let Some(err) = self.create_failures.lock().get(&request.customer_number) {
            return Err(err.clone());
        }
        let id = format!("call-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.calls.lock().entry(id.clone()).or_insert_with(|| {
            Ok(ProviderCall {
                id: id.clone(),
                status: Some("queued".to_string()),
                ..ProviderCall::default()
            })
        });
        Ok(id)
    }

    async fn get_call(&self, call_id: &str) -> Result<ProviderCall, ProviderError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .get(call_id)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::NotFound(call_id.to_string())))
    }
}
