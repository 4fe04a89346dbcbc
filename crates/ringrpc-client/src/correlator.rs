//! Request correlator: maps outstanding request ids to waiting callers.

use std::sync::Arc;

use dashmap::DashMap;
use ringrpc_common::registry::MethodDescriptor;
use ringrpc_common::{ErrorKind, Fault, Frame, RequestId, Result, RingRpcError, TypeId, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A call waiting for its response frame.
struct PendingCall {
    method: Arc<MethodDescriptor>,
    tx: oneshot::Sender<Result<Value>>,
}

/// Table of pending calls keyed by request id.
///
/// Entries are created when a request is written and removed exactly once:
/// by the response, by the caller giving up, or by the shutdown sweep.
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<RequestId, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call and returns the receiver its result arrives on.
    ///
    /// The method descriptor is kept so the response body can be decoded with
    /// the method's return serializer.
    pub fn register(
        &self,
        request_id: RequestId,
        method: Arc<MethodDescriptor>,
    ) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(request_id, PendingCall { method, tx });
        rx
    }

    /// Drops a call without resolving it. Returns false if it was already gone.
    pub fn remove(&self, request_id: RequestId) -> bool {
        self.calls.remove(&request_id).is_some()
    }

    /// Resolves the call a response frame belongs to.
    ///
    /// Decoding failures resolve that one call to a `ClientSerializerError`
    /// instead of failing the connection.
    ///
    /// # Returns
    ///
    /// `false` on a correlator miss: the call already timed out or never existed.
    pub fn resolve(&self, frame: Frame) -> bool {
        let request_id = frame.header.request_id;
        let Some((_, call)) = self.calls.remove(&request_id) else {
            warn!(
                "No pending call for {} response to request {}; caller already gave up",
                frame.header.type_id, request_id
            );
            return false;
        };

        let request = frame.header.request_ref();
        let result = match frame.header.type_id {
            TypeId::Normal => call
                .method
                .return_serializer()
                .deserialize(&frame.body)
                .map_err(|e| RingRpcError::Rpc {
                    fault: Fault::new(ErrorKind::ClientSerializerError, e.to_string()),
                    request: Some(request),
                }),
            TypeId::Empty => Ok(Value::Empty),
            TypeId::Abnormal => {
                let fault = Fault::decode(&frame.body).unwrap_or_else(|e| {
                    Fault::new(
                        ErrorKind::ClientSerializerError,
                        format!("undecodable error body: {}", e),
                    )
                });
                Err(RingRpcError::Rpc {
                    fault,
                    request: Some(request),
                })
            }
            other => Err(RingRpcError::Rpc {
                fault: Fault::new(
                    ErrorKind::NotSupportType,
                    format!("{} is not a response type", other),
                ),
                request: Some(request),
            }),
        };

        if call.tx.send(result).is_err() {
            debug!("Caller for request {} dropped before its response", request_id);
        }
        true
    }

    /// Resolves one call to an error.
    pub fn fail(&self, request_id: RequestId, err: RingRpcError) -> bool {
        match self.calls.remove(&request_id) {
            Some((_, call)) => {
                let _ = call.tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fails every pending call with `fault`. Used on shutdown.
    ///
    /// # Returns
    ///
    /// The number of calls failed.
    pub fn fail_all(&self, fault: &Fault) -> usize {
        let ids: Vec<RequestId> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for request_id in ids {
            if self.fail(request_id, RingRpcError::from(fault.clone())) {
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.calls.contains_key(&request_id)
    }
}
