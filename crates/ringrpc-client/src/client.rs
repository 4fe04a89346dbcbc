use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ringrpc_common::registry::{MethodDescriptor, ServiceDescriptor};
use ringrpc_common::{
    ErrorKind, Fault, Header, RequestId, Result, RingRpcError, ServiceId, TypeId, Value,
};
use tracing::{debug, warn};

use crate::context::ContextShared;
use crate::pool::ConnectionPool;

/// Outcome of one attempt of a call.
enum Attempt {
    Done(Value),
    /// The picked connection could not take the write; nothing was sent
    Unwritable,
    /// The server answered `ServiceBusy`
    Busy(RingRpcError),
    /// No answer: timed out or the connection died
    Retry {
        request_id: RequestId,
        connection_alive: bool,
    },
}

/// Client bound to one service.
///
/// Calls are routed by request id over the service's consistent-hash ring.
///
/// # Retries and duplicate execution
///
/// A call that gets no answer within `call_timeout`, or whose connection
/// drops, is sent again with a fresh request id, up to `max_retries` times.
/// The server may still execute the earlier attempt: the protocol cannot tell
/// "never received" from "executed but the answer was lost". Handlers behind
/// retried calls must tolerate running more than once.
///
/// `ServiceBusy` answers and unwritable connections are retried after a short
/// pause without using up the retry budget.
#[derive(Clone)]
pub struct RpcClient {
    ctx: Arc<ContextShared>,
    pool: ConnectionPool,
    service: Arc<ServiceDescriptor>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish_non_exhaustive()
    }
}

impl RpcClient {
    pub(crate) fn new(
        ctx: Arc<ContextShared>,
        pool: ConnectionPool,
        service: Arc<ServiceDescriptor>,
    ) -> Self {
        Self { ctx, pool, service }
    }

    pub fn service_id(&self) -> ServiceId {
        self.service.service_id()
    }

    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Looks up a method by name.
    pub fn method(&self, name: &str) -> Result<Arc<MethodDescriptor>> {
        self.service.method_by_name(name).ok_or_else(|| {
            RingRpcError::rpc(
                ErrorKind::ClientError,
                format!("service {} has no method {}", self.service.name(), name),
            )
        })
    }

    /// Calls method `name` with a single parameter.
    pub async fn call(&self, name: &str, parameter: Value) -> Result<Value> {
        let method = self.method(name)?;
        self.invoke(&method, parameter).await
    }

    /// Calls `method` with a single parameter and waits for its result.
    ///
    /// Callers needing several values must wrap them into one, for example
    /// a [`Value::Object`].
    ///
    /// # Errors
    ///
    /// - `Rpc` carrying the server's fault for any error kind but `ServiceBusy`
    /// - `RetriesExhausted` once `max_retries` resends got no answer
    /// - `Rpc` with kind `RpcClientStopping` once the context shuts down
    /// - `Rpc` with kind `ClientSerializerError` if the parameter cannot be encoded
    pub async fn invoke(&self, method: &Arc<MethodDescriptor>, parameter: Value) -> Result<Value> {
        let config = &self.ctx.config;
        let mut retries = 0u32;
        let mut paused = Duration::ZERO;

        loop {
            if self.ctx.is_stopping() {
                return Err(ContextShared::stopping_error());
            }

            match self.attempt(method, &parameter).await? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Busy(err) => {
                    debug!("{}; retrying after {:?}", err, config.unwritable_pause);
                    tokio::time::sleep(config.unwritable_pause).await;
                }
                Attempt::Unwritable if paused < config.call_timeout => {
                    tokio::time::sleep(config.unwritable_pause).await;
                    paused += config.unwritable_pause;
                }
                Attempt::Unwritable => {
                    // waited a whole call timeout for a writable connection
                    paused = Duration::ZERO;
                    if retries >= config.max_retries {
                        return Err(RingRpcError::RetriesExhausted {
                            attempts: retries + 1,
                            request_id: 0,
                        });
                    }
                    retries += 1;
                }
                Attempt::Retry {
                    request_id,
                    connection_alive,
                } => {
                    if retries >= config.max_retries {
                        return Err(RingRpcError::RetriesExhausted {
                            attempts: retries + 1,
                            request_id,
                        });
                    }
                    retries += 1;
                    if connection_alive {
                        warn!(
                            "Request {} to {}.{} timed out; resending ({}/{}), it may execute twice",
                            request_id,
                            self.service.name(),
                            method.name(),
                            retries,
                            config.max_retries
                        );
                    } else {
                        warn!(
                            "Connection dropped under request {} to {}.{}; resending ({}/{})",
                            request_id,
                            self.service.name(),
                            method.name(),
                            retries,
                            config.max_retries
                        );
                    }
                }
            }
        }
    }

    async fn attempt(&self, method: &Arc<MethodDescriptor>, parameter: &Value) -> Result<Attempt> {
        let request_id = self.ctx.ids.next_id();
        let conn = match self.pool.pick(request_id) {
            Some(conn) if conn.is_writable() => conn,
            _ => return Ok(Attempt::Unwritable),
        };

        let header = Header::new(
            method.service_id(),
            request_id,
            method.method_id(),
            TypeId::Object,
        );
        let mut buf = BytesMut::new();
        self.ctx
            .codec
            .encode_value(header, method.parameter_serializer(), parameter, &mut buf)
            .map_err(|e| RingRpcError::Rpc {
                fault: Fault::new(ErrorKind::ClientSerializerError, e.to_string()),
                request: Some(header.request_ref()),
            })?;

        let rx = self.ctx.pending.register(request_id, method.clone());
        conn.track_request(request_id);
        if conn.send(buf.freeze()).is_err() {
            conn.untrack_request(request_id);
            self.ctx.pending.remove(request_id);
            return Ok(Attempt::Unwritable);
        }

        let outcome = tokio::time::timeout(self.ctx.config.call_timeout, rx).await;
        conn.untrack_request(request_id);

        match outcome {
            Ok(Ok(Ok(value))) => Ok(Attempt::Done(value)),
            Ok(Ok(Err(err))) if err.kind() == ErrorKind::ServiceBusy => Ok(Attempt::Busy(err)),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => {
                // the connection dropped the call, or the context is stopping
                if self.ctx.is_stopping() {
                    return Err(ContextShared::stopping_error());
                }
                Ok(Attempt::Retry {
                    request_id,
                    connection_alive: false,
                })
            }
            Err(_) => {
                self.ctx.pending.remove(request_id);
                Ok(Attempt::Retry {
                    request_id,
                    connection_alive: conn.is_active(),
                })
            }
        }
    }
}
